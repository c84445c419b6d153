mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use facelink_core::training::{load_mini_batch, load_objects_list};
use facelink_core::{
    FacePosePipeline, FaceRecognitionPipeline, Frame, ModelSource, OverlapAssigner, PipelineConfig,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facelink", about = "Face pose points and face recognition on still frames")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Frame adjustment codes; unset values come from the config.
#[derive(Args, Clone)]
struct AdjustArgs {
    /// Source color space: 0 RGB, 1 BGR, 2 RGBA, 3 YUV, 4 Gray
    #[arg(long)]
    color_space: Option<i32>,
    /// Uniform resize factor (<= 0 disables)
    #[arg(long)]
    scale: Option<f64>,
    /// 0 = 90° clockwise, 1 = 180°, 2 = 90° counter-clockwise
    #[arg(long, allow_hyphen_values = true)]
    rotation: Option<i32>,
    /// 0 = vertical, 1 = horizontal, -1 = both
    #[arg(long, allow_hyphen_values = true)]
    flip: Option<i32>,
}

impl AdjustArgs {
    fn apply(&self, pipeline: &mut PipelineConfig) {
        if let Some(v) = self.color_space {
            pipeline.color_space = v;
        }
        if let Some(v) = self.scale {
            pipeline.scale_factor = v;
        }
        if let Some(v) = self.rotation {
            pipeline.rotation = v;
        }
        if let Some(v) = self.flip {
            pipeline.flip = v;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Adjust a frame and write it as BMP
    Adjust {
        input: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        adjust: AdjustArgs,
    },
    /// Print smoothed pose points for each face
    Points {
        /// Frames processed in order; smoothing carries across them
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Report 68 landmarks instead of rectangle corners
        #[arg(long)]
        landmarks: bool,
        /// Keep each face in the slot it overlapped on the previous frame
        #[arg(long)]
        track_overlap: bool,
        #[command(flatten)]
        adjust: AdjustArgs,
    },
    /// Draw pose overlays and write the frame as BMP
    Render {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        landmarks: bool,
        #[command(flatten)]
        adjust: AdjustArgs,
    },
    /// Enroll the single face in a frame
    Enroll {
        input: PathBuf,
        /// Display name for the identity
        #[arg(short, long)]
        name: String,
        /// Write the face chip here as BMP
        #[arg(long)]
        crop: Option<PathBuf>,
        #[command(flatten)]
        adjust: AdjustArgs,
    },
    /// Recognize enrolled faces in a frame
    Compare {
        input: PathBuf,
        /// Directory receiving one BMP chip per recognized face
        #[arg(long)]
        crops: Option<PathBuf>,
        #[command(flatten)]
        adjust: AdjustArgs,
    },
    /// List enrolled identities
    List,
    /// Sample one training mini-batch from a dataset directory
    Dataset {
        dir: PathBuf,
        #[arg(long, default_value_t = 5)]
        people: usize,
        #[arg(long, default_value_t = 5)]
        samples: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    match cli.command {
        Commands::Adjust { input, output, adjust } => {
            adjust.apply(&mut config.pipeline);
            let pipeline = FacePosePipeline::new(config.pipeline.clone());
            let bytes = pipeline.adjust_and_encode(&mut read_frame(&input)?);
            write_output(&output, &bytes)?;
        }
        Commands::Points {
            inputs,
            landmarks,
            track_overlap,
            adjust,
        } => {
            adjust.apply(&mut config.pipeline);
            config.pipeline.rectangle_only = !landmarks;
            let mut pipeline = pose_pipeline(&config);
            if track_overlap {
                pipeline.set_assigner(Box::new(OverlapAssigner::default()));
            }
            for input in &inputs {
                let pose = pipeline.detect(&mut read_frame(input)?);
                println!(
                    "{}",
                    serde_json::json!({
                        "frame": input.display().to_string(),
                        "faces": pose.face_count(),
                        "points": pose.flatten(),
                    })
                );
            }
        }
        Commands::Render {
            input,
            output,
            landmarks,
            adjust,
        } => {
            adjust.apply(&mut config.pipeline);
            config.pipeline.rectangle_only = !landmarks;
            let mut pipeline = pose_pipeline(&config);
            let bytes = pipeline.render_pose(&mut read_frame(&input)?);
            write_output(&output, &bytes)?;
        }
        Commands::Enroll {
            input,
            name,
            crop,
            adjust,
        } => {
            adjust.apply(&mut config.pipeline);
            let pipeline = recognition_pipeline(&config)?;
            let Some(outcome) = pipeline.enroll(&mut read_frame(&input)?, &name) else {
                anyhow::bail!("enrollment needs a frame with exactly one recognizable face");
            };

            if outcome.already_exists {
                println!("Face already enrolled as {:?}", outcome.name);
            } else {
                pipeline.save_registry(&config.registry_path)?;
                println!("Enrolled {:?} at {:?}", outcome.name, outcome.rect);
            }
            if let Some(path) = crop {
                write_output(&path, &outcome.crop_bmp)?;
            }
        }
        Commands::Compare { input, crops, adjust } => {
            adjust.apply(&mut config.pipeline);
            let pipeline = recognition_pipeline(&config)?;
            let faces = pipeline.compare(&mut read_frame(&input)?);

            println!("{} known face(s)", faces.len());
            for (i, face) in faces.iter().enumerate() {
                println!("  {:<20} distance {:.3}  {:?}", face.name, face.distance, face.rect);
                if let Some(dir) = &crops {
                    std::fs::create_dir_all(dir)?;
                    write_output(&dir.join(format!("{i}_{}.bmp", face.name)), &face.crop_bmp)?;
                }
            }
        }
        Commands::List => {
            let pipeline = FaceRecognitionPipeline::new(config.pipeline.clone());
            pipeline.load_registry(&config.registry_path)?;
            let registry = pipeline.registry();
            if registry.is_empty() {
                println!("No identities enrolled");
            }
            for record in registry.records() {
                println!("{}  {:<20} {}", record.id, record.name, record.enrolled_at.to_rfc3339());
            }
        }
        Commands::Dataset { dir, people, samples } => {
            let objects = load_objects_list(&dir)?;
            let images: usize = objects.iter().map(|o| o.images.len()).sum();
            println!("{} identities, {} images", objects.len(), images);

            let batch = load_mini_batch(&objects, people, samples, &mut rand::thread_rng())?;
            let dims = batch.images.first().map(|img| img.dimensions());
            println!("sampled mini-batch: {} images of {:?}", batch.len(), dims);
        }
    }

    Ok(())
}

fn read_frame(path: &Path) -> Result<Frame> {
    let image = image::open(path).with_context(|| format!("reading frame {}", path.display()))?;
    Ok(Frame::from_image(image))
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        tracing::warn!(path = %path.display(), "nothing to write");
        return Ok(());
    }
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

/// Build the pose pipeline. Models that fail to load leave it unusable,
/// which shows as zero faces.
fn pose_pipeline(config: &Config) -> FacePosePipeline {
    let mut pipeline = FacePosePipeline::new(config.pipeline.clone());
    let detector = ModelSource::path(config.detector_model_path());
    if let Err(err) = pipeline.load_detector(&detector, config.intra_threads) {
        tracing::warn!(error = %err, "detector unavailable");
    }
    if !config.pipeline.rectangle_only {
        let landmarks = ModelSource::path(config.landmark_model_path());
        if let Err(err) = pipeline.load_predictor(&landmarks, config.intra_threads) {
            tracing::warn!(error = %err, "landmark predictor unavailable");
        }
    }
    pipeline
}

fn recognition_pipeline(config: &Config) -> Result<FaceRecognitionPipeline> {
    let mut pipeline = FaceRecognitionPipeline::new(config.pipeline.clone());
    let threads = config.intra_threads;

    if let Err(err) = pipeline.load_detector(&ModelSource::path(config.detector_model_path()), threads) {
        tracing::warn!(error = %err, "detector unavailable");
    }
    if let Err(err) = pipeline.load_predictor(&ModelSource::path(config.landmark_model_path()), threads) {
        tracing::warn!(error = %err, "landmark predictor unavailable");
    }
    if let Err(err) = pipeline.load_network(&ModelSource::path(config.embedding_model_path()), threads) {
        tracing::warn!(error = %err, "embedding network unavailable");
    }

    let known = pipeline.load_registry(&config.registry_path)?;
    tracing::info!(identities = known, ready = pipeline.is_ready(), "recognition pipeline built");
    Ok(pipeline)
}
