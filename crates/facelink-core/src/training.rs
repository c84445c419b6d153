//! Offline training data loader for the metric network.
//!
//! A dataset is a directory with one subdirectory of images per identity.
//! Loader threads keep sampling augmented mini-batches into a bounded queue
//! while a single consumer feeds them to a [`MetricTrainer`] until its
//! learning rate falls below a floor.

use crate::jitter::{disturb_colors, jitter_image};
use crossbeam_channel::{bounded, Receiver, Sender};
use image::{ImageFormat, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("mini-batch needs {needed} identities, dataset has {available}")]
    NotEnoughIdentities { needed: usize, available: usize },
    #[error("images in one mini-batch must share dimensions: {expected:?} vs {found:?} ({path})")]
    MixedImageSizes {
        expected: (u32, u32),
        found: (u32, u32),
        path: String,
    },
    #[error("all loader threads stopped before training finished")]
    LoadersStopped,
    #[error("trainer: {0}")]
    Trainer(String),
}

/// Image files of one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityImages {
    pub name: String,
    pub images: Vec<PathBuf>,
}

/// Images with their identity labels (indices into the dataset list).
#[derive(Debug, Clone)]
pub struct MiniBatch {
    pub images: Vec<RgbImage>,
    pub labels: Vec<usize>,
}

impl MiniBatch {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// A metric-learning network being trained.
pub trait MetricTrainer {
    fn learning_rate(&self) -> f64;

    /// One gradient step on `batch`.
    fn step(&mut self, batch: MiniBatch) -> Result<(), TrainingError>;

    /// Persist the trained network.
    fn save(&mut self, path: &Path) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub people_per_batch: usize,
    pub samples_per_identity: usize,
    pub loader_threads: usize,
    pub queue_depth: usize,
    pub learning_rate_floor: f64,
    /// A loader thread gives up after this many failed batches in a row.
    pub max_loader_failures: usize,
    pub output_path: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            people_per_batch: 5,
            samples_per_identity: 5,
            loader_threads: 5,
            queue_depth: 4,
            learning_rate_floor: 1e-4,
            max_loader_failures: 10,
            output_path: PathBuf::from("metric_network_resnet.dat"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingSummary {
    pub steps: usize,
}

fn is_image(path: &Path) -> bool {
    path.is_file() && ImageFormat::from_path(path).is_ok()
}

/// List identities under `dir`, one per subdirectory that holds images.
///
/// Identities and their images are sorted by name.
pub fn load_objects_list(dir: &Path) -> Result<Vec<IdentityImages>, TrainingError> {
    let mut identities = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }

        let mut images: Vec<PathBuf> = std::fs::read_dir(&path)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| is_image(p))
            .collect();
        if images.is_empty() {
            continue;
        }
        images.sort();

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        identities.push(IdentityImages { name, images });
    }
    identities.sort_by(|a, b| a.name.cmp(&b.name));

    tracing::info!(dir = %dir.display(), identities = identities.len(), "dataset listed");
    Ok(identities)
}

/// Sample `num_people` distinct identities and `samples_per_id` images of
/// each (with replacement), then augment every image.
///
/// Every image in the batch must have the same dimensions.
pub fn load_mini_batch<R: Rng + ?Sized>(
    objects: &[IdentityImages],
    num_people: usize,
    samples_per_id: usize,
    rng: &mut R,
) -> Result<MiniBatch, TrainingError> {
    if num_people > objects.len() {
        return Err(TrainingError::NotEnoughIdentities {
            needed: num_people,
            available: objects.len(),
        });
    }

    let mut batch = MiniBatch {
        images: Vec::with_capacity(num_people * samples_per_id),
        labels: Vec::with_capacity(num_people * samples_per_id),
    };
    let mut dims: Option<(u32, u32)> = None;

    for id in rand::seq::index::sample(rng, objects.len(), num_people) {
        let identity = &objects[id];
        if identity.images.is_empty() {
            continue;
        }
        for _ in 0..samples_per_id {
            let path = &identity.images[rng.gen_range(0..identity.images.len())];
            let image = image::open(path)?.to_rgb8();

            let found = image.dimensions();
            match dims {
                Some(expected) if expected != found => {
                    return Err(TrainingError::MixedImageSizes {
                        expected,
                        found,
                        path: path.display().to_string(),
                    });
                }
                _ => dims = Some(found),
            }

            batch.images.push(image);
            batch.labels.push(id);
        }
    }

    for image in &mut batch.images {
        disturb_colors(image, rng);
        if rng.gen::<f64>() > 0.1 {
            *image = jitter_image(image, rng);
        }
    }

    Ok(batch)
}

fn run_loader(
    objects: &[IdentityImages],
    config: &TrainingConfig,
    running: &AtomicBool,
    tx: Sender<MiniBatch>,
) {
    let mut rng = StdRng::from_entropy();
    let mut failures = 0;

    while running.load(Ordering::Relaxed) {
        match load_mini_batch(objects, config.people_per_batch, config.samples_per_identity, &mut rng) {
            Ok(batch) => {
                failures = 0;
                // Blocks while the queue is full; errors once the consumer is gone.
                if tx.send(batch).is_err() {
                    break;
                }
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(error = %err, failures, "mini-batch load failed");
                if failures >= config.max_loader_failures {
                    tracing::warn!("loader thread giving up");
                    break;
                }
            }
        }
    }
}

fn consume(
    trainer: &mut dyn MetricTrainer,
    rx: &Receiver<MiniBatch>,
    floor: f64,
) -> Result<usize, TrainingError> {
    let mut steps = 0;
    while trainer.learning_rate() >= floor {
        let batch = rx.recv().map_err(|_| TrainingError::LoadersStopped)?;
        trainer.step(batch)?;
        steps += 1;
        if steps % 100 == 0 {
            tracing::info!(steps, learning_rate = trainer.learning_rate(), "training progress");
        }
    }
    Ok(steps)
}

/// Train `trainer` on mini-batches sampled from `objects` until its learning
/// rate drops below the configured floor, then save it.
///
/// Loader threads are stopped and joined before returning, on success and
/// on error alike.
pub fn train(
    objects: &[IdentityImages],
    trainer: &mut dyn MetricTrainer,
    config: &TrainingConfig,
) -> Result<TrainingSummary, TrainingError> {
    if config.people_per_batch > objects.len() {
        return Err(TrainingError::NotEnoughIdentities {
            needed: config.people_per_batch,
            available: objects.len(),
        });
    }

    let running = AtomicBool::new(true);
    let (tx, rx) = bounded::<MiniBatch>(config.queue_depth.max(1));

    let steps = thread::scope(|scope| {
        let handles: Vec<_> = (0..config.loader_threads.max(1))
            .map(|_| {
                let tx = tx.clone();
                let running = &running;
                scope.spawn(move || run_loader(objects, config, running, tx))
            })
            .collect();
        drop(tx);

        let result = consume(trainer, &rx, config.learning_rate_floor);

        running.store(false, Ordering::Relaxed);
        drop(rx);
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("loader thread panicked");
            }
        }
        result
    })?;

    trainer.save(&config.output_path)?;
    tracing::info!(steps, path = %config.output_path.display(), "training finished");
    Ok(TrainingSummary { steps })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    /// `identities` subdirectories, each with `per_identity` PNGs of the given size.
    fn dataset(sizes: &[(u32, u32)], per_identity: usize) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (i, &(w, h)) in sizes.iter().enumerate() {
            let sub = dir.path().join(format!("person_{i}"));
            std::fs::create_dir(&sub).unwrap();
            for j in 0..per_identity {
                let img = RgbImage::from_pixel(w, h, Rgb([(i * 40) as u8, (j * 20) as u8, 90]));
                img.save(sub.join(format!("{j}.png"))).unwrap();
            }
            std::fs::write(sub.join("notes.txt"), "not an image").unwrap();
        }
        std::fs::write(dir.path().join("stray.png"), "top-level file").unwrap();
        dir
    }

    struct HalvingTrainer {
        rate: f64,
        steps: usize,
        batch_sizes: Vec<usize>,
        saved: Option<PathBuf>,
    }

    impl HalvingTrainer {
        fn new(rate: f64) -> Self {
            Self {
                rate,
                steps: 0,
                batch_sizes: Vec::new(),
                saved: None,
            }
        }
    }

    impl MetricTrainer for HalvingTrainer {
        fn learning_rate(&self) -> f64 {
            self.rate
        }

        fn step(&mut self, batch: MiniBatch) -> Result<(), TrainingError> {
            self.batch_sizes.push(batch.len());
            self.steps += 1;
            self.rate /= 2.0;
            Ok(())
        }

        fn save(&mut self, path: &Path) -> Result<(), TrainingError> {
            self.saved = Some(path.to_path_buf());
            Ok(())
        }
    }

    fn config(people: usize, samples: usize) -> TrainingConfig {
        TrainingConfig {
            people_per_batch: people,
            samples_per_identity: samples,
            loader_threads: 3,
            queue_depth: 2,
            max_loader_failures: 3,
            output_path: PathBuf::from("trained.dat"),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_objects_list() {
        let dir = dataset(&[(8, 8), (8, 8), (8, 8)], 2);
        std::fs::create_dir(dir.path().join("empty_person")).unwrap();

        let objects = load_objects_list(dir.path()).unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[0].name, "person_0");
        assert!(objects.iter().all(|o| o.images.len() == 2));
    }

    #[test]
    fn test_load_objects_list_missing_dir() {
        assert!(matches!(
            load_objects_list(Path::new("/nonexistent/dataset")),
            Err(TrainingError::Io(_))
        ));
    }

    #[test]
    fn test_mini_batch_shape_and_labels() {
        let dir = dataset(&[(12, 10), (12, 10), (12, 10), (12, 10)], 3);
        let objects = load_objects_list(dir.path()).unwrap();
        let mut rng = StdRng::seed_from_u64(5);

        let batch = load_mini_batch(&objects, 3, 2, &mut rng).unwrap();
        assert_eq!(batch.len(), 6);
        assert!(batch.images.iter().all(|img| img.dimensions() == (12, 10)));

        let mut people: Vec<usize> = batch.labels.clone();
        people.dedup();
        assert_eq!(people.len(), 3, "labels grouped per identity: {:?}", batch.labels);
        assert!(batch.labels.iter().all(|&l| l < 4));
    }

    #[test]
    fn test_mini_batch_needs_enough_identities() {
        let dir = dataset(&[(8, 8), (8, 8)], 1);
        let objects = load_objects_list(dir.path()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            load_mini_batch(&objects, 3, 1, &mut rng),
            Err(TrainingError::NotEnoughIdentities { needed: 3, available: 2 })
        ));
    }

    #[test]
    fn test_mini_batch_rejects_mixed_sizes() {
        let dir = dataset(&[(8, 8), (10, 8)], 2);
        let objects = load_objects_list(dir.path()).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        assert!(matches!(
            load_mini_batch(&objects, 2, 1, &mut rng),
            Err(TrainingError::MixedImageSizes { .. })
        ));
    }

    #[test]
    fn test_train_until_learning_rate_floor() {
        let dir = dataset(&[(8, 8), (8, 8), (8, 8)], 2);
        let objects = load_objects_list(dir.path()).unwrap();
        let mut trainer = HalvingTrainer::new(1e-3);

        let summary = train(&objects, &mut trainer, &config(2, 2)).unwrap();

        // 1e-3, 5e-4, 2.5e-4, 1.25e-4 are above the floor.
        assert_eq!(summary.steps, 4);
        assert_eq!(trainer.steps, 4);
        assert!(trainer.batch_sizes.iter().all(|&n| n == 4));
        assert_eq!(trainer.saved, Some(PathBuf::from("trained.dat")));
    }

    #[test]
    fn test_train_stops_when_loaders_fail() {
        let dir = dataset(&[(8, 8), (9, 9)], 2);
        let objects = load_objects_list(dir.path()).unwrap();
        let mut trainer = HalvingTrainer::new(1.0);

        let result = train(&objects, &mut trainer, &config(2, 1));
        assert!(matches!(result, Err(TrainingError::LoadersStopped)));
        assert_eq!(trainer.steps, 0);
        assert!(trainer.saved.is_none());
    }

    #[test]
    fn test_train_rejects_small_dataset() {
        let dir = dataset(&[(8, 8)], 2);
        let objects = load_objects_list(dir.path()).unwrap();
        let mut trainer = HalvingTrainer::new(1.0);
        assert!(matches!(
            train(&objects, &mut trainer, &config(2, 1)),
            Err(TrainingError::NotEnoughIdentities { .. })
        ));
    }
}
