//! Model sources and ONNX Runtime session construction.

use ort::session::Session;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Where a pretrained model comes from: a file or an in-memory buffer.
#[derive(Clone)]
pub enum ModelSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl ModelSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(bytes.into())
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Path(p) => p.display().to_string(),
            Self::Bytes(b) => format!("<{} bytes in memory>", b.len()),
        }
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl From<&Path> for ModelSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for ModelSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    NotFound(String),
    #[error("model buffer is empty")]
    Empty,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Build an ONNX Runtime session from `source`.
pub fn load_session(source: &ModelSource, intra_threads: usize) -> Result<Session, ModelError> {
    match source {
        ModelSource::Path(path) if !path.exists() => {
            return Err(ModelError::NotFound(path.display().to_string()));
        }
        ModelSource::Bytes(bytes) if bytes.is_empty() => return Err(ModelError::Empty),
        _ => {}
    }

    let builder = Session::builder()?.with_intra_threads(intra_threads.max(1))?;
    let session = match source {
        ModelSource::Path(path) => builder.commit_from_file(path)?,
        ModelSource::Bytes(bytes) => builder.commit_from_memory(bytes)?,
    };

    tracing::info!(
        source = %source.describe(),
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );

    Ok(session)
}
