use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::detect::result::DetectionSet;

/// Failure to read, decode, or run the model on one image.
///
/// Recoverable: the aggregator counts it and skips the asset.
#[derive(Debug, Error)]
#[error("inference failed for {}: {message}", path.display())]
pub struct InferenceError {
    pub path: PathBuf,
    pub message: String,
}

impl InferenceError {
    pub fn new(path: &Path, message: impl std::fmt::Display) -> Self {
        Self {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

/// Object detector over image files.
///
/// The model behind a detector is loaded once and shared read-only for the
/// whole run, so `infer` takes `&self` and implementations must be callable
/// from several worker threads at once. An image with no objects yields an
/// empty [`DetectionSet`], never an error.
pub trait Detector: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one image.
    fn infer(&self, image: &Path) -> Result<DetectionSet, InferenceError>;
}

impl<D: Detector + ?Sized> Detector for &D {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn infer(&self, image: &Path) -> Result<DetectionSet, InferenceError> {
        (**self).infer(image)
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn infer(&self, image: &Path) -> Result<DetectionSet, InferenceError> {
        (**self).infer(image)
    }
}
