use std::collections::HashMap;
use std::path::Path;

use crate::detect::backend::{Detector, InferenceError};
use crate::detect::result::{Detection, DetectionSet};

/// Scripted backend for tests and dry runs.
///
/// Detections are keyed by file name (`"1001.jpg"`). Unknown files produce an
/// empty set; files registered with [`StubDetector::fail_on`] produce an
/// [`InferenceError`].
#[derive(Clone, Debug, Default)]
pub struct StubDetector {
    scripted: HashMap<String, Vec<Detection>>,
    failures: HashMap<String, String>,
}

impl StubDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the detections returned for a file name.
    pub fn with_detections(mut self, file_name: &str, detections: Vec<Detection>) -> Self {
        self.scripted.insert(file_name.to_string(), detections);
        self
    }

    /// Make inference fail for a file name.
    pub fn fail_on(mut self, file_name: &str, message: &str) -> Self {
        self.failures
            .insert(file_name.to_string(), message.to_string());
        self
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&self, image: &Path) -> Result<DetectionSet, InferenceError> {
        let file_name = image
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| InferenceError::new(image, "path has no file name"))?;

        if let Some(message) = self.failures.get(file_name) {
            return Err(InferenceError::new(image, message));
        }
        if !image.is_file() {
            return Err(InferenceError::new(image, "image file not found"));
        }

        Ok(self
            .scripted
            .get(file_name)
            .cloned()
            .map(DetectionSet::new)
            .unwrap_or_default())
    }
}
