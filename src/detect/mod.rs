mod backend;
mod backends;
pub mod labels;
mod result;

pub use backend::{Detector, InferenceError};
pub use backends::StubDetector;
#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
pub use result::{
    round_to, Detection, DetectionSet, CONFIDENCE_DECIMALS, COORDINATE_DECIMALS,
};
