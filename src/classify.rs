//! Content categories derived from detected object classes.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::detect::DetectionSet;

/// Class names that count as a product on display.
pub const PRODUCT_CLASSES: [&str; 4] = ["bottle", "cup", "bowl", "wine glass"];
pub const PERSON_CLASS: &str = "person";

/// Coarse intent of a post image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentCategory {
    Promotional,
    ProductDisplay,
    Lifestyle,
    Other,
}

impl ContentCategory {
    pub const ALL: [ContentCategory; 4] = [
        ContentCategory::Promotional,
        ContentCategory::ProductDisplay,
        ContentCategory::Lifestyle,
        ContentCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContentCategory::Promotional => "promotional",
            ContentCategory::ProductDisplay => "product_display",
            ContentCategory::Lifestyle => "lifestyle",
            ContentCategory::Other => "other",
        }
    }
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| format!("unknown image category '{}'", s))
    }
}

/// Map a detection set to its content category.
///
/// Only the presence of class names matters; confidences, counts and order are
/// ignored. Names compare case-insensitively. First match wins:
/// person + product, product, person, otherwise `Other`.
pub fn classify(detections: &DetectionSet) -> ContentCategory {
    let names: HashSet<String> = detections
        .iter()
        .map(|d| d.class_name.to_lowercase())
        .collect();

    let has_person = names.contains(PERSON_CLASS);
    let has_product = PRODUCT_CLASSES.iter().any(|class| names.contains(*class));

    match (has_person, has_product) {
        (true, true) => ContentCategory::Promotional,
        (false, true) => ContentCategory::ProductDisplay,
        (true, false) => ContentCategory::Lifestyle,
        (false, false) => ContentCategory::Other,
    }
}
