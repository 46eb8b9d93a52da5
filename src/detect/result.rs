use serde::{Deserialize, Serialize};

/// Decimal places kept for detection confidences.
pub const CONFIDENCE_DECIMALS: i32 = 3;
/// Decimal places kept for bounding box coordinates.
pub const COORDINATE_DECIMALS: i32 = 2;

/// Round half away from zero to a fixed number of decimal places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// One object found by the detection model.
///
/// Values are rounded on construction so serialized output is stable across
/// runs on the same weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    /// Model score in `0..=1`, rounded to [`CONFIDENCE_DECIMALS`].
    pub confidence: f64,
    /// `[x1, y1, x2, y2]` in source-image pixels, rounded to [`COORDINATE_DECIMALS`].
    #[serde(rename = "bbox")]
    pub bounding_box: [f64; 4],
}

impl Detection {
    pub fn new(
        class_id: u32,
        class_name: impl Into<String>,
        confidence: f64,
        bounding_box: [f64; 4],
    ) -> Self {
        Self {
            class_id,
            class_name: class_name.into(),
            confidence: round_to(confidence.clamp(0.0, 1.0), CONFIDENCE_DECIMALS),
            bounding_box: bounding_box.map(|v| round_to(v, COORDINATE_DECIMALS)),
        }
    }

    /// True when the confidence is in range and the box is finite with
    /// positive extent. NaN fails every check.
    pub fn is_well_formed(&self) -> bool {
        let [x1, y1, x2, y2] = self.bounding_box;
        (0.0..=1.0).contains(&self.confidence)
            && self.bounding_box.iter().all(|v| v.is_finite())
            && x1 < x2
            && y1 < y2
    }
}

/// All detections produced for one image, in model output order.
///
/// An empty set means the model found nothing; it is not an error.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionSet(Vec<Detection>);

impl DetectionSet {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self(detections)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Detection] {
        &self.0
    }

    /// The highest-confidence detection. Ties keep the earliest entry.
    pub fn representative(&self) -> Option<&Detection> {
        let mut best: Option<&Detection> = None;
        for detection in &self.0 {
            match best {
                Some(current) if detection.confidence > current.confidence => {
                    best = Some(detection)
                }
                Some(_) => {}
                None => best = Some(detection),
            }
        }
        best
    }

    /// First entry that fails [`Detection::is_well_formed`], if any.
    pub fn first_malformed(&self) -> Option<&Detection> {
        self.0.iter().find(|d| !d.is_well_formed())
    }

    /// Serialize as the JSON array stored in `all_detections`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

impl From<Vec<Detection>> for DetectionSet {
    fn from(detections: Vec<Detection>) -> Self {
        Self(detections)
    }
}

impl<'a> IntoIterator for &'a DetectionSet {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(name: &str, confidence: f64) -> Detection {
        Detection::new(0, name, confidence, [1.0, 2.0, 30.0, 40.0])
    }

    #[test]
    fn new_rounds_confidence_and_coordinates() {
        let d = Detection::new(39, "bottle", 0.876_54, [10.004, 20.005_1, 110.126, 220.999]);
        assert_eq!(d.confidence, 0.877);
        assert_eq!(d.bounding_box, [10.0, 20.01, 110.13, 221.0]);
    }

    #[test]
    fn representative_prefers_first_of_tied_maxima() {
        let set = DetectionSet::new(vec![det("cup", 0.4), det("person", 0.91), det("bottle", 0.91)]);
        let rep = set.representative().unwrap();
        assert_eq!(rep.class_name, "person");
        assert_eq!(rep.confidence, 0.91);
    }

    #[test]
    fn representative_of_empty_set_is_none() {
        assert!(DetectionSet::empty().representative().is_none());
    }

    #[test]
    fn json_round_trip_preserves_rounded_values() {
        let set = DetectionSet::new(vec![
            Detection::new(0, "person", 0.912_345, [0.111, 5.556, 100.499, 200.0]),
            Detection::new(47, "wine glass", 0.5, [3.0, 4.0, 5.0, 6.0]),
        ]);
        let json = set.to_json().unwrap();
        assert!(json.contains("\"bbox\""));
        let back = DetectionSet::from_json(&json).unwrap();
        assert_eq!(back, set);
        assert_eq!(back.as_slice()[0].confidence, 0.912);
        assert_eq!(back.as_slice()[0].bounding_box, [0.11, 5.56, 100.5, 200.0]);
    }

    #[test]
    fn empty_set_serializes_as_empty_array() {
        assert_eq!(DetectionSet::empty().to_json().unwrap(), "[]");
    }

    #[test]
    fn well_formed_rejects_degenerate_boxes() {
        let d = Detection::new(0, "person", 0.5, [5.0, 5.0, 5.0, 10.0]);
        assert!(!d.is_well_formed());
        assert!(det("person", 0.5).is_well_formed());
    }

    #[test]
    fn well_formed_rejects_non_finite_values() {
        assert!(!det("cup", f64::NAN).is_well_formed());
        let unbounded = Detection::new(0, "cup", 0.5, [f64::NEG_INFINITY, 0.0, 10.0, 10.0]);
        assert!(!unbounded.is_well_formed());
        let nan_box = Detection::new(0, "cup", 0.5, [0.0, f64::NAN, 10.0, 10.0]);
        assert!(!nan_box.is_well_formed());
    }

    #[test]
    fn nan_confidence_never_becomes_representative() {
        let set = DetectionSet::new(vec![det("bottle", 0.8), det("cup", f64::NAN)]);
        assert_eq!(set.representative().unwrap().class_name, "bottle");
        assert_eq!(set.first_malformed().unwrap().class_name, "cup");
        assert!(DetectionSet::new(vec![det("bottle", 0.8)])
            .first_malformed()
            .is_none());
    }
}
