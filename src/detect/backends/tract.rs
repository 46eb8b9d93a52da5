#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::config::DetectorSettings;
use crate::detect::backend::{Detector, InferenceError};
use crate::detect::labels;
use crate::detect::result::{Detection, DetectionSet};

const BOX_CHANNELS: usize = 4;
const LETTERBOX_FILL: u8 = 114;

/// Tract-based backend for YOLOv8-style ONNX exports.
///
/// The model is loaded and optimized once; `infer` only reads it, so one
/// instance serves every worker of a run.
pub struct TractDetector {
    model: TypedRunnableModel<TypedModel>,
    settings: DetectorSettings,
}

/// Mapping from letterboxed model space back to source-image pixels.
#[derive(Clone, Copy, Debug)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    src_w: f32,
    src_h: f32,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    class_id: u32,
    score: f32,
    bbox: [f32; 4],
}

impl TractDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, settings: DetectorSettings) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = settings.input_size as usize;
        log::info!("loading detection model {}", model_path.display());
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        log::info!("detection model ready (input {}x{})", size, size);

        Ok(Self { model, settings })
    }

    fn build_input(&self, image: &RgbImage) -> (Tensor, Letterbox) {
        let size = self.settings.input_size;
        let (src_w, src_h) = image.dimensions();
        let scale = (size as f32 / src_w as f32).min(size as f32 / src_h as f32);
        let new_w = ((src_w as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((src_h as f32 * scale).round() as u32).clamp(1, size);
        let pad_x = (size - new_w) / 2;
        let pad_y = (size - new_h) / 2;

        let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
        let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
        image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

        let side = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });

        let letterbox = Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
            src_w: src_w as f32,
            src_h: src_h as f32,
        };
        (input.into_tensor(), letterbox)
    }

    fn decode(&self, outputs: TVec<TValue>, letterbox: Letterbox) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let view = view
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not rank 3")?;

        // YOLOv8 exports emit [1, 4 + classes, anchors]; some exports transpose it.
        let channels_first = shape[1] < shape[2];
        let (channels, anchors) = if channels_first {
            (shape[1], shape[2])
        } else {
            (shape[2], shape[1])
        };
        if channels <= BOX_CHANNELS {
            return Err(anyhow!("model output has no class scores: {:?}", shape));
        }
        let at = |channel: usize, anchor: usize| -> f32 {
            if channels_first {
                view[(0, channel, anchor)]
            } else {
                view[(0, anchor, channel)]
            }
        };

        let threshold = self.settings.confidence_threshold;
        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let mut best_class = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for class in 0..channels - BOX_CHANNELS {
                let score = at(BOX_CHANNELS + class, anchor);
                if score > best_score {
                    best_score = score;
                    best_class = class;
                }
            }
            if !best_score.is_finite() || best_score < threshold {
                continue;
            }
            let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
            candidates.push(Candidate {
                class_id: best_class as u32,
                score: best_score,
                bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            });
        }

        let kept = non_max_suppression(
            candidates,
            self.settings.iou_threshold,
            self.settings.max_detections,
        );

        Ok(kept
            .into_iter()
            .map(|candidate| {
                let bbox = letterbox.to_source(candidate.bbox);
                Detection::new(
                    candidate.class_id,
                    labels::class_name(candidate.class_id),
                    candidate.score as f64,
                    bbox,
                )
            })
            .filter(Detection::is_well_formed)
            .collect())
    }

    fn run(&self, image: &Path) -> Result<DetectionSet> {
        let decoded = image::open(image)
            .with_context(|| format!("failed to decode image {}", image.display()))?
            .to_rgb8();
        let (input, letterbox) = self.build_input(&decoded);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        Ok(DetectionSet::new(self.decode(outputs, letterbox)?))
    }
}

impl Letterbox {
    fn to_source(self, bbox: [f32; 4]) -> [f64; 4] {
        let x = |v: f32| ((v - self.pad_x) / self.scale).clamp(0.0, self.src_w) as f64;
        let y = |v: f32| ((v - self.pad_y) / self.scale).clamp(0.0, self.src_h) as f64;
        [x(bbox[0]), y(bbox[1]), x(bbox[2]), y(bbox[3])]
    }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);
    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Greedy per-class NMS. Output is ordered by descending score.
fn non_max_suppression(
    mut candidates: Vec<Candidate>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let overlaps = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

impl Detector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&self, image: &Path) -> Result<DetectionSet, InferenceError> {
        self.run(image)
            .map_err(|e| InferenceError::new(image, format!("{:#}", e)))
    }
}
