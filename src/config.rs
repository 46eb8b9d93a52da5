use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::warehouse::LoadMode;

const DEFAULT_MODEL_PATH: &str = "yolov8n.onnx";
const DEFAULT_IMAGE_DIR: &str = "data/raw/images";
const DEFAULT_IMAGE_EXTENSION: &str = "jpg";
const DEFAULT_STAGING_PATH: &str = "data/processed/yolo_detections.jsonl";
const DEFAULT_DB_PATH: &str = "data/warehouse.db";
const DEFAULT_TABLE: &str = "raw_cv_detections";
const DEFAULT_WORKERS: usize = 1;
const DEFAULT_PROGRESS_EVERY: usize = 100;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_MAX_DETECTIONS: usize = 300;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    model_path: Option<PathBuf>,
    image_dir: Option<PathBuf>,
    image_extensions: Option<Vec<String>>,
    staging_path: Option<PathBuf>,
    workers: Option<usize>,
    progress_every: Option<usize>,
    detector: Option<DetectorConfigFile>,
    warehouse: Option<WarehouseConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    input_size: Option<u32>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    max_detections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct WarehouseConfigFile {
    db_path: Option<String>,
    table: Option<String>,
    mode: Option<LoadMode>,
}

/// Everything one enrichment run needs, resolved once and passed down.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub model_path: PathBuf,
    pub image_dir: PathBuf,
    pub image_extensions: Vec<String>,
    pub staging_path: PathBuf,
    /// Worker threads for inference. `1` runs the scan sequentially.
    pub workers: usize,
    /// Log a progress line every N assets (0 disables).
    pub progress_every: usize,
    pub detector: DetectorSettings,
    pub warehouse: WarehouseSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WarehouseSettings {
    pub db_path: String,
    pub table: String,
    pub mode: LoadMode,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_detections: DEFAULT_MAX_DETECTIONS,
        }
    }
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            table: DEFAULT_TABLE.to_string(),
            mode: LoadMode::Append,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            image_extensions: vec![DEFAULT_IMAGE_EXTENSION.to_string()],
            staging_path: PathBuf::from(DEFAULT_STAGING_PATH),
            workers: DEFAULT_WORKERS,
            progress_every: DEFAULT_PROGRESS_EVERY,
            detector: DetectorSettings::default(),
            warehouse: WarehouseSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Resolve configuration: TOML file named by `ENRICH_CONFIG`, then
    /// environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = non_empty_env("ENRICH_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Same as [`PipelineConfig::load`] with an explicit config file.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let defaults = Self::default();
        let detector_file = file.detector.unwrap_or_default();
        let warehouse_file = file.warehouse.unwrap_or_default();
        Self {
            model_path: file.model_path.unwrap_or(defaults.model_path),
            image_dir: file.image_dir.unwrap_or(defaults.image_dir),
            image_extensions: file.image_extensions.unwrap_or(defaults.image_extensions),
            staging_path: file.staging_path.unwrap_or(defaults.staging_path),
            workers: file.workers.unwrap_or(defaults.workers),
            progress_every: file.progress_every.unwrap_or(defaults.progress_every),
            detector: DetectorSettings {
                input_size: detector_file
                    .input_size
                    .unwrap_or(defaults.detector.input_size),
                confidence_threshold: detector_file
                    .confidence_threshold
                    .unwrap_or(defaults.detector.confidence_threshold),
                iou_threshold: detector_file
                    .iou_threshold
                    .unwrap_or(defaults.detector.iou_threshold),
                max_detections: detector_file
                    .max_detections
                    .unwrap_or(defaults.detector.max_detections),
            },
            warehouse: WarehouseSettings {
                db_path: warehouse_file.db_path.unwrap_or(defaults.warehouse.db_path),
                table: warehouse_file.table.unwrap_or(defaults.warehouse.table),
                mode: warehouse_file.mode.unwrap_or(defaults.warehouse.mode),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = non_empty_env("ENRICH_MODEL_PATH") {
            self.model_path = PathBuf::from(path);
        }
        if let Some(dir) = non_empty_env("ENRICH_IMAGE_DIR") {
            self.image_dir = PathBuf::from(dir);
        }
        if let Some(path) = non_empty_env("ENRICH_STAGING_PATH") {
            self.staging_path = PathBuf::from(path);
        }
        if let Some(path) = non_empty_env("ENRICH_DB_PATH") {
            self.warehouse.db_path = path;
        } else if let Some(url) = non_empty_env("DATABASE_URL") {
            match url.strip_prefix("sqlite://") {
                Some(path) => self.warehouse.db_path = path.to_string(),
                None => log::warn!("ignoring DATABASE_URL without sqlite:// scheme"),
            }
        }
        if let Some(mode) = non_empty_env("ENRICH_LOAD_MODE") {
            self.warehouse.mode = mode.parse().map_err(|e: String| anyhow!(e))?;
        }
        if let Some(workers) = non_empty_env("ENRICH_WORKERS") {
            self.workers = workers
                .parse()
                .map_err(|_| anyhow!("ENRICH_WORKERS must be a positive integer"))?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("workers must be at least 1"));
        }
        self.image_extensions = self
            .image_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        if self.image_extensions.is_empty() {
            return Err(anyhow!("at least one image extension is required"));
        }
        for (name, value) in [
            ("confidence_threshold", self.detector.confidence_threshold),
            ("iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("detector.{} must be within 0..=1", name));
            }
        }
        if self.detector.input_size == 0 || self.detector.input_size % 32 != 0 {
            return Err(anyhow!("detector.input_size must be a positive multiple of 32"));
        }
        if self.detector.max_detections == 0 {
            return Err(anyhow!("detector.max_detections must be greater than zero"));
        }
        crate::warehouse::validate_table_name(&self.warehouse.table)?;
        if self.warehouse.db_path.trim().is_empty() {
            return Err(anyhow!("warehouse.db_path must not be empty"));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.image_extensions, vec!["jpg"]);
        assert_eq!(cfg.warehouse.table, "raw_cv_detections");
        assert_eq!(cfg.warehouse.mode, LoadMode::Append);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file: PipelineConfigFile = toml::from_str(
            r#"
            image_dir = "/srv/images"
            image_extensions = [".JPG", "png"]

            [warehouse]
            mode = "upsert"
            "#,
        )
        .unwrap();
        let mut cfg = PipelineConfig::from_file(file);
        cfg.validate().unwrap();
        assert_eq!(cfg.image_dir, PathBuf::from("/srv/images"));
        assert_eq!(cfg.image_extensions, vec!["jpg", "png"]);
        assert_eq!(cfg.warehouse.mode, LoadMode::Upsert);
        assert_eq!(cfg.warehouse.db_path, "data/warehouse.db");
        assert_eq!(cfg.detector, DetectorSettings::default());
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = PipelineConfig {
            workers: 0,
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.detector.iou_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.warehouse.table = "cv; DROP TABLE x".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig {
            image_extensions: vec![" ".to_string()],
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<PipelineConfigFile>("model = \"x.onnx\"").is_err());
    }
}
