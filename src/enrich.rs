//! Scan → infer → classify over a batch of image assets.
//!
//! Every asset ends in exactly one [`AssetOutcome`]. Skips are counted, logged
//! and kept in the [`BatchReport`]; they never abort the batch.

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assets::{AssetLocator, ImageAsset};
use crate::classify::{classify, ContentCategory};
use crate::config::PipelineConfig;
use crate::detect::{DetectionSet, Detector, InferenceError};
use crate::error::PipelineError;

/// The persisted unit of output for one processed image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub message_id: i64,
    pub image_path: String,
    /// Class of the representative detection, `None` when nothing was found.
    pub detected_class: Option<String>,
    /// Confidence of the representative detection, `None` when nothing was found.
    pub confidence_score: Option<f64>,
    pub image_category: ContentCategory,
    pub all_detections: DetectionSet,
    pub processed_at: DateTime<Utc>,
}

impl EnrichmentRecord {
    /// Build a record from the detections of one image.
    pub fn from_detections(
        message_id: i64,
        image_path: impl Into<String>,
        detections: DetectionSet,
        processed_at: DateTime<Utc>,
    ) -> Self {
        let (detected_class, confidence_score, image_category) =
            match detections.representative() {
                Some(top) => (
                    Some(top.class_name.clone()),
                    Some(top.confidence),
                    classify(&detections),
                ),
                None => (None, None, ContentCategory::Other),
            };
        Self {
            message_id,
            image_path: image_path.into(),
            detected_class,
            confidence_score,
            image_category,
            all_detections: detections,
            processed_at,
        }
    }
}

/// Why an asset produced no record.
#[derive(Debug)]
pub enum SkipReason {
    /// File name is not a positive integer message id.
    AssetIdentification,
    Inference(InferenceError),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AssetIdentification => f.write_str("file name is not a message id"),
            SkipReason::Inference(e) => write!(f, "{}", e.message),
        }
    }
}

#[derive(Debug)]
pub enum AssetOutcome {
    Enriched(EnrichmentRecord),
    Skipped(SkippedAsset),
}

#[derive(Debug)]
pub struct SkippedAsset {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Result of one batch: emitted records plus completeness counters.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub records: Vec<EnrichmentRecord>,
    pub skipped: Vec<SkippedAsset>,
    pub processed_count: usize,
    pub error_count: usize,
}

impl SkippedAsset {
    fn new(path: &Path, reason: SkipReason) -> Self {
        Self {
            path: path.to_path_buf(),
            reason,
        }
    }
}

impl BatchReport {
    fn absorb(&mut self, outcome: AssetOutcome) {
        match outcome {
            AssetOutcome::Enriched(record) => {
                self.processed_count += 1;
                self.records.push(record);
            }
            AssetOutcome::Skipped(skipped) => {
                log::warn!("skipping {}: {}", skipped.path.display(), skipped.reason);
                self.error_count += 1;
                self.skipped.push(skipped);
            }
        }
    }

    pub fn total(&self) -> usize {
        self.processed_count + self.error_count
    }

    /// Share of assets that were skipped, `0.0` for an empty batch.
    pub fn error_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.error_count as f64 / total as f64,
        }
    }
}

/// Drives detection and classification over every discovered asset.
pub struct Aggregator<D> {
    detector: D,
    locator: AssetLocator,
    workers: usize,
    progress_every: usize,
}

impl<D: Detector> Aggregator<D> {
    pub fn new(detector: D, config: &PipelineConfig) -> Self {
        Self {
            detector,
            locator: AssetLocator::new(&config.image_dir, &config.image_extensions),
            workers: config.workers.max(1),
            progress_every: config.progress_every,
        }
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    /// Scan the configured directory and enrich every asset found.
    pub fn run(&self) -> Result<BatchReport, PipelineError> {
        let assets: Vec<ImageAsset> = self.locator.enumerate()?.collect();
        log::info!(
            "found {} asset(s) under {}; detector '{}' ({} worker(s))",
            assets.len(),
            self.locator.base_dir().display(),
            self.detector.name(),
            self.workers
        );
        let report = self.run_assets(assets);
        log::info!(
            "detection complete: {} processed, {} errors",
            report.processed_count,
            report.error_count
        );
        Ok(report)
    }

    /// Enrich an explicit sequence of assets.
    ///
    /// With one worker records keep input order; with more, order is
    /// unspecified. Progress lines carry a total when the iterator's length
    /// is exact.
    pub fn run_assets<I>(&self, assets: I) -> BatchReport
    where
        I: IntoIterator<Item = ImageAsset>,
        I::IntoIter: Send,
    {
        let assets = assets.into_iter();
        let total = exact_len(&assets);
        if self.workers <= 1 {
            let mut report = BatchReport::default();
            for asset in assets {
                report.absorb(self.process_asset(&asset));
                self.log_progress(&report, total);
            }
            return report;
        }
        self.run_parallel(assets, total)
    }

    fn run_parallel<I>(&self, assets: I, total: Option<usize>) -> BatchReport
    where
        I: Iterator<Item = ImageAsset> + Send,
    {
        let queue = Mutex::new(assets);
        let (tx, rx) = mpsc::channel();
        let mut report = BatchReport::default();

        std::thread::scope(|scope| {
            for _ in 0..self.workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || loop {
                    let next = match queue.lock() {
                        Ok(mut guard) => guard.next(),
                        Err(_) => None,
                    };
                    let Some(asset) = next else {
                        break;
                    };
                    if tx.send(self.process_asset(&asset)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            for outcome in rx {
                report.absorb(outcome);
                self.log_progress(&report, total);
            }
        });

        report
    }

    /// Enrich a single asset.
    ///
    /// A detection set with any non-finite or degenerate entry is treated as
    /// an inference failure for this asset only.
    pub fn process_asset(&self, asset: &ImageAsset) -> AssetOutcome {
        let Some(message_id) = asset.message_id() else {
            return AssetOutcome::Skipped(SkippedAsset::new(
                &asset.path,
                SkipReason::AssetIdentification,
            ));
        };

        let detections = match self.detector.infer(&asset.path) {
            Ok(detections) => detections,
            Err(e) => {
                return AssetOutcome::Skipped(SkippedAsset::new(
                    &asset.path,
                    SkipReason::Inference(e),
                ))
            }
        };
        if let Some(bad) = detections.first_malformed() {
            let e = InferenceError::new(
                &asset.path,
                format!(
                    "detector '{}' returned malformed detection {} (confidence {}, bbox {:?})",
                    self.detector.name(),
                    bad.class_name,
                    bad.confidence,
                    bad.bounding_box
                ),
            );
            return AssetOutcome::Skipped(SkippedAsset::new(
                &asset.path,
                SkipReason::Inference(e),
            ));
        }
        log::debug!(
            "{}: {} detection(s)",
            asset.path.display(),
            detections.len()
        );

        AssetOutcome::Enriched(EnrichmentRecord::from_detections(
            message_id,
            asset.path.to_string_lossy(),
            detections,
            Utc::now(),
        ))
    }

    fn log_progress(&self, report: &BatchReport, total: Option<usize>) {
        let done = report.total();
        if self.progress_every > 0 && done % self.progress_every == 0 {
            log::info!("{}", progress_line(done, total, report.error_count));
        }
    }
}

fn exact_len<I: Iterator>(iter: &I) -> Option<usize> {
    match iter.size_hint() {
        (lower, Some(upper)) if lower == upper => Some(lower),
        _ => None,
    }
}

fn progress_line(done: usize, total: Option<usize>, errors: usize) -> String {
    match total {
        Some(total) => format!("processed {}/{} assets ({} errors)", done, total, errors),
        None => format!("processed {} assets ({} errors)", done, errors),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Detection, StubDetector};

    fn det(name: &str, confidence: f64) -> Detection {
        Detection::new(0, name, confidence, [0.0, 0.0, 10.0, 10.0])
    }

    fn asset(dir: &std::path::Path, name: &str) -> ImageAsset {
        let path = dir.join(name);
        std::fs::write(&path, b"img").unwrap();
        ImageAsset {
            path,
            channel: None,
        }
    }

    fn config(workers: usize) -> PipelineConfig {
        PipelineConfig {
            workers,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn record_uses_max_confidence_detection() {
        let set = DetectionSet::new(vec![det("cup", 0.4), det("person", 0.91), det("bottle", 0.91)]);
        let record = EnrichmentRecord::from_detections(5, "x/5.jpg", set.clone(), Utc::now());
        assert_eq!(record.detected_class.as_deref(), Some("person"));
        assert_eq!(record.confidence_score, Some(0.91));
        assert_eq!(record.image_category, ContentCategory::Promotional);
        assert_eq!(record.all_detections, set);
    }

    #[test]
    fn empty_detections_produce_null_representative_and_other() {
        let record =
            EnrichmentRecord::from_detections(6, "x/6.jpg", DetectionSet::empty(), Utc::now());
        assert_eq!(record.detected_class, None);
        assert_eq!(record.confidence_score, None);
        assert_eq!(record.image_category, ContentCategory::Other);
        assert!(record.all_detections.is_empty());
    }

    #[test]
    fn unparseable_name_is_skipped_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Aggregator::new(StubDetector::new(), &config(1));
        let report = aggregator.run_assets(vec![asset(dir.path(), "abc.jpg")]);
        assert_eq!(report.processed_count, 0);
        assert_eq!(report.error_count, 1);
        assert!(report.records.is_empty());
        assert!(matches!(
            report.skipped[0].reason,
            SkipReason::AssetIdentification
        ));
    }

    #[test]
    fn inference_failure_skips_only_that_asset() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubDetector::new()
            .with_detections("1.jpg", vec![det("person", 0.7)])
            .fail_on("2.jpg", "truncated jpeg");
        let aggregator = Aggregator::new(stub, &config(1));
        let report = aggregator.run_assets(vec![
            asset(dir.path(), "1.jpg"),
            asset(dir.path(), "2.jpg"),
            asset(dir.path(), "3.jpg"),
        ]);
        assert_eq!(report.processed_count, 2);
        assert_eq!(report.error_count, 1);
        let ids: Vec<i64> = report.records.iter().map(|r| r.message_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(report.records[0].image_category, ContentCategory::Lifestyle);
        match &report.skipped[0].reason {
            SkipReason::Inference(e) => assert_eq!(e.message, "truncated jpeg"),
            other => panic!("unexpected reason {:?}", other),
        }
        assert!((report.error_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn malformed_detections_skip_only_that_asset() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubDetector::new()
            .with_detections("1.jpg", vec![det("person", 0.9)])
            .with_detections("2.jpg", vec![det("bottle", 0.8), det("cup", f64::NAN)])
            .with_detections(
                "3.jpg",
                vec![Detection::new(41, "cup", 0.5, [0.0, 0.0, f64::INFINITY, 10.0])],
            )
            .with_detections(
                "4.jpg",
                vec![Detection::new(41, "cup", 0.5, [20.0, 0.0, 10.0, 10.0])],
            );
        let aggregator = Aggregator::new(stub, &config(1));
        let report = aggregator.run_assets(vec![
            asset(dir.path(), "1.jpg"),
            asset(dir.path(), "2.jpg"),
            asset(dir.path(), "3.jpg"),
            asset(dir.path(), "4.jpg"),
        ]);
        assert_eq!(report.processed_count, 1);
        assert_eq!(report.error_count, 3);
        assert_eq!(report.records[0].message_id, 1);
        for skipped in &report.skipped {
            assert!(matches!(skipped.reason, SkipReason::Inference(_)));
        }

        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let mut loader = crate::warehouse::WarehouseLoader::from_connection(
            conn,
            "raw_cv_detections",
            crate::warehouse::LoadMode::Append,
        )
        .unwrap();
        assert_eq!(loader.load_records(&report.records).unwrap(), 1);
    }

    #[test]
    fn parallel_workers_match_sequential_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut stub = StubDetector::new().fail_on("13.jpg", "bad");
        let mut assets = Vec::new();
        for id in 1..=40 {
            let name = format!("{}.jpg", id);
            if id % 2 == 0 {
                stub = stub.with_detections(&name, vec![det("bottle", 0.8)]);
            }
            assets.push(asset(dir.path(), &name));
        }
        assets.push(asset(dir.path(), "cover.jpg"));

        let aggregator = Aggregator::new(stub, &config(4));
        let report = aggregator.run_assets(assets);
        assert_eq!(report.processed_count, 39);
        assert_eq!(report.error_count, 2);

        let mut ids: Vec<i64> = report.records.iter().map(|r| r.message_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=40).filter(|id| *id != 13).collect::<Vec<_>>());
        let product = report
            .records
            .iter()
            .filter(|r| r.image_category == ContentCategory::ProductDisplay)
            .count();
        assert_eq!(product, 20);
    }

    #[test]
    fn progress_reports_total_when_length_is_known() {
        let dir = tempfile::tempdir().unwrap();
        let assets = vec![asset(dir.path(), "1.jpg"), asset(dir.path(), "2.jpg")];
        assert_eq!(exact_len(&assets.clone().into_iter()), Some(2));
        assert_eq!(exact_len(&assets.into_iter().filter(|_| true)), None);
        assert_eq!(progress_line(100, Some(250), 3), "processed 100/250 assets (3 errors)");
        assert_eq!(progress_line(100, None, 0), "processed 100 assets (0 errors)");
    }

    #[test]
    fn empty_batch_has_zero_error_rate() {
        let report = BatchReport::default();
        assert_eq!(report.error_rate(), 0.0);
    }
}
