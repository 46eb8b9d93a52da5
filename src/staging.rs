//! Staging artifact: the durable, replayable output of the enrichment phase.
//!
//! Format is JSON Lines, one [`EnrichmentRecord`] per line with the nested
//! detection list kept as a JSON array. The artifact is written to a sibling
//! temp file and renamed into place, so readers only ever see a complete file.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use crate::enrich::EnrichmentRecord;
use crate::error::PipelineError;

/// Writes one artifact per invocation, replacing any previous file.
#[derive(Clone, Debug)]
pub struct StagingWriter {
    path: PathBuf,
}

impl StagingWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize every record. Zero records produce an empty artifact.
    pub fn write(&self, records: &[EnrichmentRecord]) -> Result<PathBuf, PipelineError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| PipelineError::staging_write(parent, e))?;
        }

        let tmp_path = temp_path_for(&self.path);
        let result = write_lines(&tmp_path, records)
            .and_then(|()| fs::rename(&tmp_path, &self.path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(PipelineError::staging_write(&self.path, e));
        }

        log::info!(
            "staged {} record(s) to {}",
            records.len(),
            self.path.display()
        );
        Ok(self.path.clone())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_lines(path: &Path, records: &[EnrichmentRecord]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// A staged line that could not be turned back into a valid record.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRowError {
    pub line: usize,
    pub message: String,
}

/// Streaming reader over a staging artifact.
pub struct StagedRows {
    lines: Lines<BufReader<File>>,
    line: usize,
}

impl StagedRows {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|e| PipelineError::StagingRead {
            path: path.to_path_buf(),
            line: 0,
            message: e.to_string(),
        })?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line: 0,
        })
    }
}

impl Iterator for StagedRows {
    type Item = Result<EnrichmentRecord, StagedRowError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = self.lines.next()?;
            self.line += 1;
            let line = self.line;
            let raw = match raw {
                Ok(raw) => raw,
                Err(e) => {
                    return Some(Err(StagedRowError {
                        line,
                        message: e.to_string(),
                    }))
                }
            };
            if raw.trim().is_empty() {
                continue;
            }
            return Some(parse_row(&raw).map_err(|message| StagedRowError { line, message }));
        }
    }
}

fn parse_row(raw: &str) -> Result<EnrichmentRecord, String> {
    let record: EnrichmentRecord = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    validate_record(&record)?;
    Ok(record)
}

/// Check the invariants a loaded row must satisfy.
pub fn validate_record(record: &EnrichmentRecord) -> Result<(), String> {
    if record.message_id <= 0 {
        return Err(format!("message_id {} is not positive", record.message_id));
    }
    match (&record.detected_class, record.confidence_score) {
        (Some(_), Some(score)) if !(0.0..=1.0).contains(&score) => {
            Err(format!("confidence_score {} outside 0..=1", score))
        }
        (Some(_), Some(_)) if record.all_detections.is_empty() => {
            Err("representative detection present but all_detections is empty".to_string())
        }
        (None, None) if !record.all_detections.is_empty() => {
            Err("all_detections present but representative detection is null".to_string())
        }
        (Some(_), Some(_)) | (None, None) => Ok(()),
        _ => Err("detected_class and confidence_score must both be present or both null".to_string()),
    }
}

/// Read a whole artifact back, failing on the first malformed line.
pub fn read_staged(path: &Path) -> Result<Vec<EnrichmentRecord>, PipelineError> {
    StagedRows::open(path)?
        .map(|row| {
            row.map_err(|e| PipelineError::StagingRead {
                path: path.to_path_buf(),
                line: e.line,
                message: e.message,
            })
        })
        .collect()
}
