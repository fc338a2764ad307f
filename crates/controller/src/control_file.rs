// SPDX-License-Identifier: Apache-2.0

//! The on-disk control-file protocol.
//!
//! The writer serializes the document to a sibling temp file in the target
//! directory, fsyncs it, and renames it into place, so readers never see a
//! partial document. Readers gate on `config_version`: only a numerically
//! greater version is applied, and a document that fails to parse leaves
//! the last good snapshot in place.
//!
//! In-process consumers hold a [`ControlHandle`] — an RCU pointer the
//! controller swaps after each successful write. The file reader feeds the
//! same handle, which also picks up out-of-band (manual) edits.

use crate::error::Error;
use crate::mode::{OptimizationProfile, TriggerReason};
use arc_swap::ArcSwap;
use notify::Watcher;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Threshold block of the control document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Upper cardinality bound for the conservative profile.
    pub conservative_max_ts: u64,
    /// Lower cardinality bound for the aggressive profile.
    pub aggressive_min_ts: u64,
    /// Explosion growth-rate threshold, series/sec.
    pub explosion_rate: f64,
    /// Explosion absolute cardinality threshold.
    pub explosion_absolute: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            conservative_max_ts: 15_000,
            aggressive_min_ts: 25_000,
            explosion_rate: 10_000.0,
            explosion_absolute: 1_000_000,
        }
    }
}

/// Pipeline toggles of the control document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineFlags {
    /// Whether the experimental variant is enabled.
    pub experimental_enabled: bool,
}

impl Default for PipelineFlags {
    fn default() -> Self {
        Self {
            experimental_enabled: true,
        }
    }
}

/// KPI snapshot captured at the decision moment.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentMetrics {
    /// Optimized-pipeline cardinality estimate.
    pub optimized_cardinality: u64,
    /// Cardinality growth rate, series/sec.
    pub growth_rate_per_sec: f64,
    /// Distinct input processes in the last window.
    pub input_process_count: u64,
    /// Critical datapoints retained in the last window.
    pub critical_retained: u64,
    /// Critical datapoints required in the last window.
    pub critical_required: u64,
}

/// The versioned control document.
///
/// The key set is closed; readers ignore unknown keys for forward
/// compatibility (serde's default behavior — no `deny_unknown_fields`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlFile {
    /// The selected optimization profile.
    pub optimization_profile: OptimizationProfile,
    /// Monotonic version; readers apply only greater versions.
    pub config_version: u64,
    /// Opaque id of the controller decision that produced this document.
    pub correlation_id: String,
    /// RFC3339 timestamp of this write.
    pub last_updated: String,
    /// Why this document was emitted.
    pub trigger_reason: TriggerReason,
    /// Threshold block.
    pub thresholds: Thresholds,
    /// Pipeline toggles.
    pub pipelines: PipelineFlags,
    /// KPI snapshot at the decision moment.
    pub current_metrics: CurrentMetrics,
    /// RFC3339 timestamp of the last profile change.
    pub last_profile_change_timestamp: String,
}

impl Default for ControlFile {
    fn default() -> Self {
        Self {
            optimization_profile: OptimizationProfile::Conservative,
            config_version: 0,
            correlation_id: String::new(),
            last_updated: String::new(),
            trigger_reason: TriggerReason::Initial,
            thresholds: Thresholds::default(),
            pipelines: PipelineFlags::default(),
            current_metrics: CurrentMetrics::default(),
            last_profile_change_timestamp: String::new(),
        }
    }
}

/// RCU handle to the latest applied control document.
pub type ControlHandle = Arc<ArcSwap<ControlFile>>;

/// Creates a handle seeded with the default document.
#[must_use]
pub fn control_handle() -> ControlHandle {
    Arc::new(ArcSwap::from_pointee(ControlFile::default()))
}

/// Writes versioned control documents atomically.
pub struct ControlFileWriter {
    path: PathBuf,
    next_version: u64,
}

impl ControlFileWriter {
    /// Creates a writer for `path`, resuming the version sequence from an
    /// existing document if one parses. The parent directory is created if
    /// missing.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::ControlFileWrite {
                path: path.clone(),
                details: format!("creating parent directory: {e}"),
            })?;
        }
        let next_version = match std::fs::read_to_string(&path) {
            Ok(text) => serde_yaml::from_str::<ControlFile>(&text)
                .map(|doc| doc.config_version + 1)
                .unwrap_or(1),
            Err(_) => 1,
        };
        Ok(Self { path, next_version })
    }

    /// The version the next [`write`](Self::write) will assign.
    #[must_use]
    pub fn next_version(&self) -> u64 {
        self.next_version
    }

    /// Assigns the next version to `doc` and writes it atomically.
    /// Returns the assigned version.
    pub fn write(&mut self, doc: &mut ControlFile) -> Result<u64, Error> {
        doc.config_version = self.next_version;
        self.write_atomic(doc)?;
        self.next_version += 1;
        Ok(doc.config_version)
    }

    /// Rewrites the document without advancing the version. Used while the
    /// controller is blind: only `last_updated` changes, and readers (which
    /// gate on a greater version) are not re-triggered.
    pub fn write_refresh(&self, doc: &ControlFile) -> Result<(), Error> {
        self.write_atomic(doc)
    }

    fn write_atomic(&self, doc: &ControlFile) -> Result<(), Error> {
        let text = serde_yaml::to_string(doc)?;
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::ControlFileWrite {
                path: self.path.clone(),
                details: format!("creating temp file: {e}"),
            })?;
        tmp.write_all(text.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::ControlFileWrite {
                path: self.path.clone(),
                details: format!("writing temp file: {e}"),
            })?;
        let _ = tmp.persist(&self.path).map_err(|e| Error::ControlFileWrite {
            path: self.path.clone(),
            details: format!("renaming into place: {e}"),
        })?;
        Ok(())
    }
}

/// Outcome of one reader pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A newer document was applied.
    Applied(u64),
    /// The document's version was not newer than the applied one.
    NotNewer,
    /// The file is missing or did not parse; last good snapshot kept.
    KeptLastGood,
}

/// Reads control documents with version gating and last-good semantics.
pub struct ControlFileReader {
    path: PathBuf,
    handle: ControlHandle,
    last_applied_version: u64,
    metrics: Option<phoenix_telemetry::MetricsHandle>,
}

impl ControlFileReader {
    /// Creates a reader publishing into `handle`.
    #[must_use]
    pub fn new(
        path: impl Into<PathBuf>,
        handle: ControlHandle,
        metrics: Option<phoenix_telemetry::MetricsHandle>,
    ) -> Self {
        Self {
            path: path.into(),
            handle,
            last_applied_version: 0,
            metrics,
        }
    }

    /// The last applied version.
    #[must_use]
    pub fn last_applied_version(&self) -> u64 {
        self.last_applied_version
    }

    /// Reads the file once and applies it when strictly newer.
    pub fn read_once(&mut self) -> ReadOutcome {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(_) => return ReadOutcome::KeptLastGood,
        };
        match serde_yaml::from_str::<ControlFile>(&text) {
            Ok(doc) => {
                if doc.config_version > self.last_applied_version {
                    self.last_applied_version = doc.config_version;
                    self.handle.store(Arc::new(doc));
                    ReadOutcome::Applied(self.last_applied_version)
                } else {
                    ReadOutcome::NotNewer
                }
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e,
                    "control file did not parse, keeping last good snapshot");
                if let Some(metrics) = &self.metrics {
                    metrics.control_file_read_failures.inc();
                }
                ReadOutcome::KeptLastGood
            }
        }
    }
}

/// Runs the reader until cancellation: reacts to directory change events
/// and additionally polls at `poll_interval` to tolerate lost
/// notifications.
pub async fn run_reader(
    mut reader: ControlFileReader,
    poll_interval: std::time::Duration,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let watch_dir = reader
        .path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    // The notify callback runs on the watcher's own thread; an unbounded
    // sender is safe to use from there.
    let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
        if res.is_ok() {
            let _ = event_tx.send(());
        }
    })
    .map_err(|e| Error::WatchSetup {
        path: watch_dir.clone(),
        details: e.to_string(),
    })?;
    watcher
        .watch(&watch_dir, notify::RecursiveMode::NonRecursive)
        .map_err(|e| Error::WatchSetup {
            path: watch_dir.clone(),
            details: e.to_string(),
        })?;

    let _ = reader.read_once();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = event_rx.recv() => {
                let _ = reader.read_once();
            }
            () = tokio::time::sleep(poll_interval) => {
                let _ = reader.read_once();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(profile: OptimizationProfile) -> ControlFile {
        ControlFile {
            optimization_profile: profile,
            correlation_id: "test".to_owned(),
            last_updated: "2025-01-01T00:00:00Z".to_owned(),
            ..ControlFile::default()
        }
    }

    #[test]
    fn serialize_then_parse_is_identity() {
        let mut original = doc(OptimizationProfile::Balanced);
        original.config_version = 7;
        original.trigger_reason = TriggerReason::Explosion;
        original.current_metrics.optimized_cardinality = 42;

        let text = serde_yaml::to_string(&original).expect("serialize");
        let parsed: ControlFile = serde_yaml::from_str(&text).expect("parse");
        assert_eq!(parsed, original);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let text = "optimization_profile: aggressive\nconfig_version: 3\nfuture_key: true\n";
        let parsed: ControlFile = serde_yaml::from_str(text).expect("parse");
        assert_eq!(parsed.optimization_profile, OptimizationProfile::Aggressive);
        assert_eq!(parsed.config_version, 3);
    }

    #[test]
    fn writer_versions_strictly_increase() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("optimization_mode.yaml");
        let mut writer = ControlFileWriter::new(&path).expect("writer");

        let mut d = doc(OptimizationProfile::Conservative);
        assert_eq!(writer.write(&mut d).expect("write"), 1);
        assert_eq!(writer.write(&mut d).expect("write"), 2);

        // A fresh writer resumes after the on-disk version.
        let writer2 = ControlFileWriter::new(&path).expect("writer");
        assert_eq!(writer2.next_version(), 3);
    }

    #[test]
    fn reader_applies_only_newer_versions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("optimization_mode.yaml");
        let mut writer = ControlFileWriter::new(&path).expect("writer");
        let handle = control_handle();
        let mut reader = ControlFileReader::new(&path, handle.clone(), None);

        let mut d = doc(OptimizationProfile::Balanced);
        let v1 = writer.write(&mut d).expect("write");
        assert_eq!(reader.read_once(), ReadOutcome::Applied(v1));
        assert_eq!(
            handle.load().optimization_profile,
            OptimizationProfile::Balanced
        );

        // Same version on disk: not re-applied.
        assert_eq!(reader.read_once(), ReadOutcome::NotNewer);

        // Refresh write (no version bump) is also not re-applied.
        d.last_updated = "2025-01-01T00:01:00Z".to_owned();
        writer.write_refresh(&d).expect("refresh");
        assert_eq!(reader.read_once(), ReadOutcome::NotNewer);
    }

    #[test]
    fn corrupt_file_keeps_last_good_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("optimization_mode.yaml");
        let mut writer = ControlFileWriter::new(&path).expect("writer");
        let handle = control_handle();
        let mut reader = ControlFileReader::new(&path, handle.clone(), None);

        let mut d = doc(OptimizationProfile::Aggressive);
        let _ = writer.write(&mut d).expect("write");
        let _ = reader.read_once();

        std::fs::write(&path, "{{{ not yaml").expect("corrupt");
        assert_eq!(reader.read_once(), ReadOutcome::KeptLastGood);
        assert_eq!(
            handle.load().optimization_profile,
            OptimizationProfile::Aggressive
        );
    }
}
