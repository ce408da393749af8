//! End-of-scan bookkeeping.

use crate::clock::timestamp;
use crate::layout::{
    FIELD_END_TIME, FIELD_SCAN_DEAD_TIME, FIELD_SCAN_DEAD_TIME_PERCENT, FIELD_SCAN_DURATION,
    FIELD_SCAN_FINISHED,
};
use crate::metadata::{write_new, ScanMetadata};
use crate::tree::{AttrValue, NexusTree, Slice, Values};
use crate::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};

/// How the scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    /// Cancelled, timed out or failed. The file stays readable but is not
    /// marked finished.
    Aborted,
}

/// Timing figures of a finished scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSummary {
    pub label: String,
    pub shape: Vec<usize>,
    pub outcome: ScanOutcome,
    pub estimated_s: f64,
    pub actual_s: f64,
    pub dead_time_s: f64,
    pub dead_time_percent: f64,
}

impl ScanSummary {
    fn new(label: String, metadata: &ScanMetadata, outcome: ScanOutcome, actual_s: f64) -> Self {
        let estimated_s = metadata.estimated_duration_s();
        let dead_time_s = (actual_s - estimated_s).max(0.0);
        let dead_time_percent = if actual_s > 0.0 {
            100.0 * dead_time_s / actual_s
        } else {
            0.0
        };
        Self {
            label,
            shape: metadata.shape().scan_sizes().to_vec(),
            outcome,
            estimated_s,
            actual_s,
            dead_time_s,
            dead_time_percent,
        }
    }
}

/// Writes the end-of-scan fields. Sole writer of `end_time`, the duration
/// figures and `scan_finished`.
#[derive(Debug)]
pub struct Finalizer {
    metadata: ScanMetadata,
    label: String,
}

impl Finalizer {
    /// `label` names the scan file in the summary log line.
    pub fn new(metadata: ScanMetadata, label: impl Into<String>) -> Self {
        Self {
            metadata,
            label: label.into(),
        }
    }

    /// Closes the scan record. Consumes the finalizer so it runs once.
    ///
    /// After an abort nothing is written beyond a best-effort flush and
    /// this never fails; `scan_finished` stays false and per-point slices
    /// are left as they are.
    ///
    /// # Errors
    /// Returns tree errors from writing the end-of-scan fields of a
    /// completed scan.
    pub fn finish(
        self,
        tree: &mut dyn NexusTree,
        outcome: ScanOutcome,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ScanSummary> {
        let summary = ScanSummary::new(self.label, &self.metadata, outcome, seconds_between(start, end));

        if outcome == ScanOutcome::Aborted {
            warn!(
                "Scan {} aborted after {}; leaving it unfinished",
                summary.label,
                format_duration(summary.actual_s)
            );
            if let Err(err) = tree.flush() {
                warn!("Flushing aborted scan {} failed: {err}", summary.label);
            }
            return Ok(summary);
        }

        let layout = self.metadata.layout();
        write_new(
            tree,
            &layout.metadata_field(FIELD_END_TIME),
            Vec::new(),
            Values::Text(vec![timestamp(end)]),
        )?;
        for (field, value, units) in [
            (FIELD_SCAN_DURATION, summary.actual_s, "s"),
            (FIELD_SCAN_DEAD_TIME, summary.dead_time_s, "s"),
            (FIELD_SCAN_DEAD_TIME_PERCENT, summary.dead_time_percent, "%"),
        ] {
            let path = layout.metadata_field(field);
            write_new(tree, &path, Vec::new(), Values::Float(vec![value]))?;
            tree.set_attr(&path, "units", &AttrValue::from(units))?;
        }
        tree.write_slice(
            &layout.metadata_field(FIELD_SCAN_FINISHED),
            &Slice::point(vec![0]),
            &Values::Bool(vec![true]),
        )?;
        tree.flush()?;

        info!(
            "{} finished: shape {:?}, estimated {}, actual {}, dead time {} ({:.1}%)",
            summary.label,
            summary.shape,
            format_duration(summary.estimated_s),
            format_duration(summary.actual_s),
            format_duration(summary.dead_time_s),
            summary.dead_time_percent
        );
        Ok(summary)
    }
}

#[allow(clippy::cast_precision_loss)]
fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}

/// Renders seconds as `HH:MM:SS.mmm`, prefixed with `Nd ` past a day.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn format_duration(seconds: f64) -> String {
    let total_ms = if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1000.0).round() as u64
    } else {
        0
    };
    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;
    let (days, hours) = (total_s / 86_400, total_s / 3600 % 24);
    let (minutes, secs) = (total_s / 60 % 60, total_s % 60);
    if days > 0 {
        format!("{days}d {hours:02}:{minutes:02}:{secs:02}.{ms:03}")
    } else {
        format!("{hours:02}:{minutes:02}:{secs:02}.{ms:03}")
    }
}
