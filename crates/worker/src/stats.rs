//! Per-datum and per-subtask processing stats.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timings and byte counts for one datum (or summed over a subtask).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// Time spent staging inputs.
    #[serde(default)]
    pub download_time: Duration,
    /// Time spent inside user code.
    #[serde(default)]
    pub process_time: Duration,
    /// Time spent capturing and uploading outputs.
    #[serde(default)]
    pub upload_time: Duration,
    /// Bytes staged from the object store.
    #[serde(default)]
    pub download_bytes: u64,
    /// Bytes uploaded to the object store.
    #[serde(default)]
    pub upload_bytes: u64,
}

/// Outcome accounting for a set of datums.
///
/// Exactly one of processed/skipped/failed/recovered is incremented per
/// datum, so the four counters sum to the datum count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumStats {
    /// Summed processing stats.
    #[serde(default)]
    pub process_stats: ProcessStats,
    /// Datums whose user code succeeded.
    #[serde(default)]
    pub datums_processed: u64,
    /// Datums served from the output cache.
    #[serde(default)]
    pub datums_skipped: u64,
    /// Datums that exhausted their retries.
    #[serde(default)]
    pub datums_failed: u64,
    /// Datums rescued by the error handler.
    #[serde(default)]
    pub datums_recovered: u64,
    /// Id of the first failed datum observed in merge order.
    #[serde(default)]
    pub failed_datum_id: String,
}

/// Merge `y` into `x`. Durations and counters sum; `failed_datum_id` is
/// sticky to the first non-empty value.
pub fn merge_stats(x: &mut DatumStats, y: &DatumStats) {
    x.process_stats.download_time += y.process_stats.download_time;
    x.process_stats.process_time += y.process_stats.process_time;
    x.process_stats.upload_time += y.process_stats.upload_time;
    x.process_stats.download_bytes += y.process_stats.download_bytes;
    x.process_stats.upload_bytes += y.process_stats.upload_bytes;

    x.datums_processed += y.datums_processed;
    x.datums_skipped += y.datums_skipped;
    x.datums_failed += y.datums_failed;
    x.datums_recovered += y.datums_recovered;
    if x.failed_datum_id.is_empty() {
        x.failed_datum_id = y.failed_datum_id.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_durations_and_counters() {
        let mut total = DatumStats::default();
        merge_stats(
            &mut total,
            &DatumStats {
                process_stats: ProcessStats {
                    download_time: Duration::from_millis(100),
                    process_time: Duration::from_millis(200),
                    upload_time: Duration::from_millis(50),
                    download_bytes: 10,
                    upload_bytes: 20,
                },
                datums_processed: 1,
                ..DatumStats::default()
            },
        );
        merge_stats(
            &mut total,
            &DatumStats {
                process_stats: ProcessStats {
                    download_time: Duration::from_millis(1),
                    download_bytes: 5,
                    ..ProcessStats::default()
                },
                datums_skipped: 2,
                ..DatumStats::default()
            },
        );
        assert_eq!(total.process_stats.download_time, Duration::from_millis(101));
        assert_eq!(total.process_stats.download_bytes, 15);
        assert_eq!(total.datums_processed, 1);
        assert_eq!(total.datums_skipped, 2);
    }

    #[test]
    fn first_failed_datum_id_is_sticky() {
        let mut total = DatumStats::default();
        merge_stats(
            &mut total,
            &DatumStats {
                datums_failed: 1,
                failed_datum_id: "d1".to_string(),
                ..DatumStats::default()
            },
        );
        merge_stats(
            &mut total,
            &DatumStats {
                datums_failed: 1,
                failed_datum_id: "d2".to_string(),
                ..DatumStats::default()
            },
        );
        assert_eq!(total.datums_failed, 2);
        assert_eq!(total.failed_datum_id, "d1");
    }
}
