//! Metric names.
//!
//! All crates record through the `metrics` facade using these constants.
//! Nothing is exported unless the embedding binary installs a recorder.
//!
//! # Naming
//!
//! - prefix: `platval_`
//! - suffix: `_total` (counter), `_seconds` (histogram)
//!
//! ```ignore
//! use metrics::counter;
//! counter!(platval_core::metrics::TEST_RUNS_TOTAL, "verdict" => "pass").increment(1);
//! ```

/// Verdict label key (pass, fail, error, ...)
pub const LABEL_VERDICT: &str = "verdict";

/// Test case id label key
pub const LABEL_TEST_ID: &str = "test_id";

/// Firmware kind label key (bios, sps, ...)
pub const LABEL_FIRMWARE: &str = "firmware";

/// Test case runs by verdict (counter, labels: test_id, verdict)
pub const TEST_RUNS_TOTAL: &str = "platval_test_runs_total";

/// Test case wall time (histogram, label: test_id)
pub const TEST_DURATION_SECONDS: &str = "platval_test_duration_seconds";

/// Commands issued to any executor (counter)
pub const COMMANDS_EXECUTED_TOTAL: &str = "platval_commands_executed_total";

/// Commands that timed out, failed to spawn or exited non-zero (counter)
pub const COMMANDS_FAILED_TOTAL: &str = "platval_commands_failed_total";

/// Capsule staging duration (histogram, label: firmware)
pub const CAPSULE_STAGING_SECONDS: &str = "platval_capsule_staging_seconds";

/// Capsule activation duration (histogram, label: firmware)
pub const CAPSULE_ACTIVATION_SECONDS: &str = "platval_capsule_activation_seconds";

/// Capsule updates whose timing exceeded a KPI (counter, label: firmware)
pub const CAPSULE_KPI_MISSED_TOTAL: &str = "platval_capsule_kpi_missed_total";

/// SUT resets issued (counter)
pub const SUT_RESETS_TOTAL: &str = "platval_sut_resets_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_share_prefix() {
        for name in [
            TEST_RUNS_TOTAL,
            TEST_DURATION_SECONDS,
            COMMANDS_EXECUTED_TOTAL,
            COMMANDS_FAILED_TOTAL,
            CAPSULE_STAGING_SECONDS,
            CAPSULE_ACTIVATION_SECONDS,
            CAPSULE_KPI_MISSED_TOTAL,
            SUT_RESETS_TOTAL,
        ] {
            assert!(name.starts_with("platval_"), "{name}");
        }
    }

    #[test]
    fn counters_end_with_total() {
        for name in [
            TEST_RUNS_TOTAL,
            COMMANDS_EXECUTED_TOTAL,
            COMMANDS_FAILED_TOTAL,
            CAPSULE_KPI_MISSED_TOTAL,
            SUT_RESETS_TOTAL,
        ] {
            assert!(name.ends_with("_total"), "{name}");
        }
    }
}
