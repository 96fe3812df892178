//! Store configuration: every tunable named in spec.md §6.

use serde::{Deserialize, Serialize};

/// Which merge-trigger policies are active, ORed together (spec.md §4.8).
/// Any matching policy triggers a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicyFlags {
    /// Merge a size-tier bucket once it holds too many files.
    pub file_count: bool,
    /// Merge any file whose invalid-entry ratio/count crosses the
    /// threshold.
    pub invalid_entries: bool,
    /// Merge any file whose deleted-entry ratio crosses the threshold.
    pub deleted_entries: bool,
    /// Merge everything once total on-disk size crosses the threshold and
    /// any file has invalid or deleted entries.
    pub size_on_disk: bool,
}

impl Default for MergePolicyFlags {
    fn default() -> Self {
        MergePolicyFlags {
            file_count: true,
            invalid_entries: true,
            deleted_entries: true,
            size_on_disk: true,
        }
    }
}

/// All configuration knobs recognized by the store (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfiguration {
    /// Number of sealed deltas that triggers consolidation (default 3).
    pub number_of_deltas_to_be_consolidated: u32,
    /// Which merge policies are enabled.
    pub merge_policy: MergePolicyFlags,
    /// Files-per-size-tier-bucket threshold (default 16).
    pub file_count_merge_threshold: u32,
    /// Size tier boundaries in bytes, ascending
    /// (default: 1 MiB, 16 MiB, 256 MiB, 4 GiB).
    pub size_tier_thresholds: [u64; 4],
    /// Percentage of invalid entries per file that triggers a merge
    /// (default 33).
    pub percentage_of_invalid_entries_per_file: u8,
    /// Absolute count of invalid entries that triggers a merge; 0 means
    /// "use the percentage instead" (default 0).
    pub number_of_invalid_entries: u64,
    /// Percentage of deleted entries per file that triggers a merge
    /// (default 33).
    pub percentage_of_deleted_entries_per_file: u8,
    /// Total on-disk size across files that triggers a merge, in bytes
    /// (default 16 GiB).
    pub size_on_disk_threshold: u64,
    /// Whether consolidation runs automatically from
    /// `PerformCheckpointAsync` (default true).
    pub enable_background_consolidation: bool,
    /// Whether recovery eagerly loads values into memory rather than
    /// leaving them on disk (default false).
    pub should_load_values_on_recovery: bool,
    /// Checkpoint file chunk/block alignment, in bytes (default 4 KiB).
    pub chunk_size_bytes: u32,
    /// Timeout for prime-lock acquisition.
    #[serde(with = "duration_millis")]
    pub lock_timeout: std::time::Duration,
}

impl Default for StoreConfiguration {
    fn default() -> Self {
        StoreConfiguration {
            number_of_deltas_to_be_consolidated: 3,
            merge_policy: MergePolicyFlags::default(),
            file_count_merge_threshold: 16,
            size_tier_thresholds: [1 << 20, 16 << 20, 256 << 20, 4 << 30],
            percentage_of_invalid_entries_per_file: 33,
            number_of_invalid_entries: 0,
            percentage_of_deleted_entries_per_file: 33,
            size_on_disk_threshold: 16 << 30,
            enable_background_consolidation: true,
            should_load_values_on_recovery: false,
            chunk_size_bytes: 4096,
            lock_timeout: std::time::Duration::from_secs(30),
        }
    }
}

impl StoreConfiguration {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of sealed deltas that triggers consolidation.
    pub fn with_deltas_to_consolidate(mut self, n: u32) -> Self {
        self.number_of_deltas_to_be_consolidated = n;
        self
    }

    /// Set the file-count-per-bucket merge threshold.
    pub fn with_file_count_merge_threshold(mut self, n: u32) -> Self {
        self.file_count_merge_threshold = n;
        self
    }

    /// Set the chunk/block alignment.
    pub fn with_chunk_size_bytes(mut self, bytes: u32) -> Self {
        self.chunk_size_bytes = bytes;
        self
    }

    /// Set the prime-lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// A configuration tuned for fast, deterministic tests: small chunks,
    /// aggressive consolidation/merge thresholds, short lock timeout.
    pub fn for_testing() -> Self {
        StoreConfiguration {
            number_of_deltas_to_be_consolidated: 1,
            file_count_merge_threshold: 3,
            chunk_size_bytes: 4096,
            lock_timeout: std::time::Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Validate the configuration, rejecting degenerate values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.number_of_deltas_to_be_consolidated == 0 {
            return Err(ConfigError::ZeroDeltasToConsolidate);
        }
        if self.file_count_merge_threshold == 0 {
            return Err(ConfigError::ZeroFileCountThreshold);
        }
        if self.percentage_of_invalid_entries_per_file > 100
            || self.percentage_of_deleted_entries_per_file > 100
        {
            return Err(ConfigError::PercentageOutOfRange);
        }
        if self.chunk_size_bytes == 0 || self.chunk_size_bytes % 4096 != 0 {
            return Err(ConfigError::ChunkSizeNotAligned);
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Errors validating a [`StoreConfiguration`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `number_of_deltas_to_be_consolidated` was zero.
    #[error("number_of_deltas_to_be_consolidated must be at least 1")]
    ZeroDeltasToConsolidate,
    /// `file_count_merge_threshold` was zero.
    #[error("file_count_merge_threshold must be at least 1")]
    ZeroFileCountThreshold,
    /// A percentage field exceeded 100.
    #[error("percentage fields must be in 0..=100")]
    PercentageOutOfRange,
    /// `chunk_size_bytes` was zero or not 4 KiB-aligned.
    #[error("chunk_size_bytes must be a positive multiple of 4096")]
    ChunkSizeNotAligned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec() {
        let cfg = StoreConfiguration::default();
        assert_eq!(cfg.number_of_deltas_to_be_consolidated, 3);
        assert_eq!(cfg.file_count_merge_threshold, 16);
        assert_eq!(cfg.size_on_disk_threshold, 16 << 30);
        assert_eq!(cfg.percentage_of_invalid_entries_per_file, 33);
        assert_eq!(cfg.percentage_of_deleted_entries_per_file, 33);
        assert!(cfg.enable_background_consolidation);
        assert!(!cfg.should_load_values_on_recovery);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_degenerate_values() {
        let cfg = StoreConfiguration::new().with_deltas_to_consolidate(0);
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroDeltasToConsolidate));

        let cfg = StoreConfiguration::new().with_chunk_size_bytes(100);
        assert_eq!(cfg.validate(), Err(ConfigError::ChunkSizeNotAligned));
    }

    #[test]
    fn for_testing_is_valid() {
        StoreConfiguration::for_testing().validate().unwrap();
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = StoreConfiguration::default().with_deltas_to_consolidate(5).with_chunk_size_bytes(8192);
        let json = serde_json::to_string(&cfg).unwrap();
        let decoded: StoreConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.number_of_deltas_to_be_consolidated, 5);
        assert_eq!(decoded.chunk_size_bytes, 8192);
        assert_eq!(decoded.lock_timeout, cfg.lock_timeout);
        assert_eq!(decoded.merge_policy, cfg.merge_policy);
    }
}
