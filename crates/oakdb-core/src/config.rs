//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Everything the host application can tune. Parsed or constructed by the
/// host; the engine only validates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory for the system tablespace and redo log files.
    pub data_dir: PathBuf,
    /// System tablespace file name.
    pub data_file: String,
    /// Buffer pool size in 16 KiB frames.
    pub pool_frames: usize,
    /// Dwell time before an old-sublist page can be promoted on re-touch.
    #[serde(with = "duration_millis")]
    pub lru_old_dwell: Duration,
    /// Number of redo log files (ring).
    pub log_files: usize,
    /// Size of each redo log file in bytes.
    pub log_file_size: u64,
    /// How long a lock request waits before timing out.
    #[serde(with = "duration_millis")]
    pub lock_wait_timeout: Duration,
    /// Rollback segments.
    pub rollback_segments: usize,
    /// Background flusher cadence.
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    /// Background checkpoint cadence.
    #[serde(with = "duration_millis")]
    pub checkpoint_interval: Duration,
    /// Background purge cadence.
    #[serde(with = "duration_millis")]
    pub purge_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            data_file: "ibdata1".to_owned(),
            pool_frames: 1024,
            lru_old_dwell: Duration::from_secs(1),
            log_files: 2,
            log_file_size: 16 * 1024 * 1024,
            lock_wait_timeout: Duration::from_secs(5),
            rollback_segments: 4,
            flush_interval: Duration::from_millis(200),
            checkpoint_interval: Duration::from_secs(2),
            purge_interval: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_frames < 16 {
            return Err("pool_frames must be at least 16".to_owned());
        }
        if self.log_files < 2 {
            return Err("log_files must be at least 2".to_owned());
        }
        if self.log_file_size < 1024 * 1024 {
            return Err("log_file_size must be at least 1 MiB".to_owned());
        }
        if self.rollback_segments == 0 || self.rollback_segments > 128 {
            return Err("rollback_segments must be in 1..=128".to_owned());
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
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_values_rejected() {
        let mut c = EngineConfig::default();
        c.log_files = 1;
        assert!(c.validate().is_err());
        let mut c = EngineConfig::default();
        c.pool_frames = 2;
        assert!(c.validate().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let c = EngineConfig::default();
        let json = serde_json::to_string(&c).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pool_frames, c.pool_frames);
        assert_eq!(back.lock_wait_timeout, c.lock_wait_timeout);
        // Partial documents fill in defaults.
        let partial: EngineConfig = serde_json::from_str(r#"{"pool_frames": 64}"#).unwrap();
        assert_eq!(partial.pool_frames, 64);
        assert_eq!(partial.log_files, c.log_files);
    }
}
