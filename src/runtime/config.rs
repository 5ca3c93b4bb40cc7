//! runtime/config.rs — worker entry point parameters (spec §6) and
//! instruction-level I/O retry tuning (spec §4.7), loadable from a TOML
//! file the way the teacher's CLI loads `/etc/nonos/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pipeline_width: usize,
    pub msg_vis_timeout_secs: u64,
    pub cache_size: usize,
    pub wall_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_read_time_secs: u64,
    pub max_write_time_secs: u64,
    pub backoff_base_ms: u64,
    pub cas_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            pipeline_width: 5,
            msg_vis_timeout_secs: 60,
            cache_size: 5,
            wall_timeout_secs: 200,
            idle_timeout_secs: 60,
            max_read_time_secs: 10,
            max_write_time_secs: 10,
            backoff_base_ms: 200,
            cas_timeout_secs: 60,
        }
    }
}

impl WorkerConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("reading config {:?}: {}", path.as_ref(), e))?;
        toml::from_str(&contents).map_err(|e| format!("parsing config: {}", e))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.msg_vis_timeout_secs.saturating_sub(5).max(5))
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.msg_vis_timeout_secs)
    }

    pub fn wall_timeout(&self) -> Duration {
        Duration::from_secs(self.wall_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cas_timeout(&self) -> Duration {
        Duration::from_secs(self.cas_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.pipeline_width, 5);
        assert_eq!(cfg.msg_vis_timeout_secs, 60);
        assert_eq!(cfg.cache_size, 5);
        assert_eq!(cfg.wall_timeout_secs, 200);
        assert_eq!(cfg.idle_timeout_secs, 60);
    }

    #[test]
    fn heartbeat_interval_floors_at_five() {
        let mut cfg = WorkerConfig::default();
        cfg.msg_vis_timeout_secs = 6;
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(5));
        cfg.msg_vis_timeout_secs = 2;
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(5));
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = WorkerConfig::default();
        let s = toml::to_string(&cfg).unwrap();
        let back: WorkerConfig = toml::from_str(&s).unwrap();
        assert_eq!(back.pipeline_width, cfg.pipeline_width);
    }

    #[test]
    fn loads_from_an_actual_toml_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = WorkerConfig::default();
        cfg.pipeline_width = 8;
        cfg.cache_size = 16;
        std::fs::write(&path, toml::to_string_pretty(&cfg).unwrap()).unwrap();

        let loaded = WorkerConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded.pipeline_width, 8);
        assert_eq!(loaded.cache_size, 16);
    }

    #[test]
    fn missing_config_file_is_a_clear_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = WorkerConfig::from_toml_file(dir.path().join("nope.toml")).unwrap_err();
        assert!(err.contains("reading config"));
    }
}
