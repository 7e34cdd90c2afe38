//! Process-level configuration
//!
//! Loaded from a YAML file merged with `ACQSRV_`-prefixed environment
//! variables. The resilience section carries network profiles tuned for
//! the link classes the fleet runs on; with `auto_adjust` enabled the
//! named profile overrides the individual timeout fields.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::acquisition::registry::{RegistryConfig, WorkerTemplate};
use crate::error::Result;
use crate::point::Point;
use crate::sink::telegraf::DEFAULT_SOCKET_PATH;

/// Network class the devices are reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    Lan,
    Cellular4g,
    Satellite,
}

/// Connection resilience settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Apply the `network_type` profile instead of the explicit fields.
    pub auto_adjust: bool,
    pub network_type: NetworkType,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    pub request_timeout_ms: u64,
    pub connection_timeout_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            auto_adjust: true,
            network_type: NetworkType::Lan,
            heartbeat_enabled: false,
            heartbeat_interval_ms: 30_000,
            retry_delay_ms: 1000,
            max_retries: 3,
            request_timeout_ms: 3000,
            connection_timeout_ms: 5000,
        }
    }
}

impl ResilienceConfig {
    /// Resolve the effective settings, applying the network profile when
    /// `auto_adjust` is set.
    pub fn effective(&self) -> ResilienceConfig {
        if !self.auto_adjust {
            return self.clone();
        }
        let mut resolved = self.clone();
        match self.network_type {
            NetworkType::Lan => {
                resolved.connection_timeout_ms = 5000;
                resolved.request_timeout_ms = 3000;
                resolved.max_retries = 3;
                resolved.retry_delay_ms = 1000;
                resolved.heartbeat_interval_ms = 60_000;
            },
            NetworkType::Cellular4g => {
                resolved.connection_timeout_ms = 15_000;
                resolved.request_timeout_ms = 12_000;
                resolved.max_retries = 8;
                resolved.retry_delay_ms = 3000;
                resolved.heartbeat_interval_ms = 20_000;
            },
            NetworkType::Satellite => {
                resolved.connection_timeout_ms = 20_000;
                resolved.request_timeout_ms = 15_000;
                resolved.max_retries = 10;
                resolved.retry_delay_ms = 5000;
                resolved.heartbeat_interval_ms = 15_000;
            },
        }
        resolved
    }
}

/// How worker tasks are scheduled onto runtime threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadingMode {
    #[default]
    Auto,
    Single,
    Multi,
}

/// Acquisition-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub telegraf_socket_path: String,
    pub threading_mode: ThreadingMode,
    pub max_worker_threads: usize,
    pub device_count_threshold: usize,
    pub default_poll_ms: u64,
    pub load_balancing_enabled: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            telegraf_socket_path: DEFAULT_SOCKET_PATH.to_string(),
            threading_mode: ThreadingMode::Auto,
            max_worker_threads: 8,
            device_count_threshold: 4,
            default_poll_ms: 2000,
            load_balancing_enabled: false,
        }
    }
}

impl AcquisitionConfig {
    /// Resolve `auto` by comparing the device count to the threshold.
    pub fn resolve_threading(&self, device_count: usize) -> ThreadingMode {
        match self.threading_mode {
            ThreadingMode::Auto => {
                if device_count >= self.device_count_threshold {
                    ThreadingMode::Multi
                } else {
                    ThreadingMode::Single
                }
            },
            explicit => explicit,
        }
    }
}

/// Complete process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub resilience: ResilienceConfig,
    pub acquisition: AcquisitionConfig,
    pub points: Vec<Point>,
}

impl AppConfig {
    /// Load from a YAML file merged with `ACQSRV_` environment
    /// overrides (nested keys separated by `__`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("ACQSRV_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for point in &self.points {
            point.validate()?;
        }
        Ok(())
    }

    /// Count of distinct devices in the configured point set.
    pub fn device_count(&self) -> usize {
        let mut keys: Vec<String> = self.points.iter().map(|p| p.device_key()).collect();
        keys.sort();
        keys.dedup();
        keys.len()
    }

    /// Registry configuration derived from the resolved resilience
    /// profile and the acquisition settings.
    pub fn registry_config(&self) -> RegistryConfig {
        let resilience = self.resilience.effective();
        RegistryConfig {
            worker: WorkerTemplate {
                base_poll_ms: self.acquisition.default_poll_ms,
                connect_timeout: Duration::from_millis(resilience.connection_timeout_ms),
                request_timeout: Duration::from_millis(resilience.request_timeout_ms),
                heartbeat_enabled: resilience.heartbeat_enabled,
                heartbeat_interval_ms: resilience.heartbeat_interval_ms,
                queue_capacity: crate::acquisition::queue::DEFAULT_QUEUE_CAPACITY,
            },
            load_balancing_enabled: self.acquisition.load_balancing_enabled,
            ..RegistryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.acquisition.telegraf_socket_path, DEFAULT_SOCKET_PATH);
        assert_eq!(config.acquisition.default_poll_ms, 2000);
        assert_eq!(config.resilience.network_type, NetworkType::Lan);
        assert!(config.resilience.auto_adjust);
    }

    #[test]
    fn test_lan_profile() {
        let resilience = ResilienceConfig {
            auto_adjust: true,
            network_type: NetworkType::Lan,
            ..ResilienceConfig::default()
        };
        let effective = resilience.effective();
        assert_eq!(effective.connection_timeout_ms, 5000);
        assert_eq!(effective.request_timeout_ms, 3000);
        assert_eq!(effective.max_retries, 3);
        assert_eq!(effective.retry_delay_ms, 1000);
        assert_eq!(effective.heartbeat_interval_ms, 60_000);
    }

    #[test]
    fn test_cellular_profile() {
        let resilience = ResilienceConfig {
            auto_adjust: true,
            network_type: NetworkType::Cellular4g,
            ..ResilienceConfig::default()
        };
        let effective = resilience.effective();
        assert_eq!(effective.connection_timeout_ms, 15_000);
        assert_eq!(effective.request_timeout_ms, 12_000);
        assert_eq!(effective.max_retries, 8);
        assert_eq!(effective.retry_delay_ms, 3000);
        assert_eq!(effective.heartbeat_interval_ms, 20_000);
    }

    #[test]
    fn test_satellite_profile_is_harshest() {
        let resilience = ResilienceConfig {
            auto_adjust: true,
            network_type: NetworkType::Satellite,
            ..ResilienceConfig::default()
        };
        let effective = resilience.effective();
        assert!(effective.connection_timeout_ms > 15_000);
        assert!(effective.request_timeout_ms > 12_000);
        assert!(effective.max_retries > 8);
    }

    #[test]
    fn test_auto_adjust_off_keeps_explicit_values() {
        let resilience = ResilienceConfig {
            auto_adjust: false,
            network_type: NetworkType::Satellite,
            request_timeout_ms: 1234,
            ..ResilienceConfig::default()
        };
        assert_eq!(resilience.effective().request_timeout_ms, 1234);
    }

    #[test]
    fn test_threading_resolution() {
        let acquisition = AcquisitionConfig {
            threading_mode: ThreadingMode::Auto,
            device_count_threshold: 4,
            ..AcquisitionConfig::default()
        };
        assert_eq!(acquisition.resolve_threading(1), ThreadingMode::Single);
        assert_eq!(acquisition.resolve_threading(4), ThreadingMode::Multi);

        let acquisition = AcquisitionConfig {
            threading_mode: ThreadingMode::Single,
            ..AcquisitionConfig::default()
        };
        assert_eq!(acquisition.resolve_threading(100), ThreadingMode::Single);
    }

    #[test]
    fn test_load_from_yaml() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        write!(
            file,
            r#"
resilience:
  auto_adjust: false
  request_timeout_ms: 2500
acquisition:
  telegraf_socket_path: /run/telegraf.sock
  default_poll_ms: 1500
points:
  - name: pressure
    host: 192.168.1.10
    port: 502
    address: 104
    data_type: float32
    measurement: pressure
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.resilience.request_timeout_ms, 2500);
        assert_eq!(config.acquisition.telegraf_socket_path, "/run/telegraf.sock");
        assert_eq!(config.points.len(), 1);
        assert_eq!(config.device_count(), 1);
        assert_eq!(config.points[0].name, "pressure");
    }

    #[test]
    fn test_load_rejects_invalid_point() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        write!(
            file,
            r#"
points:
  - name: broken
    host: 192.168.1.10
    port: 502
    address: 65535
    data_type: double64
    measurement: m
"#
        )
        .unwrap();
        assert!(AppConfig::load(file.path()).is_err());
    }
}
