//! Configuration for the event loop, its driver and the file handles it owns.
//!
//! [`UringFileConfig`] is handed to [`EventLoop::spawn`]; every file opened on
//! that loop inherits the registry and watchdog settings from it.
//!
//! [`EventLoop::spawn`]: crate::reactor::EventLoop::spawn

use crate::error::{Error, Result};
use crate::logging::LogLevel;
use crate::registry::MAX_CAPACITY;
use std::time::Duration;

/// Complete configuration for an event loop and its files.
#[derive(Debug, Clone, Default)]
pub struct UringFileConfig {
    /// Ring and driver selection
    pub ring: RingConfig,
    /// Per-handle operation registry
    pub registry: RegistryConfig,
    /// Stuck-operation watchdog
    pub watchdog: WatchdogConfig,
    /// Logging and timing metrics
    pub logging: LoggingConfig,
}

/// Which completion driver the event loop runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// io_uring when the kernel allows it, blocking syscalls otherwise
    Auto,
    /// io_uring only; spawning fails if the ring cannot be created
    IoUring,
    /// Synchronous syscalls executed on the loop thread
    Blocking,
}

/// Ring-specific configuration options.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Number of submission queue entries
    pub sq_entries: u32,
    /// Driver selection
    pub driver: DriverKind,
    /// Name of the event loop thread
    pub thread_name: String,
}

/// Per-handle registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum in-flight operations per handle
    pub capacity: usize,
}

/// Stuck-operation watchdog configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Run the periodic scan at all
    pub enabled: bool,
    /// Interval between scans
    pub period: Duration,
    /// Age after which an operation counts as stuck
    pub op_timeout: Duration,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Install the global logger when the event loop starts
    pub enabled: bool,
    /// Minimum log level
    pub level: LogLevel,
    /// Log file path (None = stderr)
    pub log_file: Option<std::path::PathBuf>,
    /// Use JSON format for logs
    pub json_format: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            sq_entries: 256,
            driver: DriverKind::Auto,
            thread_name: "uring-file-loop".to_string(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: Duration::from_secs(1),
            op_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: LogLevel::Info,
            log_file: None,
            json_format: false,
        }
    }
}

impl UringFileConfig {
    /// Small ring and registry, short stuck-operation timeout.
    pub fn low_latency() -> Self {
        Self {
            ring: RingConfig {
                sq_entries: 64,
                ..Default::default()
            },
            registry: RegistryConfig { capacity: 256 },
            watchdog: WatchdogConfig {
                enabled: true,
                period: Duration::from_millis(250),
                op_timeout: Duration::from_secs(5),
            },
            logging: LoggingConfig {
                level: LogLevel::Error,
                ..Default::default()
            },
        }
    }

    /// Verbose logging and an aggressive watchdog for local debugging.
    pub fn development() -> Self {
        Self {
            ring: RingConfig {
                sq_entries: 32,
                ..Default::default()
            },
            registry: RegistryConfig { capacity: 64 },
            watchdog: WatchdogConfig {
                enabled: true,
                period: Duration::from_millis(500),
                op_timeout: Duration::from_secs(5),
            },
            logging: LoggingConfig {
                enabled: true,
                level: LogLevel::Debug,
                log_file: None,
                json_format: false,
            },
        }
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.ring.sq_entries == 0 || self.ring.sq_entries > 32768 {
            return Err(Error::InvalidInput(format!(
                "sq_entries must be in 1..=32768, got {}",
                self.ring.sq_entries
            )));
        }

        if self.registry.capacity == 0 || self.registry.capacity > MAX_CAPACITY {
            return Err(Error::InvalidInput(format!(
                "registry capacity must be in 1..={}, got {}",
                MAX_CAPACITY, self.registry.capacity
            )));
        }

        if self.watchdog.enabled {
            if self.watchdog.period.is_zero() {
                return Err(Error::InvalidInput(
                    "watchdog period must be non-zero".to_string(),
                ));
            }
            if self.watchdog.op_timeout.is_zero() {
                return Err(Error::InvalidInput(
                    "watchdog op_timeout must be non-zero".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Fluent builder for [`UringFileConfig`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: UringFileConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(mut self, ring: RingConfig) -> Self {
        self.config.ring = ring;
        self
    }

    pub fn driver(mut self, driver: DriverKind) -> Self {
        self.config.ring.driver = driver;
        self
    }

    pub fn registry_capacity(mut self, capacity: usize) -> Self {
        self.config.registry.capacity = capacity;
        self
    }

    pub fn watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.config.watchdog = watchdog;
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<UringFileConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UringFileConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.capacity, 4096);
        assert_eq!(config.watchdog.period, Duration::from_secs(1));
        assert_eq!(config.watchdog.op_timeout, Duration::from_secs(30));
        assert_eq!(config.ring.driver, DriverKind::Auto);
    }

    #[test]
    fn test_presets_validate() {
        assert!(UringFileConfig::low_latency().validate().is_ok());

        let config = UringFileConfig::development();
        assert!(config.validate().is_ok());
        assert!(config.logging.enabled);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_registry_capacity_bounds() {
        let mut config = UringFileConfig::default();

        config.registry.capacity = 0;
        assert!(config.validate().is_err());

        config.registry.capacity = MAX_CAPACITY;
        assert!(config.validate().is_ok());

        config.registry.capacity = MAX_CAPACITY + 1;
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_disabled_watchdog_skips_timing_checks() {
        let mut config = UringFileConfig::default();
        config.watchdog.period = Duration::ZERO;
        assert!(config.validate().is_err());

        config.watchdog.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .driver(DriverKind::Blocking)
            .registry_capacity(8)
            .build()
            .unwrap();

        assert_eq!(config.ring.driver, DriverKind::Blocking);
        assert_eq!(config.registry.capacity, 8);

        assert!(ConfigBuilder::new().registry_capacity(0).build().is_err());
    }
}
