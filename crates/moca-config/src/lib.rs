//! Configuration for the MoCA interface state manager.
//!
//! A TOML file plus `MOCA_` environment overrides, layered with figment
//! and translated into a validated [`moca_core::ControllerConfig`].
//! The core crate never touches disk; binaries load through here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use moca_core::{ChannelRange, ControllerConfig, IfIndex, InvalidArgument};

/// Environment prefix. Nested keys use a double underscore, e.g.
/// `MOCA_CONTROLLER__ACA_POLL_RETRIES=5`.
pub const ENV_PREFIX: &str = "MOCA_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error(transparent)]
    Core(#[from] InvalidArgument),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl ConfigError {
    fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSection,

    #[serde(default)]
    pub simulator: SimulatorSection,
}

/// Controller tunables. Durations are plain integers so the file stays
/// readable without a duration grammar.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerSection {
    pub gateway_timeout_ms: u64,
    pub aca_ack_timeout_ms: u64,
    pub aca_cancel_timeout_ms: u64,
    pub aca_poll_interval_ms: u64,
    pub aca_deadline_secs: u64,
    pub aca_poll_retries: u32,
    pub aca_channel_min: u32,
    pub aca_channel_max: u32,
    pub observer_timeout_ms: u64,
    /// Zero disables the dynamic-info cache.
    pub dynamic_info_max_age_ms: u64,
    /// Zero disables periodic topology refresh.
    pub refresh_interval_secs: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for ControllerSection {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            gateway_timeout_ms: millis(config.gateway_timeout),
            aca_ack_timeout_ms: millis(config.aca_ack_timeout),
            aca_cancel_timeout_ms: millis(config.aca_cancel_timeout),
            aca_poll_interval_ms: millis(config.aca_poll_interval),
            aca_deadline_secs: config.aca_deadline.as_secs(),
            aca_poll_retries: config.aca_poll_retries,
            aca_channel_min: config.aca_channels.min,
            aca_channel_max: config.aca_channels.max,
            observer_timeout_ms: millis(config.observer_timeout),
            dynamic_info_max_age_ms: millis(config.dynamic_info_max_age),
            refresh_interval_secs: config.refresh_interval.as_secs(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ControllerSection {
    /// Validate and convert into the core's runtime configuration.
    pub fn to_controller_config(&self) -> Result<ControllerConfig, ConfigError> {
        for (field, value) in [
            ("gateway_timeout_ms", self.gateway_timeout_ms),
            ("aca_ack_timeout_ms", self.aca_ack_timeout_ms),
            ("aca_cancel_timeout_ms", self.aca_cancel_timeout_ms),
            ("aca_poll_interval_ms", self.aca_poll_interval_ms),
            ("aca_deadline_secs", self.aca_deadline_secs),
            ("observer_timeout_ms", self.observer_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::validation(field, "must be greater than zero"));
            }
        }
        if self.aca_poll_retries == 0 {
            return Err(ConfigError::validation(
                "aca_poll_retries",
                "must allow at least one attempt",
            ));
        }
        if Duration::from_millis(self.aca_poll_interval_ms)
            >= Duration::from_secs(self.aca_deadline_secs)
        {
            return Err(ConfigError::validation(
                "aca_poll_interval_ms",
                "must be shorter than aca_deadline_secs",
            ));
        }

        Ok(ControllerConfig {
            gateway_timeout: Duration::from_millis(self.gateway_timeout_ms),
            aca_ack_timeout: Duration::from_millis(self.aca_ack_timeout_ms),
            aca_cancel_timeout: Duration::from_millis(self.aca_cancel_timeout_ms),
            aca_poll_interval: Duration::from_millis(self.aca_poll_interval_ms),
            aca_deadline: Duration::from_secs(self.aca_deadline_secs),
            aca_poll_retries: self.aca_poll_retries,
            aca_channels: ChannelRange::new(self.aca_channel_min, self.aca_channel_max)?,
            observer_timeout: Duration::from_millis(self.observer_timeout_ms),
            dynamic_info_max_age: Duration::from_millis(self.dynamic_info_max_age_ms),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
        })
    }
}

/// Settings for the simulated gateway used by `mocad`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulatorSection {
    /// Interface indices to bring up.
    pub interfaces: Vec<u32>,
    /// Devices seeded per interface (at most 16).
    pub devices_per_interface: u32,
    /// Artificial latency added to every gateway call.
    pub latency_ms: u64,
    /// Period of synthetic join/leave events. Zero disables churn.
    pub churn_interval_ms: u64,
}

impl Default for SimulatorSection {
    fn default() -> Self {
        Self {
            interfaces: vec![0],
            devices_per_interface: 4,
            latency_ms: 0,
            churn_interval_ms: 2_000,
        }
    }
}

impl SimulatorSection {
    /// Interface indices, validated and deduplicated in ascending order.
    pub fn interface_indices(&self) -> Result<Vec<IfIndex>, ConfigError> {
        let mut indices = self
            .interfaces
            .iter()
            .map(|raw| IfIndex::new(*raw))
            .collect::<Result<Vec<_>, _>>()?;
        indices.sort_unstable();
        indices.dedup();
        if indices.is_empty() {
            return Err(ConfigError::validation(
                "simulator.interfaces",
                "at least one interface is required",
            ));
        }
        Ok(indices)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.interface_indices()?;
        if self.devices_per_interface > 16 {
            return Err(ConfigError::validation(
                "simulator.devices_per_interface",
                format!("{} exceeds the 16-node network limit", self.devices_per_interface),
            ));
        }
        Ok(())
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn churn_interval(&self) -> Duration {
        Duration::from_millis(self.churn_interval_ms)
    }
}

impl Config {
    /// Validate every section. Returns the core configuration on success.
    pub fn validate(&self) -> Result<ControllerConfig, ConfigError> {
        self.simulator.validate()?;
        self.controller.to_controller_config()
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "moca", "moca-ism").map_or_else(
        || PathBuf::from("moca.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

fn figment_for(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load defaults, then `path` (if it exists), then the environment.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = figment_for(path).extract()?;
    Ok(config)
}

/// Load from the platform config path.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`, creating parents.
pub fn save_config_to(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_core() {
        let config = Config::default();
        assert_eq!(config.validate().unwrap(), ControllerConfig::default());
    }

    #[test]
    fn file_and_env_layer_over_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "moca.toml",
                r"
                [controller]
                aca_poll_interval_ms = 250
                aca_channel_max = 31
                refresh_interval_secs = 0

                [simulator]
                interfaces = [2, 0, 2]
                ",
            )?;
            jail.set_env("MOCA_CONTROLLER__ACA_POLL_RETRIES", "7");

            let config = load_config_from(Path::new("moca.toml")).unwrap();
            let core = config.validate().unwrap();
            assert_eq!(core.aca_poll_interval, Duration::from_millis(250));
            assert_eq!(core.aca_channels, ChannelRange::new(0, 31).unwrap());
            assert_eq!(core.aca_poll_retries, 7);
            assert!(core.refresh_interval.is_zero());
            assert_eq!(core.gateway_timeout, Duration::from_secs(2));
            assert_eq!(
                config.simulator.interface_indices().unwrap(),
                vec![IfIndex::new(0).unwrap(), IfIndex::new(2).unwrap()]
            );
            Ok(())
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_jail| {
            let config = load_config_from(Path::new("absent.toml")).unwrap();
            assert_eq!(config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn malformed_value_is_reported() {
        Jail::expect_with(|jail| {
            jail.create_file("moca.toml", "[controller]\naca_poll_retries = \"many\"\n")?;
            let err = load_config_from(Path::new("moca.toml")).unwrap_err();
            assert!(matches!(err, ConfigError::Figment(_)));
            Ok(())
        });
    }

    #[test]
    fn rejects_zero_timeouts_and_retries() {
        let mut section = ControllerSection {
            gateway_timeout_ms: 0,
            ..ControllerSection::default()
        };
        assert!(matches!(
            section.to_controller_config(),
            Err(ConfigError::Validation { field, .. }) if field == "gateway_timeout_ms"
        ));

        section.gateway_timeout_ms = 100;
        section.aca_poll_retries = 0;
        assert!(section.to_controller_config().is_err());
    }

    #[test]
    fn rejects_inverted_channel_range() {
        let section = ControllerSection {
            aca_channel_min: 40,
            aca_channel_max: 10,
            ..ControllerSection::default()
        };
        assert!(matches!(
            section.to_controller_config(),
            Err(ConfigError::Core(InvalidArgument::Field { field: "aca_channels", .. }))
        ));
    }

    #[test]
    fn rejects_bad_simulator_settings() {
        let mut sim = SimulatorSection {
            interfaces: vec![999],
            ..SimulatorSection::default()
        };
        assert!(matches!(sim.validate(), Err(ConfigError::Core(InvalidArgument::IfIndex(999)))));

        sim.interfaces.clear();
        assert!(sim.validate().is_err());

        sim.interfaces = vec![0];
        sim.devices_per_interface = 17;
        assert!(sim.validate().is_err());
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.controller.observer_timeout_ms = 75;
        config.simulator.latency_ms = 3;

        save_config_to(&path, &config).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("observer_timeout_ms = 75"));

        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
