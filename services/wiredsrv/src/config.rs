//! Service configuration
//!
//! Loaded through `common::config_loader`: defaults, then the config file,
//! then `WIREDSRV_*` environment variables (`WIREDSRV_BUS__CENTRAL_ADDRESS`).

use common::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::packet::BROADCAST;
use crate::error::{Result, WiredError};

pub const ENV_PREFIX: &str = "WIREDSRV_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WiredsrvConfig {
    pub service: ServiceConfig,
    /// Directory of device description XML files
    pub descriptors_dir: PathBuf,
    /// SQLite file for parameter slots and cached configuration blocks
    pub database_path: PathBuf,
    pub bus: BusConfig,
    pub peers: Vec<PeerConfig>,
}

impl Default for WiredsrvConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            descriptors_dir: PathBuf::from("devices"),
            database_path: PathBuf::from("data/wiredsrv.db"),
            bus: BusConfig::default(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub log: LogConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "wiredsrv".to_string(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Address of this node on the bus
    pub central_address: u32,
    pub timings: BusTimings,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            central_address: 0x0000_0001,
            timings: BusTimings::default(),
        }
    }
}

/// Protocol timing, all in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusTimings {
    /// Minimum quiet time between frames of different exchanges
    pub min_gap_ms: u64,
    /// A frame from the destination younger than this skips the busy wait
    pub rx_window_ms: u64,
    /// Busy-wait polling slice
    pub busy_poll_ms: u64,
    /// Upper bound of the random de-synchronisation delay
    pub backoff_max_ms: u64,
    pub attempts: u32,
    pub short_polls: u32,
    pub short_poll_ms: u64,
    pub long_polls: u32,
    pub long_poll_ms: u64,
    /// Pause after each bus lock/unlock frame
    pub lock_settle_ms: u64,
    /// Pause before unlocking
    pub unlock_delay_ms: u64,
    /// Pause before acknowledging a received frame
    pub response_delay_ms: u64,
}

impl Default for BusTimings {
    fn default() -> Self {
        Self {
            min_gap_ms: 210,
            rx_window_ms: 50,
            busy_poll_ms: 50,
            backoff_max_ms: 100,
            attempts: 3,
            short_polls: 5,
            short_poll_ms: 5,
            long_polls: 7,
            long_poll_ms: 25,
            lock_settle_ms: 100,
            unlock_delay_ms: 30,
            response_delay_ms: 0,
        }
    }
}

impl BusTimings {
    /// Near-zero waits for in-process buses
    pub fn fast() -> Self {
        Self {
            min_gap_ms: 0,
            rx_window_ms: 0,
            busy_poll_ms: 1,
            backoff_max_ms: 0,
            attempts: 3,
            short_polls: 5,
            short_poll_ms: 1,
            long_polls: 7,
            long_poll_ms: 5,
            lock_settle_ms: 0,
            unlock_delay_ms: 0,
            response_delay_ms: 0,
        }
    }

    pub fn min_gap(&self) -> Duration {
        Duration::from_millis(self.min_gap_ms)
    }

    pub fn rx_window(&self) -> Duration {
        Duration::from_millis(self.rx_window_ms)
    }

    pub fn busy_poll(&self) -> Duration {
        Duration::from_millis(self.busy_poll_ms.max(1))
    }

    /// Sleep slices of one attempt's response wait, short ones first
    pub fn poll_schedule(&self) -> impl Iterator<Item = Duration> {
        let short = std::iter::repeat(Duration::from_millis(self.short_poll_ms))
            .take(self.short_polls as usize);
        let long = std::iter::repeat(Duration::from_millis(self.long_poll_ms))
            .take(self.long_polls as usize);
        short.chain(long)
    }

    pub fn lock_settle(&self) -> Duration {
        Duration::from_millis(self.lock_settle_ms)
    }

    pub fn unlock_delay(&self) -> Duration {
        Duration::from_millis(self.unlock_delay_ms)
    }

    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }
}

/// Statically configured peer, bound to a description at start-up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: u64,
    pub address: u32,
    #[serde(default)]
    pub serial_number: String,
    pub type_code: u16,
    pub firmware_version: i32,
    #[serde(default)]
    pub channel_count: Option<u32>,
}

impl WiredsrvConfig {
    /// Defaults < file < environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = common::config_loader::load_config(path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let central = self.bus.central_address;
        if central == 0 || central == BROADCAST {
            return Err(WiredError::config(format!(
                "central_address 0x{:08X} is reserved",
                central
            )));
        }
        if self.bus.timings.attempts == 0 {
            return Err(WiredError::config("bus.timings.attempts must be at least 1"));
        }
        if self.descriptors_dir.as_os_str().is_empty() {
            return Err(WiredError::config("descriptors_dir is empty"));
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.address) {
                return Err(WiredError::config(format!(
                    "peer address 0x{:08X} configured twice",
                    peer.address
                )));
            }
            if peer.address == central || peer.address == BROADCAST {
                return Err(WiredError::config(format!(
                    "peer {} uses reserved address 0x{:08X}",
                    peer.id, peer.address
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_protocol_defaults() {
        let timings = BusTimings::default();
        assert_eq!(timings.min_gap(), Duration::from_millis(210));
        assert_eq!(timings.attempts, 3);
        let schedule: Vec<_> = timings.poll_schedule().collect();
        assert_eq!(schedule.len(), 12);
        assert_eq!(schedule[0], Duration::from_millis(5));
        assert_eq!(schedule[11], Duration::from_millis(25));
        let total: Duration = schedule.iter().sum();
        assert_eq!(total, Duration::from_millis(200));
    }

    #[test]
    fn test_yaml_file_and_env_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "wiredsrv.yaml",
                r#"
descriptors_dir: /etc/hub/devices
bus:
  central_address: 2
  timings:
    attempts: 5
peers:
  - id: 7
    address: 66
    type_code: 4116
    firmware_version: 771
"#,
            )?;
            jail.set_env("WIREDSRV_DATABASE_PATH", "/var/lib/hub/wired.db");
            jail.set_env("WIREDSRV_SERVICE__LOG__LEVEL", "debug");

            let config = WiredsrvConfig::load(Some(Path::new("wiredsrv.yaml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.descriptors_dir, PathBuf::from("/etc/hub/devices"));
            assert_eq!(config.database_path, PathBuf::from("/var/lib/hub/wired.db"));
            assert_eq!(config.service.log.level, "debug");
            assert_eq!(config.bus.central_address, 2);
            assert_eq!(config.bus.timings.attempts, 5);
            assert_eq!(config.bus.timings.min_gap_ms, 210);
            assert_eq!(config.peers.len(), 1);
            assert_eq!(config.peers[0].type_code, 0x1014);
            assert_eq!(config.peers[0].channel_count, None);
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_reserved_addresses() {
        let mut config = WiredsrvConfig::default();
        assert!(config.validate().is_ok());

        config.bus.central_address = BROADCAST;
        assert!(matches!(config.validate(), Err(WiredError::Config(_))));

        config.bus.central_address = 1;
        let peer = PeerConfig {
            id: 1,
            address: 0x42,
            serial_number: "JEQ0000001".into(),
            type_code: 0x1014,
            firmware_version: 0x0303,
            channel_count: None,
        };
        config.peers = vec![peer.clone(), PeerConfig { id: 2, ..peer }];
        assert!(config.validate().is_err());
    }
}
