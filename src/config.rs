use serde::Deserialize;
use std::path::Path;

use crate::host::DriverCapabilities;
use crate::ieee80211::rsn::{Akm, Cipher};
use crate::ieee80211::MacAddr;
use crate::pasn::{PasnSettings, ECC_GROUPS};
use crate::sim::ResponderConfig;
use crate::station::batch::DEFAULT_MAX_BATCH_PEERS;
use crate::station::{
    BatchPeer, StationSettings, DEFAULT_MAX_COMEBACK_RETRIES, DEFAULT_PTKSA_LIFETIME_SECS,
};
use crate::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub station: StationConfig,
    #[serde(default)]
    pub pasn: PasnConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub sim: Option<SimConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub own_addr: MacAddr,
    pub pasn_groups: Vec<u16>,
    pub force_kdk_derivation: bool,
    pub derive_kek: bool,
    /// Driver supports secure LTF
    pub sec_ltf: bool,
    pub sec_rtt: bool,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            own_addr: StationSettings::default().own_addr,
            pasn_groups: vec![19],
            force_kdk_derivation: false,
            derive_kek: false,
            sec_ltf: false,
            sec_rtt: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PasnConfig {
    pub auth_timeout_ms: u64,
    pub ptksa_lifetime_secs: u32,
    pub max_comeback_retries: u8,
    pub max_batch_peers: usize,
}

impl Default for PasnConfig {
    fn default() -> Self {
        Self {
            auth_timeout_ms: 2000,
            ptksa_lifetime_secs: DEFAULT_PTKSA_LIFETIME_SECS,
            max_comeback_retries: DEFAULT_MAX_COMEBACK_RETRIES,
            max_batch_peers: DEFAULT_MAX_BATCH_PEERS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Simulated peers for the binary
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    pub peers: Vec<SimPeerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimPeerConfig {
    pub bssid: MacAddr,
    #[serde(default = "default_ssid")]
    pub ssid: String,
    #[serde(default = "default_freq")]
    pub freq: u32,
    #[serde(default = "default_akms")]
    pub akms: Vec<Akm>,
    #[serde(default = "default_ciphers")]
    pub ciphers: Vec<Cipher>,
    /// Demand an anti-clogging token, handing out this delay in seconds
    pub comeback_after: Option<u16>,
    #[serde(default)]
    pub ltf_keyseed_required: bool,
}

fn default_ssid() -> String {
    "pasn-sim".to_string()
}

fn default_freq() -> u32 {
    2437
}

fn default_akms() -> Vec<Akm> {
    vec![Akm::Pasn]
}

fn default_ciphers() -> Vec<Cipher> {
    vec![Cipher::Ccmp128]
}

impl SimPeerConfig {
    pub fn responder(&self, derive_kek: bool) -> ResponderConfig {
        ResponderConfig {
            ssid: self.ssid.clone(),
            freq: self.freq,
            akms: self.akms.clone(),
            ciphers: self.ciphers.clone(),
            comeback: self
                .comeback_after
                .map(|after| (self.bssid.octets()[3..].to_vec(), after)),
            derive_kek,
            ..ResponderConfig::pasn(self.bssid)
        }
    }

    pub fn batch_peer(&self, own_addr: MacAddr) -> BatchPeer {
        BatchPeer {
            own_addr,
            peer_addr: self.bssid,
            ltf_keyseed_required: self.ltf_keyseed_required,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        let peer = |last: u8| SimPeerConfig {
            bssid: MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last]),
            ssid: default_ssid(),
            freq: default_freq(),
            akms: default_akms(),
            ciphers: default_ciphers(),
            comeback_after: None,
            ltf_keyseed_required: false,
        };
        Self {
            peers: vec![
                peer(0x01),
                SimPeerConfig {
                    comeback_after: Some(1),
                    ltf_keyseed_required: true,
                    ..peer(0x02)
                },
            ],
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.station.pasn_groups.is_empty() {
            anyhow::bail!("station.pasn_groups must not be empty");
        }
        if let Some(g) = self
            .station
            .pasn_groups
            .iter()
            .find(|g| !ECC_GROUPS.contains(g))
        {
            anyhow::bail!("station.pasn_groups: {} is not an elliptic curve group", g);
        }
        if self.pasn.ptksa_lifetime_secs == 0 {
            anyhow::bail!("pasn.ptksa_lifetime_secs must be positive");
        }
        if self.pasn.auth_timeout_ms == 0 {
            anyhow::bail!("pasn.auth_timeout_ms must be positive");
        }
        if self.pasn.max_batch_peers == 0 {
            anyhow::bail!("pasn.max_batch_peers must be positive");
        }
        Ok(())
    }

    pub fn station_settings(&self) -> StationSettings {
        StationSettings {
            own_addr: self.station.own_addr,
            pasn: PasnSettings {
                accepted_groups: self.station.pasn_groups.clone(),
                auth_timeout: Duration::from_millis(self.pasn.auth_timeout_ms),
                force_kdk_derivation: self.station.force_kdk_derivation,
                derive_kek: self.station.derive_kek,
            },
            ptksa_lifetime_secs: self.pasn.ptksa_lifetime_secs,
            max_comeback_retries: self.pasn.max_comeback_retries,
            max_batch_peers: self.pasn.max_batch_peers,
        }
    }

    pub fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            offchannel_tx: true,
            sec_ltf: self.station.sec_ltf,
            sec_rtt: self.station.sec_rtt,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            station: StationConfig::default(),
            pasn: PasnConfig::default(),
            logging: LoggingConfig::default(),
            sim: Some(SimConfig::default()),
        }
    }
}
