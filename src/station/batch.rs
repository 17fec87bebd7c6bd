//! Batch authentication for secure ranging
//!
//! Peers are processed strictly one after another; the next peer is only
//! submitted once the previous one has a terminal result.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::{BssInfo, Collaborators};
use crate::ieee80211::rsn::{rsnx_capab, Akm, Cipher};
use crate::ieee80211::MacAddr;
use crate::pasn::ConfigError;

/// Upper bound on peers per batch when not configured
pub const DEFAULT_MAX_BATCH_PEERS: usize = 10;

/// Group used for every batch exchange (P-256)
pub const BATCH_GROUP: u16 = 19;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPeer {
    pub own_addr: MacAddr,
    pub peer_addr: MacAddr,
    #[serde(default)]
    pub ltf_keyseed_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAction {
    Authenticate,
    /// Drop cached keys (and ranging contexts) without running PASN
    DeleteSecureRangingContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerResult {
    pub own_addr: MacAddr,
    pub peer_addr: MacAddr,
    pub status: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("a batch is already in progress")]
    Active,
    #[error("empty peer list")]
    Empty,
    #[error("{count} peers requested, at most {max} allowed")]
    TooMany { count: usize, max: usize },
}

#[derive(Debug)]
pub struct BatchState {
    action: BatchAction,
    peers: Vec<BatchPeer>,
    results: Vec<u16>,
}

impl BatchState {
    pub fn new(action: BatchAction, peers: Vec<BatchPeer>, max: usize) -> Result<Self, BatchError> {
        if peers.is_empty() {
            return Err(BatchError::Empty);
        }
        if peers.len() > max {
            return Err(BatchError::TooMany {
                count: peers.len(),
                max,
            });
        }
        Ok(Self {
            action,
            results: Vec::with_capacity(peers.len()),
            peers,
        })
    }

    pub fn action(&self) -> BatchAction {
        self.action
    }

    pub fn peers(&self) -> &[BatchPeer] {
        &self.peers
    }

    /// Peer at the cursor
    pub fn current(&self) -> Option<&BatchPeer> {
        self.peers.get(self.results.len())
    }

    /// Record the result for the peer at the cursor and advance
    pub fn record(&mut self, status: u16) {
        if self.results.len() < self.peers.len() {
            self.results.push(status);
        }
    }

    pub fn is_done(&self) -> bool {
        self.results.len() == self.peers.len()
    }

    pub fn into_results(self) -> Vec<PeerResult> {
        self.peers
            .into_iter()
            .zip(self.results)
            .map(|(p, status)| PeerResult {
                own_addr: p.own_addr,
                peer_addr: p.peer_addr,
                status,
            })
            .collect()
    }
}

/// Pick AKM, cipher and group for a peer from what it advertises and what
/// credentials we hold.
///
/// AKM priority: SAE (H2E advertised and a password configured), FILS
/// SHA-384 then SHA-256 (ERP key available), FT (PMK-R1 available), then
/// plain PASN.
pub fn select_parameters(bss: &BssInfo, c: &Collaborators) -> Result<(Akm, Cipher, u16), ConfigError> {
    let rsn = bss
        .rsn()
        .ok_or(ConfigError::MissingRsne)?
        .map_err(ConfigError::InvalidRsne)?;
    let profile = c.bss.network_profile(&bss.ssid);

    let sae_ok = rsn.has_akm(Akm::Sae)
        && bss.rsnx().has(rsnx_capab::SAE_H2E)
        && profile.as_ref().map_or(false, |p| p.sae_password.is_some());
    let erp_ok = profile.as_ref().map_or(false, |p| p.erp);

    let akm = if sae_ok {
        Akm::Sae
    } else if erp_ok && rsn.has_akm(Akm::FilsSha384) {
        Akm::FilsSha384
    } else if erp_ok && rsn.has_akm(Akm::FilsSha256) {
        Akm::FilsSha256
    } else if let Some(ft) = Akm::ALL
        .into_iter()
        .filter(|a| a.is_ft() && rsn.has_akm(*a))
        .find(|a| c.pmksa.ft_pmk_r1(bss.bssid, *a).is_some())
    {
        ft
    } else if rsn.has_akm(Akm::Pasn) {
        Akm::Pasn
    } else {
        return Err(ConfigError::NoUsableAkm);
    };

    let cipher = rsn.best_cipher().ok_or(ConfigError::NoUsableCipher)?;
    Ok((akm, cipher, BATCH_GROUP))
}
