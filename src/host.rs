//! Interfaces implemented by the host integration layer
//!
//! The station never talks to a driver, a scan table or a credential store
//! directly. Each of those is a trait here, injected at construction as part
//! of [`Collaborators`].

use anyhow::Result;
use zeroize::Zeroizing;

use crate::ieee80211::rsn::{Akm, Cipher, Pmkid, RsnElement, RsnError, Rsnxe};
use crate::ieee80211::MacAddr;
use crate::pasn::crypto::CryptoSuite;
use crate::pasn::wrapped::{ErpBackend, SaeBackend};
use crate::time::Clock;

/// What the driver can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverCapabilities {
    /// Off-channel management frame transmission
    pub offchannel_tx: bool,
    /// Secure LTF for ranging
    pub sec_ltf: bool,
    pub sec_rtt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingContextAction {
    Add,
    Delete,
}

/// Keys handed to the driver for secure ranging with one peer
#[derive(Debug, Clone)]
pub struct SecureRangingContext {
    pub own_addr: MacAddr,
    pub peer_addr: MacAddr,
    pub action: RangingContextAction,
    pub cipher: Option<Cipher>,
    pub tk: Zeroizing<Vec<u8>>,
    pub kdk: Zeroizing<Vec<u8>>,
    pub ltf_keyseed_required: bool,
}

impl SecureRangingContext {
    /// Remove whatever context the driver holds for `peer_addr`
    pub fn delete(own_addr: MacAddr, peer_addr: MacAddr) -> Self {
        Self {
            own_addr,
            peer_addr,
            action: RangingContextAction::Delete,
            cipher: None,
            tk: Zeroizing::new(Vec::new()),
            kdk: Zeroizing::new(Vec::new()),
            ltf_keyseed_required: false,
        }
    }
}

/// Management frame transmit path
pub trait FrameSender {
    fn capabilities(&self) -> DriverCapabilities;

    /// Transmit a management frame on `freq`, staying on channel for
    /// `wait_ms`. Completion is reported later as a transmit status.
    fn send_mgmt(&mut self, frame: &[u8], no_ack: bool, freq: u32, wait_ms: u32) -> Result<()>;

    fn set_secure_ranging_context(&mut self, _ctx: &SecureRangingContext) -> Result<()> {
        Ok(())
    }
}

/// Security parameters a BSS advertises in its Beacon/Probe Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BssInfo {
    pub bssid: MacAddr,
    pub ssid: String,
    pub freq: u32,
    /// RSNE, element header included
    pub rsne: Option<Vec<u8>>,
    /// RSNXE, element header included
    pub rsnxe: Option<Vec<u8>>,
}

impl BssInfo {
    pub fn rsn(&self) -> Option<Result<RsnElement, RsnError>> {
        self.rsne
            .as_deref()
            .map(|ie| RsnElement::parse(ie.get(2..).unwrap_or(&[])))
    }

    pub fn rsnx(&self) -> Rsnxe {
        self.rsnxe
            .as_deref()
            .map(|ie| Rsnxe::parse(ie.get(2..).unwrap_or(&[])))
            .unwrap_or_default()
    }

    /// RSNE || RSNXE as advertised, used as MIC input for frame 2
    pub fn rsne_rsnxe(&self) -> Vec<u8> {
        let mut out = self.rsne.clone().unwrap_or_default();
        if let Some(x) = &self.rsnxe {
            out.extend_from_slice(x);
        }
        out
    }
}

/// Credentials configured for a network
#[derive(Debug, Clone, Default)]
pub struct NetworkProfile {
    pub ssid: String,
    pub sae_password: Option<Zeroizing<String>>,
    /// An ERP key is available for FILS
    pub erp: bool,
}

/// Scan results and configured networks
pub trait BssLookup {
    fn lookup(&self, addr: MacAddr) -> Option<BssInfo>;

    /// Re-fetch the entry, scanning if needed
    fn refresh(&mut self, addr: MacAddr) -> Option<BssInfo> {
        self.lookup(addr)
    }

    /// BSS the station is currently associated with
    fn current_bssid(&self) -> Option<MacAddr>;

    fn network_profile(&self, ssid: &str) -> Option<NetworkProfile>;
}

#[derive(Clone)]
pub struct PmksaEntry {
    pub peer: MacAddr,
    pub pmkid: Pmkid,
    pub pmk: Zeroizing<Vec<u8>>,
    pub akm: Akm,
}

impl std::fmt::Debug for PmksaEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmksaEntry")
            .field("peer", &self.peer)
            .field("pmkid", &hex::encode(self.pmkid))
            .field("akm", &self.akm)
            .finish_non_exhaustive()
    }
}

/// PMK security associations and FT key hierarchy
pub trait PmksaStore {
    /// Entry for `peer`/`akm`, restricted to `pmkid` when given
    fn get(&self, peer: MacAddr, pmkid: Option<&Pmkid>, akm: Akm) -> Option<PmksaEntry>;

    /// PMK-R1 and its name for an FT AKM
    fn ft_pmk_r1(&self, _peer: MacAddr, _akm: Akm) -> Option<(Zeroizing<Vec<u8>>, Pmkid)> {
        None
    }

    /// Offer a PMKSA established through wrapped data
    fn store(&mut self, _entry: PmksaEntry) {}
}

/// In-memory PMKSA list
#[derive(Debug, Default)]
pub struct PmksaList {
    entries: Vec<PmksaEntry>,
}

impl PmksaList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PmksaStore for PmksaList {
    fn get(&self, peer: MacAddr, pmkid: Option<&Pmkid>, akm: Akm) -> Option<PmksaEntry> {
        self.entries
            .iter()
            .find(|e| e.peer == peer && e.akm == akm && pmkid.map_or(true, |id| *id == e.pmkid))
            .cloned()
    }

    fn store(&mut self, entry: PmksaEntry) {
        self.entries
            .retain(|e| !(e.peer == entry.peer && e.akm == entry.akm));
        self.entries.push(entry);
    }
}

/// Supplies SAE and ERP engines for wrapped-data exchanges
pub trait WrappedDataBackends {
    fn sae(&self) -> Option<Box<dyn SaeBackend>> {
        None
    }

    fn erp(&self) -> Option<Box<dyn ErpBackend>> {
        None
    }
}

/// No SAE or FILS support
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackends;

impl WrappedDataBackends for NoBackends {}

/// Everything the station calls out to
pub struct Collaborators {
    pub sender: Box<dyn FrameSender>,
    pub bss: Box<dyn BssLookup>,
    pub pmksa: Box<dyn PmksaStore>,
    pub crypto: Box<dyn CryptoSuite>,
    pub backends: Box<dyn WrappedDataBackends>,
    pub clock: Box<dyn Clock>,
}
