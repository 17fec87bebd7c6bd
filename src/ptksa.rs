//! PTKSA cache
//!
//! Bounded list of pairwise transient keys, kept sorted by expiration.
//! Removal through [`KeyCache::flush`] or [`KeyCache::sweep`] runs the
//! entry's eviction callback; replacement by [`KeyCache::add`] and
//! [`KeyCache::deinit`] do not.

use thiserror::Error;
use tracing::{debug, info};

use crate::ieee80211::rsn::Cipher;
use crate::ieee80211::MacAddr;
use crate::pasn::crypto::Ptk;
use crate::time::{Duration, Timestamp};

/// Maximum number of live entries
pub const PTKSA_CACHE_MAX_ENTRIES: usize = 16;

/// Called once with an entry when it is flushed or expires
pub type EvictCallback = Box<dyn FnOnce(&PtksaEntry)>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("PTKSA cache full ({0} entries)")]
pub struct CacheFull(pub usize);

pub struct PtksaEntry {
    pub own_addr: MacAddr,
    pub peer_addr: MacAddr,
    pub cipher: Cipher,
    pub created: Timestamp,
    pub expiration: Timestamp,
    pub ptk: Ptk,
    on_evict: Option<EvictCallback>,
}

impl std::fmt::Debug for PtksaEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtksaEntry")
            .field("own_addr", &self.own_addr)
            .field("peer_addr", &self.peer_addr)
            .field("cipher", &self.cipher)
            .field("created", &self.created)
            .field("expiration", &self.expiration)
            .field("on_evict", &self.on_evict.is_some())
            .finish_non_exhaustive()
    }
}

impl PtksaEntry {
    fn evict(mut self) {
        if let Some(cb) = self.on_evict.take() {
            cb(&self);
        }
    }

    fn matches(&self, peer: Option<MacAddr>, cipher: Option<Cipher>) -> bool {
        peer.map_or(true, |p| p == self.peer_addr) && cipher.map_or(true, |c| c == self.cipher)
    }
}

#[derive(Debug)]
pub struct KeyCache {
    /// Ascending by expiration; ties keep insertion order
    entries: Vec<PtksaEntry>,
    sweep_at: Option<Timestamp>,
    capacity: usize,
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyCache {
    /// Empty cache, no sweep armed
    pub fn new() -> Self {
        Self::with_capacity(PTKSA_CACHE_MAX_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            sweep_at: None,
            capacity,
        }
    }

    /// First entry for `peer`, restricted to `cipher` when given
    pub fn get(&self, peer: MacAddr, cipher: Option<Cipher>) -> Option<&PtksaEntry> {
        self.entries.iter().find(|e| e.matches(Some(peer), cipher))
    }

    /// Insert a key, replacing any entry for the same peer and cipher.
    ///
    /// The replaced entry's eviction callback is not run.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        now: Timestamp,
        own_addr: MacAddr,
        peer_addr: MacAddr,
        cipher: Cipher,
        lifetime_secs: u32,
        ptk: Ptk,
        on_evict: Option<EvictCallback>,
    ) -> Result<&PtksaEntry, CacheFull> {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.peer_addr == peer_addr && e.cipher == cipher)
        {
            debug!("PTKSA: replacing entry for {} {}", peer_addr, cipher);
            self.entries.remove(pos);
        }

        if self.entries.len() >= self.capacity {
            self.rearm(now);
            return Err(CacheFull(self.entries.len()));
        }

        let expiration = now + Duration::from_secs(u64::from(lifetime_secs));
        let pos = self.entries.partition_point(|e| e.expiration <= expiration);
        self.entries.insert(
            pos,
            PtksaEntry {
                own_addr,
                peer_addr,
                cipher,
                created: now,
                expiration,
                ptk,
                on_evict,
            },
        );
        info!(
            "PTKSA: added {} {} (expires in {}s)",
            peer_addr, cipher, lifetime_secs
        );
        self.rearm(now);
        Ok(&self.entries[pos])
    }

    /// Remove every entry matching `peer`/`cipher` (`None` matches all),
    /// running their eviction callbacks. Returns the number removed.
    pub fn flush(&mut self, now: Timestamp, peer: Option<MacAddr>, cipher: Option<Cipher>) -> usize {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.matches(peer, cipher));
        self.entries = kept;

        let count = removed.len();
        for entry in removed {
            debug!("PTKSA: flushing {} {}", entry.peer_addr, entry.cipher);
            entry.evict();
        }
        self.rearm(now);
        count
    }

    /// Remove expired entries, running their eviction callbacks
    pub fn sweep(&mut self, now: Timestamp) -> usize {
        let expired = self.entries.partition_point(|e| e.expiration <= now);
        let removed: Vec<_> = self.entries.drain(..expired).collect();
        for entry in removed {
            debug!("PTKSA: {} {} expired", entry.peer_addr, entry.cipher);
            entry.evict();
        }
        self.rearm(now);
        expired
    }

    /// Drop everything without callbacks and disarm the sweep
    pub fn deinit(&mut self) {
        self.entries.clear();
        self.sweep_at = None;
    }

    /// When [`KeyCache::sweep`] should next run
    pub fn sweep_deadline(&self) -> Option<Timestamp> {
        self.sweep_at
    }

    /// Sweep one second after the earliest expiration, in whole seconds
    /// from now
    fn rearm(&mut self, now: Timestamp) {
        self.sweep_at = self.entries.first().map(|e| {
            let secs = e.expiration.saturating_sub(now).as_secs();
            now + Duration::from_secs(secs + 1)
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &PtksaEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
