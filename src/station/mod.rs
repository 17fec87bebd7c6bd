//! Device security context
//!
//! Owns the single exchange slot, the PTKSA cache and any batch in
//! progress. The host drives it with received frames, transmit status
//! reports and [`DeviceSecurityContext::poll`] at
//! [`DeviceSecurityContext::next_deadline`]; results come back as
//! [`StationEvent`]s.

pub mod batch;
pub mod runner;
pub mod scheduler;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub use batch::{BatchAction, BatchError, BatchPeer, PeerResult};
pub use scheduler::{Job, Origin, Scheduler};

use crate::host::{Collaborators, RangingContextAction, SecureRangingContext};
use crate::ieee80211::rsn::Akm;
use crate::ieee80211::{build_deauth, status, MacAddr, REASON_PREV_AUTH_NOT_VALID};
use crate::pasn::{Action, Comeback, Completion, ExchangeParams, PasnError, PasnExchange, PasnSettings};
use crate::ptksa::{EvictCallback, KeyCache, PtksaEntry};
use crate::time::{Duration, Timestamp};
use batch::{select_parameters, BatchState, DEFAULT_MAX_BATCH_PEERS};

pub const DEFAULT_PTKSA_LIFETIME_SECS: u32 = 43_200;
pub const DEFAULT_MAX_COMEBACK_RETRIES: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationSettings {
    pub own_addr: MacAddr,
    pub pasn: PasnSettings,
    pub ptksa_lifetime_secs: u32,
    pub max_comeback_retries: u8,
    pub max_batch_peers: usize,
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            own_addr: MacAddr([0x02, 0x00, 0x00, 0x00, 0x01, 0x00]),
            pasn: PasnSettings::default(),
            ptksa_lifetime_secs: DEFAULT_PTKSA_LIFETIME_SECS,
            max_comeback_retries: DEFAULT_MAX_COMEBACK_RETRIES,
            max_batch_peers: DEFAULT_MAX_BATCH_PEERS,
        }
    }
}

/// Notifications for the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StationEvent {
    /// Terminal status of one exchange attempt
    AuthStatus {
        peer: MacAddr,
        akmp: Akm,
        status: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        comeback: Option<Comeback>,
        reported_at: DateTime<Utc>,
    },
    BatchComplete {
        action: BatchAction,
        peers: Vec<PeerResult>,
    },
    Deauthenticated {
        own_addr: MacAddr,
        peer_addr: MacAddr,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Evicted {
    own_addr: MacAddr,
    peer_addr: MacAddr,
}

pub struct DeviceSecurityContext {
    settings: StationSettings,
    collab: Collaborators,
    cache: KeyCache,
    scheduler: Scheduler,
    batch: Option<BatchState>,
    /// Filled by cache eviction callbacks, drained after each cache call
    evicted: Rc<RefCell<VecDeque<Evicted>>>,
    events: UnboundedSender<StationEvent>,
}

impl DeviceSecurityContext {
    pub fn new(
        settings: StationSettings,
        collab: Collaborators,
        events: UnboundedSender<StationEvent>,
    ) -> Self {
        Self {
            settings,
            collab,
            cache: KeyCache::new(),
            scheduler: Scheduler::new(),
            batch: None,
            evicted: Rc::new(RefCell::new(VecDeque::new())),
            events,
        }
    }

    pub fn settings(&self) -> &StationSettings {
        &self.settings
    }

    /// Live PTKSAs, for key installation
    pub fn ptksa(&self) -> &KeyCache {
        &self.cache
    }

    /// No exchange queued, running or waiting, and no batch active
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle() && self.batch.is_none()
    }

    fn now(&self) -> Timestamp {
        self.collab.clock.now()
    }

    /// Queue a single exchange. It starts on the next [`poll`](Self::poll).
    pub fn pasn_auth_start(&mut self, params: ExchangeParams) -> Result<(), PasnError> {
        let caps = self.collab.sender.capabilities();
        let now = self.now();
        self.scheduler
            .request(Job::new(params, Origin::Manual), caps, now)
    }

    /// Cancel whatever holds the exchange slot and report its last status
    pub fn pasn_auth_stop(&mut self) {
        let Some(stopped) = self.scheduler.stop() else {
            debug!("PASN: stop with nothing in progress");
            return;
        };
        let job = stopped.job;
        info!(
            "PASN: stopped exchange with {} (status {})",
            job.params.peer_addr, stopped.status
        );
        self.report(job.params.peer_addr, job.params.akm, stopped.status, stopped.comeback);
        self.job_done(&job, stopped.status);
    }

    /// Authenticate `peers` one by one, or drop their keys
    pub fn trigger_batch(&mut self, action: BatchAction, peers: Vec<BatchPeer>) -> Result<(), BatchError> {
        if self.batch.is_some() {
            return Err(BatchError::Active);
        }
        let mut state = BatchState::new(action, peers, self.settings.max_batch_peers)?;
        info!("PASN: batch {:?} for {} peers", action, state.peers().len());

        match action {
            BatchAction::Authenticate => {
                self.batch = Some(state);
                self.advance_batch();
            }
            BatchAction::DeleteSecureRangingContext => {
                let now = self.now();
                let peers = state.peers().to_vec();
                for peer in &peers {
                    let removed = self.cache.flush(now, Some(peer.peer_addr), None);
                    debug!("PASN: dropped {} PTKSA(s) for {}", removed, peer.peer_addr);
                    state.record(status::SUCCESS);
                }
                self.drain_evictions();
                self.emit(StationEvent::BatchComplete {
                    action,
                    peers: state.into_results(),
                });
            }
        }
        Ok(())
    }

    /// Flush the peer's keys and tell it so
    pub fn deauthenticate(&mut self, own_addr: MacAddr, peer_addr: MacAddr) -> Result<()> {
        let now = self.now();
        self.cache.flush(now, Some(peer_addr), None);
        let queued = self
            .evicted
            .borrow()
            .iter()
            .any(|e| e.peer_addr == peer_addr);
        self.drain_evictions();
        if !queued {
            self.send_deauth(own_addr, peer_addr)?;
        }
        Ok(())
    }

    /// Received Authentication frame
    pub fn on_rx(&mut self, frame: &[u8]) {
        let Some((_, exchange)) = self.scheduler.running_mut() else {
            debug!("PASN: no exchange for received frame");
            return;
        };
        match exchange.on_receive(frame, &mut self.collab) {
            Ok(Action::Ignore) => {}
            Ok(Action::Proceed) => {
                if let Err(e) = exchange.build_confirm(&mut self.collab) {
                    self.conclude(e.status_code());
                }
            }
            Ok(Action::Retry(comeback)) => self.on_comeback(comeback),
            Ok(Action::Fail(code)) => self.conclude(code),
            Err(e) => {
                warn!("PASN: exchange failed: {}", e);
                self.conclude(e.status_code());
            }
        }
    }

    /// Transmit status for a frame we sent
    pub fn on_tx_status(&mut self, frame: &[u8], acked: bool) {
        let Some((_, exchange)) = self.scheduler.running_mut() else {
            return;
        };
        if let Some(done) = exchange.on_tx_status(frame, acked, &mut self.collab) {
            self.complete(done);
        }
    }

    /// Earliest time [`poll`](Self::poll) has work to do
    pub fn next_deadline(&self) -> Option<Timestamp> {
        match (self.cache.sweep_deadline(), self.scheduler.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run everything that is due: cache expiry, exchange timeout, queued
    /// and delayed exchanges
    pub fn poll(&mut self) {
        let now = self.now();

        if self.cache.sweep_deadline().map_or(false, |at| now >= at) {
            let expired = self.cache.sweep(now);
            if expired > 0 {
                info!("PTKSA: {} entries expired", expired);
            }
            self.drain_evictions();
        }

        let timed_out = self
            .scheduler
            .running_mut()
            .and_then(|(_, exchange)| exchange.check_timeout(now));
        if let Some(e) = timed_out {
            self.conclude(e.status_code());
        }

        self.dispatch(now);
    }

    /// Cancel everything and drop all keys without deauthenticating
    pub fn shutdown(&mut self) {
        // Drop the batch first so stopping the exchange cannot queue its next peer
        if let Some(batch) = self.batch.take() {
            debug!("PASN: abandoning batch of {} peers", batch.peers().len());
        }
        self.pasn_auth_stop();
        self.cache.deinit();
        self.evicted.borrow_mut().clear();
    }

    fn dispatch(&mut self, now: Timestamp) {
        while let Some(mut job) = self.scheduler.take_due(now) {
            let params = job.params.clone();
            // Tokens are single use
            job.params.comeback_token = None;
            match PasnExchange::start(params, &self.settings.pasn, &mut self.collab) {
                Ok(exchange) => self.scheduler.set_running(job, exchange),
                Err(e) => {
                    warn!("PASN: cannot start with {}: {}", job.params.peer_addr, e);
                    let code = e.status_code();
                    self.report(job.params.peer_addr, job.params.akm, code, None);
                    self.job_done(&job, code);
                }
            }
        }
    }

    /// Terminal failure of the running exchange
    fn conclude(&mut self, code: u16) {
        if let Some(job) = self.scheduler.finish() {
            self.report(job.params.peer_addr, job.params.akm, code, None);
            self.job_done(&job, code);
        }
    }

    fn on_comeback(&mut self, comeback: Comeback) {
        let Some(mut job) = self.scheduler.finish() else {
            return;
        };
        let peer = job.params.peer_addr;
        self.report(
            peer,
            job.params.akm,
            status::ASSOC_REJECTED_TEMPORARILY,
            Some(comeback.clone()),
        );

        if job.retries >= self.settings.max_comeback_retries {
            warn!("PASN: {} still busy after {} retries", peer, job.retries);
            self.job_done(&job, status::ASSOC_REJECTED_TEMPORARILY);
            return;
        }

        job.retries += 1;
        job.params.comeback_token = Some(comeback.token.clone());
        let now = self.now();
        let after = comeback.after;
        info!(
            "PASN: {} asked us to come back in {}s (token {})",
            peer,
            after,
            hex::encode(&comeback.token)
        );
        self.scheduler
            .wait_retry(job, now + Duration::from_secs(u64::from(after)), comeback);
        if after == 0 {
            self.dispatch(now);
        }
    }

    fn complete(&mut self, done: Completion) {
        let Some(job) = self.scheduler.finish() else {
            return;
        };
        let install = job.origin == Origin::Batch;
        let code = match self.commit(done, install, job.params.kdk_required) {
            Ok(()) => status::SUCCESS,
            Err(e) => {
                warn!("PASN: keys for {} not stored: {}", job.params.peer_addr, e);
                status::UNSPECIFIED_FAILURE
            }
        };
        self.report(job.params.peer_addr, job.params.akm, code, None);
        self.job_done(&job, code);
    }

    /// Move the PTK into the cache, optionally handing it to the driver
    fn commit(&mut self, done: Completion, install: bool, ltf_keyseed_required: bool) -> Result<()> {
        let lifetime = self.settings.ptksa_lifetime_secs;
        if lifetime == 0 {
            return Err(anyhow!("PTKSA lifetime of 0 seconds"));
        }
        let now = self.now();
        let (peer_addr, cipher) = (done.peer_addr, done.cipher);
        let queue = Rc::clone(&self.evicted);
        let on_evict: EvictCallback = Box::new(move |e: &PtksaEntry| {
            queue.borrow_mut().push_back(Evicted {
                own_addr: e.own_addr,
                peer_addr: e.peer_addr,
            })
        });

        let entry = self.cache.add(
            now,
            done.own_addr,
            done.peer_addr,
            done.cipher,
            lifetime,
            done.ptk,
            Some(on_evict),
        )?;
        if install {
            let ctx = ranging_context(entry, ltf_keyseed_required);
            // A key the driver refused is not kept
            if let Err(e) = self.collab.sender.set_secure_ranging_context(&ctx) {
                self.cache.flush(now, Some(peer_addr), Some(cipher));
                self.drain_evictions();
                return Err(e);
            }
        }
        Ok(())
    }

    fn job_done(&mut self, job: &Job, code: u16) {
        if job.origin != Origin::Batch {
            return;
        }
        if let Some(batch) = self.batch.as_mut() {
            if batch.current().map(|p| p.peer_addr) == Some(job.params.peer_addr) {
                batch.record(code);
            }
        }
        self.advance_batch();
    }

    /// Resolve peers until one needs an exchange or the list runs out
    fn advance_batch(&mut self) {
        loop {
            let Some(batch) = self.batch.as_ref() else {
                return;
            };
            let Some(peer) = batch.current().cloned() else {
                self.finish_batch();
                return;
            };
            match self.batch_step(&peer) {
                Some(code) => {
                    if let Some(batch) = self.batch.as_mut() {
                        batch.record(code);
                    }
                }
                None => return,
            }
        }
    }

    /// Status if the peer is settled without an exchange, `None` once one
    /// has been queued
    fn batch_step(&mut self, peer: &BatchPeer) -> Option<u16> {
        let bss = match self.collab.bss.lookup(peer.peer_addr) {
            Some(bss) => Some(bss),
            None => self.collab.bss.refresh(peer.peer_addr),
        };
        let Some(bss) = bss else {
            warn!("PASN: no BSS entry for batch peer {}", peer.peer_addr);
            return Some(status::UNSPECIFIED_FAILURE);
        };

        let (akm, cipher, group) = match select_parameters(&bss, &self.collab) {
            Ok(selected) => selected,
            Err(e) => {
                warn!("PASN: {}: {}", peer.peer_addr, e);
                return Some(PasnError::from(e).status_code());
            }
        };

        if let Some(entry) = self.cache.get(peer.peer_addr, Some(cipher)) {
            let kdk_ok = !peer.ltf_keyseed_required || !entry.ptk.kdk().is_empty();
            if entry.own_addr == peer.own_addr && kdk_ok {
                debug!("PASN: cached PTKSA for {}, no exchange needed", peer.peer_addr);
                let ctx = ranging_context(entry, peer.ltf_keyseed_required);
                return Some(match self.collab.sender.set_secure_ranging_context(&ctx) {
                    Ok(()) => status::SUCCESS,
                    Err(e) => {
                        warn!("PASN: ranging context for {}: {}", peer.peer_addr, e);
                        status::UNSPECIFIED_FAILURE
                    }
                });
            }
        }

        let params = ExchangeParams {
            own_addr: peer.own_addr,
            peer_addr: peer.peer_addr,
            akm,
            cipher,
            group,
            comeback_token: None,
            kdk_required: peer.ltf_keyseed_required,
        };
        let caps = self.collab.sender.capabilities();
        let now = self.now();
        match self.scheduler.request(Job::new(params, Origin::Batch), caps, now) {
            Ok(()) => None,
            Err(e) => {
                warn!("PASN: cannot queue {}: {}", peer.peer_addr, e);
                Some(e.status_code())
            }
        }
    }

    fn finish_batch(&mut self) {
        if let Some(batch) = self.batch.take() {
            let action = batch.action();
            let peers = batch.into_results();
            let ok = peers.iter().filter(|p| p.status == status::SUCCESS).count();
            info!("PASN: batch done, {}/{} peers succeeded", ok, peers.len());
            self.emit(StationEvent::BatchComplete { action, peers });
        }
    }

    /// One deauth per peer, however many of its PTKSAs went
    fn drain_evictions(&mut self) {
        let mut peers: Vec<Evicted> = Vec::new();
        for e in self.evicted.borrow_mut().drain(..) {
            if !peers.contains(&e) {
                peers.push(e);
            }
        }
        for e in peers {
            if let Err(err) = self.send_deauth(e.own_addr, e.peer_addr) {
                warn!("PASN: deauth to {} failed: {}", e.peer_addr, err);
            }
        }
    }

    fn send_deauth(&mut self, own_addr: MacAddr, peer_addr: MacAddr) -> Result<()> {
        let frame = build_deauth(peer_addr, own_addr, peer_addr, REASON_PREV_AUTH_NOT_VALID);
        let freq = self.collab.bss.lookup(peer_addr).map_or(0, |b| b.freq);
        self.collab.sender.send_mgmt(&frame, true, freq, 0)?;
        info!("PASN: deauthenticated {}", peer_addr);
        self.collab
            .sender
            .set_secure_ranging_context(&SecureRangingContext::delete(own_addr, peer_addr))?;
        self.emit(StationEvent::Deauthenticated { own_addr, peer_addr });
        Ok(())
    }

    fn report(&self, peer: MacAddr, akmp: Akm, code: u16, comeback: Option<Comeback>) {
        self.emit(StationEvent::AuthStatus {
            peer,
            akmp,
            status: code,
            comeback,
            reported_at: Utc::now(),
        });
    }

    fn emit(&self, event: StationEvent) {
        if self.events.send(event).is_err() {
            debug!("station event dropped, no listener");
        }
    }
}

fn ranging_context(entry: &PtksaEntry, ltf_keyseed_required: bool) -> SecureRangingContext {
    SecureRangingContext {
        own_addr: entry.own_addr,
        peer_addr: entry.peer_addr,
        action: RangingContextAction::Add,
        cipher: Some(entry.cipher),
        tk: Zeroizing::new(entry.ptk.tk().to_vec()),
        kdk: Zeroizing::new(entry.ptk.kdk().to_vec()),
        ltf_keyseed_required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::BssInfo;
    use crate::ieee80211::rsn::Cipher;
    use crate::ieee80211::{MgmtHeader, FC_DEAUTH};
    use crate::pasn::crypto::Ptk;
    use crate::sim::{testbed, Responder, ResponderConfig, TestBed};
    use crate::time::Clock;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn own() -> MacAddr {
        "02:00:00:00:01:00".parse().unwrap()
    }

    fn peer() -> MacAddr {
        "AA:BB:CC:DD:EE:01".parse().unwrap()
    }

    fn peer2() -> MacAddr {
        "aa:bb:cc:dd:ee:02".parse().unwrap()
    }

    fn params() -> ExchangeParams {
        ExchangeParams {
            own_addr: own(),
            peer_addr: peer(),
            akm: Akm::Pasn,
            cipher: Cipher::Ccmp128,
            group: 19,
            comeback_token: None,
            kdk_required: false,
        }
    }

    fn batch_peer(addr: MacAddr) -> BatchPeer {
        BatchPeer {
            own_addr: own(),
            peer_addr: addr,
            ltf_keyseed_required: false,
        }
    }

    struct Harness {
        station: DeviceSecurityContext,
        bed: TestBed,
        aps: Vec<Responder>,
        events: UnboundedReceiver<StationEvent>,
    }

    impl Harness {
        fn new(aps: Vec<Responder>) -> Self {
            Self::with_settings(aps, StationSettings::default())
        }

        fn with_settings(aps: Vec<Responder>, settings: StationSettings) -> Self {
            let infos: Vec<BssInfo> = aps.iter().map(|a| a.bss_info()).collect();
            let (collab, bed) = testbed(own(), &infos);
            let (tx, events) = mpsc::unbounded_channel();
            Self {
                station: DeviceSecurityContext::new(settings, collab, tx),
                bed,
                aps,
                events,
            }
        }

        /// Poll, then deliver frames both ways until nothing more is sent
        fn run(&mut self) {
            self.station.poll();
            loop {
                let sent = self.bed.take_sent();
                if sent.is_empty() {
                    break;
                }
                for f in sent {
                    let da = MgmtHeader::parse(&f.frame).unwrap().da;
                    let reply = self
                        .aps
                        .iter_mut()
                        .find(|ap| ap.bssid() == da)
                        .and_then(|ap| ap.handle(&f.frame).unwrap());
                    self.station.on_tx_status(&f.frame, true);
                    if let Some(reply) = reply {
                        self.station.on_rx(&reply);
                    }
                }
                self.station.poll();
            }
        }

        fn events(&mut self) -> Vec<StationEvent> {
            let mut out = Vec::new();
            while let Ok(e) = self.events.try_recv() {
                out.push(e);
            }
            out
        }
    }

    fn statuses(events: &[StationEvent]) -> Vec<(MacAddr, u16)> {
        events
            .iter()
            .filter_map(|e| match e {
                StationEvent::AuthStatus { peer, status, .. } => Some((*peer, *status)),
                _ => None,
            })
            .collect()
    }

    fn batch_results(events: &[StationEvent]) -> Option<Vec<PeerResult>> {
        events.iter().find_map(|e| match e {
            StationEvent::BatchComplete { peers, .. } => Some(peers.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_end_to_end_single_peer() {
        let mut h = Harness::new(vec![Responder::new(ResponderConfig::pasn(peer()))]);
        let start = h.bed.clock.now();
        h.station.pasn_auth_start(params()).unwrap();
        h.run();

        assert_eq!(statuses(&h.events()), vec![(peer(), status::SUCCESS)]);
        assert_eq!(h.station.ptksa().len(), 1);
        let entry = h.station.ptksa().get(peer(), Some(Cipher::Ccmp128)).unwrap();
        assert_eq!(entry.own_addr, own());
        assert_eq!(entry.expiration, start + Duration::from_secs(43_200));
        assert_eq!(entry.ptk.tk(), h.aps[0].established(own()).unwrap().tk());
        assert!(h.station.is_idle());
        // Manual exchanges do not touch the ranging context
        assert!(h.bed.ranging_contexts().is_empty());
    }

    #[test]
    fn test_comeback_waits_then_stop_reports_token() {
        let ap = Responder::new(ResponderConfig {
            comeback: Some((vec![0x01, 0x02, 0x03, 0x04], 5)),
            ..ResponderConfig::pasn(peer())
        });
        let mut h = Harness::new(vec![ap]);
        h.station.pasn_auth_start(params()).unwrap();
        h.run();

        let events = h.events();
        assert_eq!(statuses(&events), vec![(peer(), status::ASSOC_REJECTED_TEMPORARILY)]);
        let start = h.bed.clock.now();
        assert_eq!(h.station.next_deadline(), Some(start + Duration::from_secs(5)));

        h.bed.clock.advance(Duration::from_millis(4999));
        h.station.poll();
        assert!(h.bed.take_sent().is_empty());

        h.station.pasn_auth_stop();
        match h.events().as_slice() {
            [StationEvent::AuthStatus {
                status, comeback, ..
            }] => {
                assert_eq!(*status, status::ASSOC_REJECTED_TEMPORARILY);
                assert_eq!(comeback.as_ref().unwrap().token, vec![0x01, 0x02, 0x03, 0x04]);
                assert_eq!(comeback.as_ref().unwrap().after, 5);
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert!(h.station.is_idle());
        assert_eq!(h.station.next_deadline(), None);
    }

    #[test]
    fn test_comeback_retry_presents_token() {
        let ap = Responder::new(ResponderConfig {
            comeback: Some((vec![9, 9], 5)),
            ..ResponderConfig::pasn(peer())
        });
        let mut h = Harness::new(vec![ap]);
        h.station.pasn_auth_start(params()).unwrap();
        h.run();
        h.bed.clock.advance(Duration::from_secs(5));
        h.run();

        assert_eq!(
            statuses(&h.events()),
            vec![
                (peer(), status::ASSOC_REJECTED_TEMPORARILY),
                (peer(), status::SUCCESS)
            ]
        );
        assert_eq!(h.aps[0].comebacks_issued(), 1);
        assert_eq!(h.station.ptksa().len(), 1);
    }

    #[test]
    fn test_immediate_comeback_retry() {
        let ap = Responder::new(ResponderConfig {
            comeback: Some((vec![7], 0)),
            ..ResponderConfig::pasn(peer())
        });
        let mut h = Harness::new(vec![ap]);
        h.station.pasn_auth_start(params()).unwrap();
        h.run();

        assert_eq!(
            statuses(&h.events()),
            vec![
                (peer(), status::ASSOC_REJECTED_TEMPORARILY),
                (peer(), status::SUCCESS)
            ]
        );
    }

    #[test]
    fn test_busy_while_pending() {
        let mut h = Harness::new(vec![Responder::new(ResponderConfig::pasn(peer()))]);
        h.station.pasn_auth_start(params()).unwrap();
        assert_eq!(h.station.pasn_auth_start(params()), Err(PasnError::Busy));
    }

    #[test]
    fn test_timeout_reports_failure() {
        let mut h = Harness::new(vec![Responder::new(ResponderConfig::pasn(peer()))]);
        // Still in the scan table, but nothing answers
        h.aps.clear();
        h.station.pasn_auth_start(params()).unwrap();
        h.run();
        assert!(h.events().is_empty());

        h.bed.clock.advance(Duration::from_millis(2000));
        h.station.poll();
        assert_eq!(statuses(&h.events()), vec![(peer(), status::UNSPECIFIED_FAILURE)]);
        assert!(h.station.is_idle());
        assert_eq!(h.station.next_deadline(), None);
    }

    #[test]
    fn test_start_failure_reported_once() {
        let mut h = Harness::new(vec![Responder::new(ResponderConfig::pasn(peer()))]);
        let bad = ExchangeParams {
            cipher: Cipher::Gcmp256,
            ..params()
        };
        h.station.pasn_auth_start(bad).unwrap();
        h.run();
        assert_eq!(statuses(&h.events()), vec![(peer(), status::UNSPECIFIED_FAILURE)]);
        assert!(h.station.is_idle());
    }

    #[test]
    fn test_batch_authenticates_then_hits_cache() {
        let mut h = Harness::new(vec![
            Responder::new(ResponderConfig::pasn(peer())),
            Responder::new(ResponderConfig::pasn(peer2())),
        ]);
        h.station
            .trigger_batch(BatchAction::Authenticate, vec![batch_peer(peer()), batch_peer(peer2())])
            .unwrap();
        assert_eq!(
            h.station.trigger_batch(BatchAction::Authenticate, vec![batch_peer(peer())]),
            Err(BatchError::Active)
        );
        h.run();

        let results = batch_results(&h.events()).unwrap();
        assert_eq!(
            results.iter().map(|r| (r.peer_addr, r.status)).collect::<Vec<_>>(),
            vec![(peer(), 0), (peer2(), 0)]
        );
        assert_eq!(h.station.ptksa().len(), 2);
        assert_eq!(h.bed.ranging_contexts().len(), 2);

        // Second round is served from the cache
        h.station
            .trigger_batch(BatchAction::Authenticate, vec![batch_peer(peer()), batch_peer(peer2())])
            .unwrap();
        assert!(h.bed.take_sent().is_empty());
        let events = h.events();
        assert!(statuses(&events).is_empty());
        assert_eq!(batch_results(&events).unwrap().len(), 2);
        let ranging = h.bed.ranging_contexts();
        assert_eq!(ranging.len(), 4);
        assert!(ranging.iter().all(|c| c.action == RangingContextAction::Add));
        assert!(h.station.is_idle());
    }

    #[test]
    fn test_batch_continues_past_unknown_peer() {
        let mut h = Harness::new(vec![Responder::new(ResponderConfig::pasn(peer()))]);
        let stranger: MacAddr = "02:11:22:33:44:55".parse().unwrap();
        h.station
            .trigger_batch(BatchAction::Authenticate, vec![batch_peer(stranger), batch_peer(peer())])
            .unwrap();
        h.run();

        let results = batch_results(&h.events()).unwrap();
        assert_eq!(results[0].status, status::UNSPECIFIED_FAILURE);
        assert_eq!(results[1].status, status::SUCCESS);
    }

    #[test]
    fn test_batch_gives_up_after_comeback_limit() {
        let ap = Responder::new(ResponderConfig {
            comeback: Some((vec![1], 5)),
            ..ResponderConfig::pasn(peer())
        });
        let settings = StationSettings {
            max_comeback_retries: 0,
            ..StationSettings::default()
        };
        let mut h = Harness::with_settings(vec![ap], settings);
        h.station
            .trigger_batch(BatchAction::Authenticate, vec![batch_peer(peer())])
            .unwrap();
        h.run();

        let results = batch_results(&h.events()).unwrap();
        assert_eq!(results[0].status, status::ASSOC_REJECTED_TEMPORARILY);
        assert!(h.station.is_idle());
    }

    #[test]
    fn test_delete_batch_flushes_and_deauths() {
        let mut h = Harness::new(vec![Responder::new(ResponderConfig::pasn(peer()))]);
        h.station
            .trigger_batch(BatchAction::Authenticate, vec![batch_peer(peer())])
            .unwrap();
        h.run();
        h.events();

        h.station
            .trigger_batch(BatchAction::DeleteSecureRangingContext, vec![batch_peer(peer())])
            .unwrap();
        assert!(h.station.ptksa().is_empty());

        let sent = h.bed.sent();
        assert_eq!(sent.len(), 1);
        let header = MgmtHeader::parse(&sent[0].frame).unwrap();
        assert_eq!(header.frame_control & 0x00fc, FC_DEAUTH);
        assert_eq!(header.da, peer());
        assert_eq!(&sent[0].frame[24..26], &REASON_PREV_AUTH_NOT_VALID.to_le_bytes());

        let events = h.events();
        assert!(events.contains(&StationEvent::Deauthenticated {
            own_addr: own(),
            peer_addr: peer()
        }));
        assert_eq!(batch_results(&events).unwrap()[0].status, status::SUCCESS);
        assert_eq!(
            h.bed.ranging_contexts().last().unwrap().action,
            RangingContextAction::Delete
        );

        h.run();
        assert!(h.aps[0].established(own()).is_none());
    }

    #[test]
    fn test_expiry_sweep_deauths() {
        let mut h = Harness::new(vec![Responder::new(ResponderConfig::pasn(peer()))]);
        let start = h.bed.clock.now();
        h.station.pasn_auth_start(params()).unwrap();
        h.run();
        assert_eq!(
            h.station.next_deadline(),
            Some(start + Duration::from_secs(43_201))
        );

        h.bed.clock.advance(Duration::from_secs(43_200));
        h.station.poll();
        assert_eq!(h.station.ptksa().len(), 1);

        h.bed.clock.advance(Duration::from_secs(1));
        h.station.poll();
        assert!(h.station.ptksa().is_empty());
        assert_eq!(h.bed.sent().len(), 1);
        assert_eq!(h.station.next_deadline(), None);
    }

    #[test]
    fn test_deauthenticate_without_entry_still_sends() {
        let mut h = Harness::new(vec![Responder::new(ResponderConfig::pasn(peer()))]);
        h.station.deauthenticate(own(), peer()).unwrap();
        assert_eq!(h.bed.sent().len(), 1);
        assert_eq!(
            h.events(),
            vec![StationEvent::Deauthenticated {
                own_addr: own(),
                peer_addr: peer()
            }]
        );
    }

    #[test]
    fn test_shutdown_mid_batch_sends_nothing_more() {
        let mut h = Harness::new(vec![
            Responder::new(ResponderConfig::pasn(peer())),
            Responder::new(ResponderConfig::pasn(peer2())),
        ]);
        h.station
            .trigger_batch(
                BatchAction::Authenticate,
                vec![batch_peer(peer()), batch_peer(peer2())],
            )
            .unwrap();
        h.station.poll();
        assert_eq!(h.bed.take_sent().len(), 1);

        h.station.shutdown();
        assert!(h.station.is_idle());
        assert_eq!(h.station.next_deadline(), None);

        h.station.poll();
        assert!(h.bed.take_sent().is_empty());
        assert!(batch_results(&h.events()).is_none());
    }

    #[test]
    fn test_refused_ranging_install_drops_key() {
        let mut h = Harness::new(vec![Responder::new(ResponderConfig::pasn(peer()))]);
        h.bed.set_fail_ranging(true);
        h.station
            .trigger_batch(BatchAction::Authenticate, vec![batch_peer(peer())])
            .unwrap();
        h.run();

        let results = batch_results(&h.events()).unwrap();
        assert_eq!(results[0].status, status::UNSPECIFIED_FAILURE);
        assert!(h.station.ptksa().is_empty());
        assert!(h.bed.ranging_contexts().is_empty());
        assert!(h.station.is_idle());
    }

    #[test]
    fn test_deauthenticate_once_per_peer() {
        let mut h = Harness::new(vec![Responder::new(ResponderConfig::pasn(peer()))]);
        for cipher in [Cipher::Ccmp128, Cipher::Gcmp256] {
            let done = Completion {
                own_addr: own(),
                peer_addr: peer(),
                akm: Akm::Pasn,
                cipher,
                ptk: Ptk::from_prf_output(&[0x42; 48], 0, 16, 0).unwrap(),
            };
            h.station.commit(done, false, false).unwrap();
        }
        assert_eq!(h.station.ptksa().len(), 2);

        h.station.deauthenticate(own(), peer()).unwrap();
        assert!(h.station.ptksa().is_empty());
        assert_eq!(h.bed.sent().len(), 1);
        assert_eq!(
            h.events(),
            vec![StationEvent::Deauthenticated {
                own_addr: own(),
                peer_addr: peer()
            }]
        );
    }

    #[test]
    fn test_zero_lifetime_rejected() {
        let settings = StationSettings {
            ptksa_lifetime_secs: 0,
            ..StationSettings::default()
        };
        let mut h = Harness::with_settings(vec![Responder::new(ResponderConfig::pasn(peer()))], settings);
        h.station.pasn_auth_start(params()).unwrap();
        h.run();
        assert_eq!(statuses(&h.events()), vec![(peer(), status::UNSPECIFIED_FAILURE)]);
        assert!(h.station.ptksa().is_empty());
    }

    #[test]
    fn test_status_event_json() {
        let event = StationEvent::AuthStatus {
            peer: peer(),
            akmp: Akm::Pasn,
            status: 30,
            comeback: Some(Comeback {
                token: vec![1, 2, 3, 4],
                after: 5,
            }),
            reported_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "auth_status");
        assert_eq!(json["peer"], "aa:bb:cc:dd:ee:01");
        assert_eq!(json["comeback"]["token"], "01020304");
    }
}
