//! In-process simulation of the air and the host
//!
//! [`testbed`] wires a station to recording collaborators for unit tests.
//! [`run_air`] drives a set of [`Responder`]s behind a channel so the
//! binary can exercise the full stack without a radio.

pub mod responder;

pub use responder::{Responder, ResponderConfig};

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::host::{
    BssInfo, BssLookup, Collaborators, DriverCapabilities, FrameSender, NetworkProfile, NoBackends,
    PmksaEntry, PmksaList, PmksaStore, SecureRangingContext,
};
use crate::ieee80211::rsn::{Akm, Pmkid};
use crate::ieee80211::{MacAddr, MgmtHeader};
use crate::pasn::crypto::Ieee80211Crypto;
use crate::station::runner::HostInput;
use crate::time::{ManualClock, SystemClock, Timestamp};

/// A frame handed to the sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub frame: Vec<u8>,
    pub no_ack: bool,
    pub freq: u32,
    pub wait_ms: u32,
}

/// Fixed scan table
#[derive(Debug, Clone, Default)]
pub struct StaticBss {
    entries: Vec<BssInfo>,
    profiles: Vec<NetworkProfile>,
    current: Option<MacAddr>,
}

impl StaticBss {
    pub fn new(entries: Vec<BssInfo>) -> Self {
        Self {
            entries,
            ..Self::default()
        }
    }

    pub fn add_profile(&mut self, profile: NetworkProfile) {
        self.profiles.retain(|p| p.ssid != profile.ssid);
        self.profiles.push(profile);
    }

    pub fn set_current(&mut self, bssid: Option<MacAddr>) {
        self.current = bssid;
    }
}

impl BssLookup for StaticBss {
    fn lookup(&self, addr: MacAddr) -> Option<BssInfo> {
        self.entries.iter().find(|b| b.bssid == addr).cloned()
    }

    fn current_bssid(&self) -> Option<MacAddr> {
        self.current
    }

    fn network_profile(&self, ssid: &str) -> Option<NetworkProfile> {
        self.profiles.iter().find(|p| p.ssid == ssid).cloned()
    }
}

#[derive(Default)]
struct BedState {
    sent: Vec<SentFrame>,
    caps: DriverCapabilities,
    bss: StaticBss,
    ranging: Vec<SecureRangingContext>,
    fail_tx: bool,
    fail_ranging: bool,
    pmksa: PmksaList,
    pmk_r1: Vec<(MacAddr, Akm, Zeroizing<Vec<u8>>, Pmkid)>,
}

/// Test-side handle onto the collaborators built by [`testbed`]
pub struct TestBed {
    state: Rc<RefCell<BedState>>,
    pub own_addr: MacAddr,
    pub clock: ManualClock,
}

impl TestBed {
    /// Everything sent so far
    pub fn sent(&self) -> Vec<SentFrame> {
        self.state.borrow().sent.clone()
    }

    /// Drain the sent frames
    pub fn take_sent(&self) -> Vec<SentFrame> {
        std::mem::take(&mut self.state.borrow_mut().sent)
    }

    pub fn set_current_bssid(&self, bssid: Option<MacAddr>) {
        self.state.borrow_mut().bss.set_current(bssid);
    }

    pub fn set_offchannel_tx(&self, enabled: bool) {
        self.state.borrow_mut().caps.offchannel_tx = enabled;
    }

    pub fn set_sec_ltf(&self, enabled: bool) {
        self.state.borrow_mut().caps.sec_ltf = enabled;
    }

    pub fn set_fail_tx(&self, fail: bool) {
        self.state.borrow_mut().fail_tx = fail;
    }

    /// Make the driver refuse secure ranging contexts
    pub fn set_fail_ranging(&self, fail: bool) {
        self.state.borrow_mut().fail_ranging = fail;
    }

    pub fn add_profile(&self, profile: NetworkProfile) {
        self.state.borrow_mut().bss.add_profile(profile);
    }

    pub fn add_pmksa(&self, entry: PmksaEntry) {
        self.state.borrow_mut().pmksa.store(entry);
    }

    /// FT PMK-R1 and its name for `peer`
    pub fn set_pmk_r1(&self, peer: MacAddr, akm: Akm, pmk_r1: &[u8], name: Pmkid) {
        let mut state = self.state.borrow_mut();
        state.pmk_r1.retain(|(p, a, ..)| !(*p == peer && *a == akm));
        state
            .pmk_r1
            .push((peer, akm, Zeroizing::new(pmk_r1.to_vec()), name));
    }

    /// PMKSA held for `peer`, including ones stored by an exchange
    pub fn pmksa(&self, peer: MacAddr, akm: Akm) -> Option<PmksaEntry> {
        self.state.borrow().pmksa.get(peer, None, akm)
    }

    /// Secure ranging contexts pushed to the driver, in order
    pub fn ranging_contexts(&self) -> Vec<SecureRangingContext> {
        self.state.borrow().ranging.clone()
    }
}

struct BedSender(Rc<RefCell<BedState>>);

impl FrameSender for BedSender {
    fn capabilities(&self) -> DriverCapabilities {
        self.0.borrow().caps
    }

    fn send_mgmt(&mut self, frame: &[u8], no_ack: bool, freq: u32, wait_ms: u32) -> Result<()> {
        let mut state = self.0.borrow_mut();
        if state.fail_tx {
            return Err(anyhow!("transmit refused"));
        }
        state.sent.push(SentFrame {
            frame: frame.to_vec(),
            no_ack,
            freq,
            wait_ms,
        });
        Ok(())
    }

    fn set_secure_ranging_context(&mut self, ctx: &SecureRangingContext) -> Result<()> {
        let mut state = self.0.borrow_mut();
        if state.fail_ranging {
            return Err(anyhow!("ranging context refused"));
        }
        state.ranging.push(ctx.clone());
        Ok(())
    }
}

struct BedBss(Rc<RefCell<BedState>>);

impl BssLookup for BedBss {
    fn lookup(&self, addr: MacAddr) -> Option<BssInfo> {
        self.0.borrow().bss.lookup(addr)
    }

    fn current_bssid(&self) -> Option<MacAddr> {
        self.0.borrow().bss.current_bssid()
    }

    fn network_profile(&self, ssid: &str) -> Option<NetworkProfile> {
        self.0.borrow().bss.network_profile(ssid)
    }
}

struct BedPmksa(Rc<RefCell<BedState>>);

impl PmksaStore for BedPmksa {
    fn get(&self, peer: MacAddr, pmkid: Option<&Pmkid>, akm: Akm) -> Option<PmksaEntry> {
        self.0.borrow().pmksa.get(peer, pmkid, akm)
    }

    fn ft_pmk_r1(&self, peer: MacAddr, akm: Akm) -> Option<(Zeroizing<Vec<u8>>, Pmkid)> {
        self.0
            .borrow()
            .pmk_r1
            .iter()
            .find(|(p, a, ..)| *p == peer && *a == akm)
            .map(|(_, _, pmk, name)| (pmk.clone(), *name))
    }

    fn store(&mut self, entry: PmksaEntry) {
        self.0.borrow_mut().pmksa.store(entry);
    }
}

/// Collaborators backed by shared in-memory state, plus the handle to
/// inspect and steer it. Off-channel TX is enabled and the clock starts at
/// 1000 s.
pub fn testbed(own_addr: MacAddr, bss: &[BssInfo]) -> (Collaborators, TestBed) {
    let state = Rc::new(RefCell::new(BedState {
        caps: DriverCapabilities {
            offchannel_tx: true,
            ..DriverCapabilities::default()
        },
        bss: StaticBss::new(bss.to_vec()),
        ..BedState::default()
    }));
    let clock = ManualClock::at(Timestamp::from_secs(1000));

    let collab = Collaborators {
        sender: Box::new(BedSender(state.clone())),
        bss: Box::new(BedBss(state.clone())),
        pmksa: Box::new(BedPmksa(state.clone())),
        crypto: Box::new(Ieee80211Crypto),
        backends: Box::new(NoBackends),
        clock: Box::new(clock.clone()),
    };
    (
        collab,
        TestBed {
            state,
            own_addr,
            clock,
        },
    )
}

/// Sender that puts frames on the simulated air
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    caps: DriverCapabilities,
}

impl ChannelSender {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>, caps: DriverCapabilities) -> Self {
        Self { tx, caps }
    }
}

impl FrameSender for ChannelSender {
    fn capabilities(&self) -> DriverCapabilities {
        self.caps
    }

    fn send_mgmt(&mut self, frame: &[u8], _no_ack: bool, freq: u32, _wait_ms: u32) -> Result<()> {
        debug!("TX {} bytes on {} MHz", frame.len(), freq);
        self.tx
            .send(frame.to_vec())
            .map_err(|_| anyhow!("air channel closed"))
    }
}

/// Collaborators for a station whose frames go out on the simulated air
pub fn air_collaborators(
    air: mpsc::UnboundedSender<Vec<u8>>,
    caps: DriverCapabilities,
    bss: Vec<BssInfo>,
    clock: SystemClock,
) -> Collaborators {
    Collaborators {
        sender: Box::new(ChannelSender::new(air, caps)),
        bss: Box::new(StaticBss::new(bss)),
        pmksa: Box::new(PmksaList::new()),
        crypto: Box::new(Ieee80211Crypto),
        backends: Box::new(NoBackends),
        clock: Box::new(clock),
    }
}

/// Deliver station frames to the responders, reporting transmit status and
/// any reply back to the station
pub async fn run_air(
    mut responders: Vec<Responder>,
    mut air: mpsc::UnboundedReceiver<Vec<u8>>,
    station: mpsc::Sender<HostInput>,
) -> Result<()> {
    while let Some(frame) = air.recv().await {
        let header = match MgmtHeader::parse(&frame) {
            Ok(h) => h,
            Err(e) => {
                warn!("sim: dropping malformed frame: {}", e);
                continue;
            }
        };

        let target = responders.iter_mut().find(|r| r.bssid() == header.da);
        let acked = target.is_some();
        let reply = match target {
            Some(ap) => ap.handle(&frame).unwrap_or_else(|e| {
                warn!("sim {}: {}", header.da, e);
                None
            }),
            None => None,
        };

        station
            .send(HostInput::TxStatus { frame, acked })
            .await
            .map_err(|_| anyhow!("station input closed"))?;
        if let Some(reply) = reply {
            station
                .send(HostInput::Rx(reply))
                .await
                .map_err(|_| anyhow!("station input closed"))?;
        }
    }
    Ok(())
}
