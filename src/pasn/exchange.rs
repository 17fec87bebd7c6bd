//! PASN exchange state machine (initiator)
//!
//! One [`PasnExchange`] lives for one attempt with one peer:
//!
//! ```text
//! start() ──frame 1──▶ AwaitingReply ──frame 2──▶ on_receive()
//!                          │                          │
//!                          │ status 30 + comeback     │ Proceed
//!                          ▼                          ▼
//!                    ComebackPending          build_confirm() ──frame 3──▶ Completing
//!                                                                              │
//!                                                     on_tx_status(frame 3) ───┘──▶ Done
//! ```
//!
//! Every terminal transition scrubs the PMK, ECDH private key, shared secret
//! and PTK held by the exchange.

use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::crypto::{mic_len, mic_matches, Ptk, PtkInputs};
use super::frame::{pubkey_tag, ComebackInfo, PasnFrame, PasnFrameBuilder, PasnParams};
use super::wrapped::WrappedDataState;
use super::{
    Comeback, ConfigError, CryptoError, PasnError, PasnSettings, ProtocolError, ECC_GROUPS,
    KDK_LEN, PASN_DEFAULT_PMK, PMK_MAX_LEN,
};
use crate::host::{BssInfo, Collaborators, DriverCapabilities, PmksaEntry};
use crate::ieee80211::rsn::{rsnx_capab, Akm, Cipher, Pmkid, RsnElement, Rsnxe};
use crate::ieee80211::{auth_alg, parse_auth, status, MacAddr};
use crate::time::{Duration, Timestamp};

/// Largest private scalar / shared secret among the ECC groups (P-521)
const ECC_SECRET_MAX: usize = 66;

/// What to authenticate with whom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeParams {
    pub own_addr: MacAddr,
    pub peer_addr: MacAddr,
    pub akm: Akm,
    pub cipher: Cipher,
    pub group: u16,
    /// Anti-clogging token handed out on an earlier attempt
    pub comeback_token: Option<Vec<u8>>,
    /// Peer requires an LTF key seed, so a KDK must be derived
    pub kdk_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    /// Frame 1 sent, waiting for frame 2
    AwaitingReply,
    /// Peer asked us to come back later with a token
    ComebackPending,
    /// Frame 3 sent, waiting for its transmit status
    Completing,
    Done,
    Failed,
}

/// Outcome of feeding a received frame to the exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Not for this exchange (stale, duplicate or misaddressed)
    Ignore,
    /// Temporarily rejected; retry with the returned comeback parameters
    Retry(Comeback),
    /// Peer rejected the exchange with this status
    Fail(u16),
    /// Frame 2 verified; frame 3 may be built
    Proceed,
}

/// Key material produced by a successful exchange
#[derive(Debug)]
pub struct Completion {
    pub own_addr: MacAddr,
    pub peer_addr: MacAddr,
    pub akm: Akm,
    pub cipher: Cipher,
    pub ptk: Ptk,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct ExchangeSecrets {
    pmk: [u8; PMK_MAX_LEN],
    pmk_len: usize,
    ecdh_private: [u8; ECC_SECRET_MAX],
    ecdh_private_len: usize,
    shared_secret: [u8; ECC_SECRET_MAX],
    shared_secret_len: usize,
    ptk: Option<Ptk>,
}

impl ExchangeSecrets {
    fn new() -> Self {
        Self {
            pmk: [0; PMK_MAX_LEN],
            pmk_len: 0,
            ecdh_private: [0; ECC_SECRET_MAX],
            ecdh_private_len: 0,
            shared_secret: [0; ECC_SECRET_MAX],
            shared_secret_len: 0,
            ptk: None,
        }
    }

    fn copy_into(slot: &mut [u8], len: &mut usize, value: &[u8], what: &str) -> Result<(), CryptoError> {
        if value.len() > slot.len() {
            return Err(CryptoError::new(format!("{what} too long ({} octets)", value.len())));
        }
        slot[..value.len()].copy_from_slice(value);
        *len = value.len();
        Ok(())
    }

    fn set_pmk(&mut self, pmk: &[u8]) -> Result<(), CryptoError> {
        Self::copy_into(&mut self.pmk, &mut self.pmk_len, pmk, "PMK")
    }

    fn set_ecdh_private(&mut self, private: &[u8]) -> Result<(), CryptoError> {
        Self::copy_into(&mut self.ecdh_private, &mut self.ecdh_private_len, private, "private key")
    }

    fn set_shared_secret(&mut self, secret: &[u8]) -> Result<(), CryptoError> {
        Self::copy_into(&mut self.shared_secret, &mut self.shared_secret_len, secret, "shared secret")
    }

    fn pmk(&self) -> &[u8] {
        &self.pmk[..self.pmk_len]
    }

    fn ecdh_private(&self) -> &[u8] {
        &self.ecdh_private[..self.ecdh_private_len]
    }

    fn shared_secret(&self) -> &[u8] {
        &self.shared_secret[..self.shared_secret_len]
    }

    fn is_zeroed(&self) -> bool {
        self.pmk.iter().all(|b| *b == 0)
            && self.ecdh_private.iter().all(|b| *b == 0)
            && self.shared_secret.iter().all(|b| *b == 0)
            && self.ptk.as_ref().map_or(true, Ptk::is_zeroed)
    }
}

/// One in-flight PASN attempt with one peer
pub struct PasnExchange {
    own_addr: MacAddr,
    peer_addr: MacAddr,
    akm: Akm,
    cipher: Cipher,
    group: u16,
    freq: u32,
    trans_seq: u16,
    phase: ExchangePhase,
    status: u16,
    secrets: ExchangeSecrets,
    wrapped: WrappedDataState,
    /// Beacon RSNE || RSNXE snapshot, MIC input for frame 2
    beacon_rsne_rsnxe: Vec<u8>,
    frame1_hash: Vec<u8>,
    kdk_len: usize,
    derive_kek: bool,
    /// PMK-R1 was loaded at start (FT)
    pmk_preloaded: bool,
    derived_pmksa: Option<PmksaEntry>,
    comeback: Option<Comeback>,
    frame3: Option<Vec<u8>>,
    timeout: Duration,
    deadline: Timestamp,
}

impl std::fmt::Debug for PasnExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasnExchange")
            .field("own_addr", &self.own_addr)
            .field("peer_addr", &self.peer_addr)
            .field("akm", &self.akm)
            .field("cipher", &self.cipher)
            .field("group", &self.group)
            .field("trans_seq", &self.trans_seq)
            .field("phase", &self.phase)
            .field("wrapped", &self.wrapped)
            .finish_non_exhaustive()
    }
}

/// Where the PMK for this exchange comes from, decided before frame 1
struct PmkPlan {
    wrapped: WrappedDataState,
    pmkid: Option<Pmkid>,
    pmk_preloaded: bool,
}

impl PasnExchange {
    /// Validate the request, send frame 1 and start waiting for frame 2.
    ///
    /// Configuration problems are reported before anything is transmitted.
    pub fn start(
        params: ExchangeParams,
        settings: &PasnSettings,
        c: &mut Collaborators,
    ) -> Result<Self, PasnError> {
        let caps = c.sender.capabilities();
        if !caps.offchannel_tx {
            return Err(ConfigError::NoOffchannelTx.into());
        }
        if c.bss.current_bssid() == Some(params.peer_addr) {
            return Err(ConfigError::CurrentBss(params.peer_addr).into());
        }
        let bss = c
            .bss
            .lookup(params.peer_addr)
            .ok_or(ConfigError::UnknownBss(params.peer_addr))?;
        let rsne = bss
            .rsn()
            .ok_or(ConfigError::MissingRsne)?
            .map_err(ConfigError::InvalidRsne)?;
        if !rsne.has_akm(params.akm) {
            return Err(ConfigError::AkmNotAdvertised(params.akm).into());
        }
        if !rsne.has_cipher(params.cipher) {
            return Err(ConfigError::CipherNotAdvertised(params.cipher).into());
        }
        if !ECC_GROUPS.contains(&params.group) || !settings.accepted_groups.contains(&params.group)
        {
            return Err(ConfigError::GroupNotAllowed(params.group).into());
        }

        let mut secrets = ExchangeSecrets::new();
        let plan = Self::plan_pmk(&params, &bss, &mut secrets, c)?;

        let kdk_len = if params.kdk_required
            || settings.force_kdk_derivation
            || (caps.sec_ltf && bss.rsnx().has(rsnx_capab::SECURE_LTF))
        {
            KDK_LEN
        } else {
            0
        };

        let keypair = c.crypto.ecdh_generate(params.group)?;
        secrets.set_ecdh_private(&keypair.private)?;

        let mut exchange = PasnExchange {
            own_addr: params.own_addr,
            peer_addr: params.peer_addr,
            akm: params.akm,
            cipher: params.cipher,
            group: params.group,
            freq: bss.freq,
            trans_seq: 0,
            phase: ExchangePhase::AwaitingReply,
            status: status::SUCCESS,
            secrets,
            wrapped: plan.wrapped,
            beacon_rsne_rsnxe: bss.rsne_rsnxe(),
            frame1_hash: Vec::new(),
            kdk_len,
            derive_kek: settings.derive_kek,
            pmk_preloaded: plan.pmk_preloaded,
            derived_pmksa: None,
            comeback: None,
            frame3: None,
            timeout: settings.auth_timeout,
            deadline: Timestamp::ZERO,
        };

        exchange.send_frame1(keypair.public, plan.pmkid, params.comeback_token, caps, c)?;
        info!(
            "PASN: started with {} akm={} cipher={} group={}",
            exchange.peer_addr, exchange.akm, exchange.cipher, exchange.group
        );
        Ok(exchange)
    }

    fn plan_pmk(
        params: &ExchangeParams,
        bss: &BssInfo,
        secrets: &mut ExchangeSecrets,
        c: &mut Collaborators,
    ) -> Result<PmkPlan, PasnError> {
        let akm = params.akm;
        let peer = params.peer_addr;

        if akm.is_ft() {
            let (pmk_r1, name) = c
                .pmksa
                .ft_pmk_r1(peer, akm)
                .ok_or(ConfigError::MissingPmkR1)?;
            secrets.set_pmk(&pmk_r1)?;
            return Ok(PmkPlan {
                wrapped: WrappedDataState::None,
                pmkid: Some(name),
                pmk_preloaded: true,
            });
        }

        if akm != Akm::Pasn {
            if let Some(entry) = c.pmksa.get(peer, None, akm) {
                debug!("PASN: offering cached PMKSA to {}", peer);
                return Ok(PmkPlan {
                    wrapped: WrappedDataState::None,
                    pmkid: Some(entry.pmkid),
                    pmk_preloaded: false,
                });
            }
        }

        let wrapped = if akm.is_sae() {
            let profile = c
                .bss
                .network_profile(&bss.ssid)
                .ok_or(ConfigError::MissingNetworkProfile)?;
            let password = profile.sae_password.ok_or(ConfigError::MissingSaePassword)?;
            let backend = c.backends.sae().ok_or(ConfigError::SaePtUnavailable)?;
            WrappedDataState::sae(backend, params.group, params.own_addr, peer, &bss.ssid, &password)?
        } else if akm.is_fils() {
            let profile = c
                .bss
                .network_profile(&bss.ssid)
                .ok_or(ConfigError::MissingNetworkProfile)?;
            if !profile.erp {
                return Err(ConfigError::MissingErp.into());
            }
            let backend = c.backends.erp().ok_or(ConfigError::MissingErp)?;
            WrappedDataState::fils(backend, c.crypto.as_ref())
        } else if akm == Akm::Pasn {
            WrappedDataState::None
        } else {
            return Err(ConfigError::NoUsableAkm.into());
        };

        Ok(PmkPlan {
            wrapped,
            pmkid: None,
            pmk_preloaded: false,
        })
    }

    fn own_rsnxe(&self, caps: DriverCapabilities) -> Option<Rsnxe> {
        let mut bits = Vec::new();
        if self.akm.is_sae() {
            bits.push(rsnx_capab::SAE_H2E);
        }
        if caps.sec_ltf || self.kdk_len > 0 {
            bits.push(rsnx_capab::SECURE_LTF);
        }
        if caps.sec_rtt {
            bits.push(rsnx_capab::SECURE_RTT);
        }
        (!bits.is_empty()).then(|| Rsnxe::from_bits(&bits))
    }

    fn send_frame1(
        &mut self,
        public_key: Vec<u8>,
        pmkid: Option<Pmkid>,
        comeback_token: Option<Vec<u8>>,
        caps: DriverCapabilities,
        c: &mut Collaborators,
    ) -> Result<(), PasnError> {
        let mut builder =
            PasnFrameBuilder::new(self.peer_addr, self.own_addr, self.peer_addr, 1, status::SUCCESS);
        builder.rsne = Some(RsnElement::pasn(self.akm, self.cipher, pmkid));
        builder.params = Some(PasnParams {
            wrapped_data_format: self.wrapped.format(),
            comeback: comeback_token.map(|token| ComebackInfo { after: None, token }),
            group: Some(self.group),
            public_key: Some(public_key),
        });
        builder.wrapped_data = self.wrapped.frame1(self.akm, self.cipher)?;
        builder.rsnxe = self.own_rsnxe(caps);

        let built = builder.build();
        self.frame1_hash = c.crypto.frame_hash(self.akm, self.cipher, built.body());
        self.transmit(&built.bytes, c)?;

        self.trans_seq = 1;
        self.deadline = c.clock.now() + self.timeout;
        Ok(())
    }

    fn transmit(&self, frame: &[u8], c: &mut Collaborators) -> Result<(), PasnError> {
        let wait_ms = u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX);
        c.sender
            .send_mgmt(frame, false, self.freq, wait_ms)
            .map_err(|e| PasnError::Transmit(e.to_string()))
    }

    /// Feed a received Authentication frame.
    ///
    /// Frames that do not belong to this exchange, or whose transaction
    /// sequence is not the next expected one, are dropped with
    /// [`Action::Ignore`]. Any error aborts the exchange.
    pub fn on_receive(&mut self, frame: &[u8], c: &mut Collaborators) -> Result<Action, PasnError> {
        if self.phase != ExchangePhase::AwaitingReply || self.trans_seq != 1 {
            debug!("PASN: not expecting a frame in {:?}", self.phase);
            return Ok(Action::Ignore);
        }

        let auth = match parse_auth(frame) {
            Ok(auth) => auth,
            Err(e) => {
                debug!("PASN: dropping unparseable frame: {}", e);
                return Ok(Action::Ignore);
            }
        };
        if auth.algorithm != auth_alg::PASN
            || auth.header.sa != self.peer_addr
            || auth.header.bssid != self.peer_addr
            || auth.header.da != self.own_addr
        {
            debug!("PASN: dropping frame from {} not addressed to this exchange", auth.header.sa);
            return Ok(Action::Ignore);
        }
        if auth.transaction != self.trans_seq + 1 {
            debug!(
                "PASN: dropping frame with transaction {} (expected {})",
                auth.transaction,
                self.trans_seq + 1
            );
            return Ok(Action::Ignore);
        }

        match self.process_frame2(frame, c) {
            Ok(action) => Ok(action),
            Err(e) => {
                warn!("PASN: frame 2 from {} rejected: {}", self.peer_addr, e);
                self.fail(e.status_code());
                Err(e)
            }
        }
    }

    fn process_frame2(&mut self, frame: &[u8], c: &mut Collaborators) -> Result<Action, PasnError> {
        let rx = PasnFrame::parse(frame, true)?;

        if rx.auth.status != status::SUCCESS {
            let comeback = rx.params.as_ref().and_then(|p| p.comeback.as_ref());
            if let (status::ASSOC_REJECTED_TEMPORARILY, Some(cb)) = (rx.auth.status, comeback) {
                let comeback = Comeback {
                    token: cb.token.clone(),
                    after: cb.after.unwrap_or(0),
                };
                info!(
                    "PASN: {} asked to come back after {}s (token {})",
                    self.peer_addr,
                    comeback.after,
                    hex::encode(&comeback.token)
                );
                self.secrets.zeroize();
                self.status = rx.auth.status;
                self.comeback = Some(comeback.clone());
                self.phase = ExchangePhase::ComebackPending;
                return Ok(Action::Retry(comeback));
            }

            info!("PASN: {} rejected with status {}", self.peer_addr, rx.auth.status);
            self.fail(rx.auth.status);
            return Ok(Action::Fail(rx.auth.status));
        }

        let rsne = rx.rsne.as_ref().ok_or(ProtocolError::MissingElement("RSNE"))?;
        let (akm, cipher) = rsne.validate_pasn()?;
        if akm != self.akm || cipher != self.cipher {
            return Err(ProtocolError::RsneMismatch.into());
        }
        if let Some(rsnxe) = &rx.rsnxe {
            rsnxe.validate()?;
        }

        let params = rx
            .params
            .as_ref()
            .ok_or(ProtocolError::MissingElement("PASN Parameters"))?;
        if params.wrapped_data_format != self.wrapped.format() {
            return Err(ProtocolError::WrappedDataFormatMismatch.into());
        }
        let group = params
            .group
            .ok_or(ProtocolError::MalformedParams("group missing"))?;
        if group != self.group {
            return Err(ProtocolError::GroupMismatch {
                expected: self.group,
                got: group,
            }
            .into());
        }
        let peer_key = params
            .public_key
            .as_deref()
            .ok_or(ProtocolError::MissingElement("public key"))?;
        match peer_key[0] {
            pubkey_tag::COMPRESSED_0 | pubkey_tag::COMPRESSED_1 | pubkey_tag::UNCOMPRESSED => {}
            other => return Err(ProtocolError::UnknownKeyEncoding(other).into()),
        }

        let shared = c
            .crypto
            .ecdh_shared_secret(self.group, self.secrets.ecdh_private(), peer_key)?;
        self.secrets.set_shared_secret(&shared)?;

        self.resolve_pmk(&rx, rsne, c)?;

        let ptk = c.crypto.pmk_to_ptk(&PtkInputs {
            pmk: self.secrets.pmk(),
            spa: self.own_addr,
            bssid: self.peer_addr,
            dh_ss: self.secrets.shared_secret(),
            akm: self.akm,
            cipher: self.cipher,
            kdk_len: self.kdk_len,
            derive_kek: self.derive_kek,
        })?;

        let received = rx.mic.ok_or(ProtocolError::MissingElement("MIC"))?;
        let expected = c.crypto.mic(
            ptk.kck(),
            self.akm,
            self.cipher,
            self.peer_addr,
            self.own_addr,
            &self.beacon_rsne_rsnxe,
            &rx.body_with_zeroed_mic(),
        )?;
        if !mic_matches(&expected, received) {
            return Err(ProtocolError::Mic.into());
        }

        self.secrets.ptk = Some(ptk);
        self.trans_seq = 2;
        debug!("PASN: frame 2 from {} verified", self.peer_addr);
        Ok(Action::Proceed)
    }

    /// PMK priority: FT PMK-R1, cached PMKSA named in the RSNE, wrapped
    /// data, then the default PASN PMK.
    fn resolve_pmk(
        &mut self,
        rx: &PasnFrame<'_>,
        rsne: &RsnElement,
        c: &mut Collaborators,
    ) -> Result<(), PasnError> {
        if self.pmk_preloaded {
            return Ok(());
        }

        if let Some(pmkid) = rsne.pmkid() {
            if let Some(entry) = c.pmksa.get(self.peer_addr, Some(pmkid), self.akm) {
                debug!("PASN: using PMKSA {}", hex::encode(pmkid));
                self.secrets.set_pmk(&entry.pmk)?;
                return Ok(());
            }
        }

        if !matches!(self.wrapped, WrappedDataState::None) {
            let data = rx
                .wrapped_data
                .as_deref()
                .ok_or(ProtocolError::MissingElement("wrapped data"))?;
            let derived = self
                .wrapped
                .process_frame2(self.akm, data, c.crypto.as_ref())?;
            self.secrets.set_pmk(&derived.pmk)?;
            if let Some(pmkid) = derived.pmkid {
                self.derived_pmksa = Some(PmksaEntry {
                    peer: self.peer_addr,
                    pmkid,
                    pmk: derived.pmk,
                    akm: self.akm,
                });
            }
            return Ok(());
        }

        if self.akm == Akm::Pasn {
            self.secrets.set_pmk(&PASN_DEFAULT_PMK)?;
            return Ok(());
        }

        Err(ProtocolError::WrappedData(format!("no PMK available for {}", self.akm)).into())
    }

    /// Build, MIC and send frame 3
    pub fn build_confirm(&mut self, c: &mut Collaborators) -> Result<(), PasnError> {
        if self.phase != ExchangePhase::AwaitingReply || self.trans_seq != 2 {
            return Err(ProtocolError::InvalidPhase.into());
        }
        match self.send_frame3(c) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("PASN: failed to send frame 3 to {}: {}", self.peer_addr, e);
                self.fail(e.status_code());
                Err(e)
            }
        }
    }

    fn send_frame3(&mut self, c: &mut Collaborators) -> Result<(), PasnError> {
        let mut builder =
            PasnFrameBuilder::new(self.peer_addr, self.own_addr, self.peer_addr, 3, status::SUCCESS);
        builder.params = Some(PasnParams::bare(self.wrapped.format()));
        builder.wrapped_data = self.wrapped.frame3()?;
        builder.mic_len = Some(mic_len(self.cipher));
        let mut built = builder.build();

        let ptk = self.secrets.ptk.as_ref().ok_or(ProtocolError::InvalidPhase)?;
        let mic = c.crypto.mic(
            ptk.kck(),
            self.akm,
            self.cipher,
            self.own_addr,
            self.peer_addr,
            &self.frame1_hash,
            built.body(),
        )?;
        built.set_mic(&mic);

        self.transmit(&built.bytes, c)?;
        self.frame3 = Some(built.bytes);
        self.trans_seq = 3;
        self.phase = ExchangePhase::Completing;
        self.deadline = c.clock.now() + self.timeout;
        Ok(())
    }

    /// Transmit status for a frame we sent. Completes the exchange when it
    /// reports frame 3, acknowledged or not.
    pub fn on_tx_status(
        &mut self,
        frame: &[u8],
        acked: bool,
        c: &mut Collaborators,
    ) -> Option<Completion> {
        if self.phase != ExchangePhase::Completing || self.frame3.as_deref() != Some(frame) {
            return None;
        }
        if !acked {
            debug!("PASN: frame 3 to {} was not acknowledged", self.peer_addr);
        }

        let ptk = self.secrets.ptk.take()?;
        if let Some(entry) = self.derived_pmksa.take() {
            c.pmksa.store(entry);
        }
        self.secrets.zeroize();
        self.frame3 = None;
        self.phase = ExchangePhase::Done;
        self.status = status::SUCCESS;
        info!("PASN: authenticated with {}", self.peer_addr);

        Some(Completion {
            own_addr: self.own_addr,
            peer_addr: self.peer_addr,
            akm: self.akm,
            cipher: self.cipher,
            ptk,
        })
    }

    /// Fail the exchange if its deadline has passed
    pub fn check_timeout(&mut self, now: Timestamp) -> Option<PasnError> {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                warn!("PASN: {} timed out in {:?}", self.peer_addr, self.phase);
                self.fail(status::UNSPECIFIED_FAILURE);
                Some(PasnError::Timeout)
            }
            _ => None,
        }
    }

    /// Scrub all secrets and stop. An exchange still in flight ends with
    /// unspecified failure; a finished one keeps its status.
    pub fn abort(&mut self) {
        if !self.is_terminal() {
            self.fail(status::UNSPECIFIED_FAILURE);
        }
    }

    fn fail(&mut self, status: u16) {
        self.secrets.zeroize();
        self.derived_pmksa = None;
        self.frame3 = None;
        self.status = status;
        self.phase = ExchangePhase::Failed;
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.phase,
            ExchangePhase::Done | ExchangePhase::Failed | ExchangePhase::ComebackPending
        )
    }

    /// Timer deadline while waiting for frame 2 or the frame 3 status
    pub fn deadline(&self) -> Option<Timestamp> {
        matches!(
            self.phase,
            ExchangePhase::AwaitingReply | ExchangePhase::Completing
        )
        .then_some(self.deadline)
    }

    pub fn phase(&self) -> ExchangePhase {
        self.phase
    }

    /// Last known 802.11 status
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn comeback(&self) -> Option<&Comeback> {
        self.comeback.as_ref()
    }

    pub fn own_addr(&self) -> MacAddr {
        self.own_addr
    }

    pub fn peer_addr(&self) -> MacAddr {
        self.peer_addr
    }

    pub fn akm(&self) -> Akm {
        self.akm
    }

    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    pub fn trans_seq(&self) -> u16 {
        self.trans_seq
    }

    /// Whether a KDK is part of the derived PTK
    pub fn derives_kdk(&self) -> bool {
        self.kdk_len > 0
    }

    /// True when no PMK, PTK or ECDH secret remains in memory
    pub fn secrets_scrubbed(&self) -> bool {
        self.secrets.is_zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{NetworkProfile, WrappedDataBackends};
    use crate::ieee80211::rsn::{Akm, RsnError};
    use crate::ieee80211::{
        build_auth_header, defrag_ext, eid, parse_elements, put_ext_element, MGMT_HDR_LEN,
    };
    use crate::pasn::frame::BuiltFrame;
    use crate::pasn::wrapped::tests::{FakeErp, FakeSae};
    use crate::pasn::wrapped::{ErpBackend, SaeBackend};
    use crate::pasn::WrappedDataFormat;
    use crate::sim::{testbed, Responder, ResponderConfig, TestBed};
    use crate::time::{Clock, Duration};
    use bytes::BytesMut;
    use zeroize::Zeroizing;

    fn peer() -> MacAddr {
        "aa:bb:cc:dd:ee:01".parse().unwrap()
    }

    fn own() -> MacAddr {
        "02:00:00:00:01:00".parse().unwrap()
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

    fn responder() -> Responder {
        Responder::new(ResponderConfig::pasn(peer()))
    }

    fn responder_with(akms: Vec<Akm>) -> Responder {
        Responder::new(ResponderConfig {
            akms,
            ..ResponderConfig::pasn(peer())
        })
    }

    struct FakeBackends;

    impl WrappedDataBackends for FakeBackends {
        fn sae(&self) -> Option<Box<dyn SaeBackend>> {
            Some(Box::new(FakeSae {
                fail_prepare: false,
                confirmed: false,
            }))
        }

        fn erp(&self) -> Option<Box<dyn ErpBackend>> {
            Some(Box::new(FakeErp))
        }
    }

    fn profile(bss: &BssInfo) -> NetworkProfile {
        NetworkProfile {
            ssid: bss.ssid.clone(),
            sae_password: Some(Zeroizing::new("correct horse".to_string())),
            erp: true,
        }
    }

    fn cached(pmkid: Pmkid, pmk: u8, akm: Akm) -> PmksaEntry {
        PmksaEntry {
            peer: peer(),
            pmkid,
            pmk: Zeroizing::new(vec![pmk; 32]),
            akm,
        }
    }

    /// What a responder holding `pmk` puts into frame 2
    struct Reply<'a> {
        pmk: &'a [u8],
        pmkid: Option<Pmkid>,
        format: WrappedDataFormat,
        wrapped_data: Option<Vec<u8>>,
    }

    /// Answer `frame1` the way a responder would, returning frame 2 and the
    /// PTK the responder derived
    fn answer(c: &Collaborators, bss: &BssInfo, frame1: &[u8], reply: Reply<'_>) -> (Vec<u8>, Ptk) {
        let rx = PasnFrame::parse(frame1, false).unwrap();
        let sta = rx.auth.header.sa;
        let (akm, cipher) = rx.rsne.as_ref().unwrap().validate_pasn().unwrap();
        let sta_key = rx.params.as_ref().unwrap().public_key.clone().unwrap();

        let keypair = c.crypto.ecdh_generate(19).unwrap();
        let shared = c
            .crypto
            .ecdh_shared_secret(19, &keypair.private, &sta_key)
            .unwrap();
        let ptk = c
            .crypto
            .pmk_to_ptk(&PtkInputs {
                pmk: reply.pmk,
                spa: sta,
                bssid: bss.bssid,
                dh_ss: &shared,
                akm,
                cipher,
                kdk_len: 0,
                derive_kek: false,
            })
            .unwrap();

        let mut b = PasnFrameBuilder::new(bss.bssid, bss.bssid, sta, 2, status::SUCCESS);
        b.rsne = Some(RsnElement::pasn(akm, cipher, reply.pmkid));
        b.params = Some(PasnParams {
            wrapped_data_format: reply.format,
            comeback: None,
            group: Some(19),
            public_key: Some(keypair.public),
        });
        b.wrapped_data = reply.wrapped_data;
        b.mic_len = Some(mic_len(cipher));
        let mut built = b.build();
        let mic = c
            .crypto
            .mic(ptk.kck(), akm, cipher, bss.bssid, sta, &bss.rsne_rsnxe(), built.body())
            .unwrap();
        built.set_mic(&mic);
        (built.bytes, ptk)
    }

    /// Send frame 3 and report it acknowledged
    fn confirm(exchange: &mut PasnExchange, c: &mut Collaborators, bed: &TestBed) -> (Vec<u8>, Completion) {
        exchange.build_confirm(c).unwrap();
        let frame3 = bed.sent().last().unwrap().frame.clone();
        let done = exchange.on_tx_status(&frame3, true, c).unwrap();
        (frame3, done)
    }

    #[test]
    fn test_frame1_contents() {
        let ap = responder();
        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);
        let exchange = PasnExchange::start(params(), &PasnSettings::default(), &mut c).unwrap();

        assert_eq!(exchange.phase(), ExchangePhase::AwaitingReply);
        assert_eq!(exchange.trans_seq(), 1);
        assert_eq!(exchange.deadline(), Some(bed.clock.now() + Duration::from_millis(2000)));

        let sent = bed.sent();
        assert_eq!(sent.len(), 1);
        let frame = PasnFrame::parse(&sent[0].frame, false).unwrap();
        assert_eq!(frame.auth.transaction, 1);
        assert_eq!(frame.auth.status, status::SUCCESS);
        assert_eq!(frame.auth.header.da, peer());
        let params = frame.params.unwrap();
        assert_eq!(params.group, Some(19));
        assert_eq!(params.wrapped_data_format, crate::pasn::WrappedDataFormat::None);
        assert!(params.comeback.is_none());
        assert_eq!(params.public_key.unwrap().len(), 33);
        assert!(frame.wrapped_data.is_none());
        assert_eq!(
            frame.rsne.unwrap().validate_pasn().unwrap(),
            (Akm::Pasn, Cipher::Ccmp128)
        );
    }

    #[test]
    fn test_full_handshake_and_scrub() {
        let mut ap = responder();
        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);
        let mut exchange = PasnExchange::start(params(), &PasnSettings::default(), &mut c).unwrap();

        let frame1 = bed.sent()[0].frame.clone();
        let frame2 = ap.handle(&frame1).unwrap().unwrap();
        assert_eq!(exchange.on_receive(&frame2, &mut c).unwrap(), Action::Proceed);
        assert!(!exchange.secrets_scrubbed());

        exchange.build_confirm(&mut c).unwrap();
        assert_eq!(exchange.phase(), ExchangePhase::Completing);
        let frame3 = bed.sent()[1].frame.clone();

        // The responder independently recomputes and checks the frame 3 MIC
        assert!(ap.handle(&frame3).unwrap().is_none());

        let done = exchange.on_tx_status(&frame3, true, &mut c).unwrap();
        assert_eq!(exchange.phase(), ExchangePhase::Done);
        assert!(exchange.secrets_scrubbed());
        assert_eq!(done.peer_addr, peer());
        assert_eq!(done.cipher, Cipher::Ccmp128);
        assert_eq!(done.ptk.tk().len(), 16);
        assert_eq!(ap.established(own()).unwrap().tk(), done.ptk.tk());
    }

    #[test]
    fn test_tampered_frame2_fails_mic_and_scrubs() {
        let mut ap = responder();
        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);
        let mut exchange = PasnExchange::start(params(), &PasnSettings::default(), &mut c).unwrap();

        let frame1 = bed.sent()[0].frame.clone();
        let mut frame2 = ap.handle(&frame1).unwrap().unwrap();
        // Flip a bit in the RSN capabilities of the frame 2 RSNE
        let rsne_at = frame2
            .windows(2)
            .position(|w| w == [eid::RSN, 20])
            .unwrap();
        frame2[rsne_at + 2 + 18] ^= 0x01;

        let err = exchange.on_receive(&frame2, &mut c).unwrap_err();
        assert_eq!(err, PasnError::Protocol(ProtocolError::Mic));
        assert_eq!(exchange.phase(), ExchangePhase::Failed);
        assert!(exchange.secrets_scrubbed());
    }

    #[test]
    fn test_wrong_sequence_and_address_are_ignored() {
        let mut ap = responder();
        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);
        let mut exchange = PasnExchange::start(params(), &PasnSettings::default(), &mut c).unwrap();

        let frame1 = bed.sent()[0].frame.clone();
        let frame2 = ap.handle(&frame1).unwrap().unwrap();

        // Transaction 3 where 2 is expected
        let mut wrong_seq = frame2.clone();
        wrong_seq[26] = 3;
        assert_eq!(exchange.on_receive(&wrong_seq, &mut c).unwrap(), Action::Ignore);

        // Replayed frame 1 (transaction 1, our own source address)
        assert_eq!(exchange.on_receive(&frame1, &mut c).unwrap(), Action::Ignore);

        // Different sender
        let mut other_sa = frame2.clone();
        other_sa[15] ^= 0xff;
        assert_eq!(exchange.on_receive(&other_sa, &mut c).unwrap(), Action::Ignore);

        assert_eq!(exchange.phase(), ExchangePhase::AwaitingReply);
        assert_eq!(exchange.on_receive(&frame2, &mut c).unwrap(), Action::Proceed);

        // A duplicate of frame 2 after processing it is dropped
        assert_eq!(exchange.on_receive(&frame2, &mut c).unwrap(), Action::Ignore);
    }

    #[test]
    fn test_comeback_reply_yields_retry() {
        let mut ap = Responder::new(ResponderConfig {
            comeback: Some((vec![0x01, 0x02, 0x03, 0x04], 5)),
            ..ResponderConfig::pasn(peer())
        });
        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);
        let mut exchange = PasnExchange::start(params(), &PasnSettings::default(), &mut c).unwrap();

        let frame2 = ap.handle(&bed.sent()[0].frame).unwrap().unwrap();
        let action = exchange.on_receive(&frame2, &mut c).unwrap();
        assert_eq!(
            action,
            Action::Retry(Comeback {
                token: vec![0x01, 0x02, 0x03, 0x04],
                after: 5
            })
        );
        assert_eq!(exchange.phase(), ExchangePhase::ComebackPending);
        assert_eq!(exchange.status(), status::ASSOC_REJECTED_TEMPORARILY);
        assert!(exchange.secrets_scrubbed());
        assert_eq!(exchange.deadline(), None);

        // Retrying with the token is accepted by the responder
        let retry = ExchangeParams {
            comeback_token: Some(vec![0x01, 0x02, 0x03, 0x04]),
            ..params()
        };
        let mut second = PasnExchange::start(retry, &PasnSettings::default(), &mut c).unwrap();
        let sent = bed.sent();
        let frame1 = PasnFrame::parse(&sent[1].frame, false).unwrap();
        assert_eq!(
            frame1.params.unwrap().comeback.unwrap().token,
            vec![0x01, 0x02, 0x03, 0x04]
        );
        let frame2 = ap.handle(&sent[1].frame).unwrap().unwrap();
        assert_eq!(second.on_receive(&frame2, &mut c).unwrap(), Action::Proceed);
    }

    #[test]
    fn test_other_rejection_fails() {
        let (mut c, bed) = testbed(own(), &[responder().bss_info()]);
        let mut exchange = PasnExchange::start(params(), &PasnSettings::default(), &mut c).unwrap();
        assert_eq!(bed.sent().len(), 1);

        let mut buf = BytesMut::new();
        build_auth_header(&mut buf, peer(), peer(), own(), auth_alg::PASN, 2, status::INVALID_RSNIE);
        assert_eq!(
            exchange.on_receive(&buf, &mut c).unwrap(),
            Action::Fail(status::INVALID_RSNIE)
        );
        assert_eq!(exchange.phase(), ExchangePhase::Failed);
        assert!(exchange.secrets_scrubbed());
    }

    #[test]
    fn test_group_mismatch_and_bad_key_tag() {
        let ap = responder();
        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);

        let reply = |group: u16, key: Vec<u8>| -> BuiltFrame {
            let mut b = PasnFrameBuilder::new(peer(), peer(), own(), 2, status::SUCCESS);
            b.rsne = Some(RsnElement::pasn(Akm::Pasn, Cipher::Ccmp128, None));
            b.params = Some(PasnParams {
                wrapped_data_format: crate::pasn::WrappedDataFormat::None,
                comeback: None,
                group: Some(group),
                public_key: Some(key),
            });
            b.mic_len = Some(16);
            b.build()
        };

        let mut exchange = PasnExchange::start(params(), &PasnSettings::default(), &mut c).unwrap();
        let err = exchange
            .on_receive(&reply(20, vec![0x02; 33]).bytes, &mut c)
            .unwrap_err();
        assert_eq!(err.status_code(), status::FINITE_CYCLIC_GROUP_NOT_SUPPORTED);

        let mut exchange = PasnExchange::start(params(), &PasnSettings::default(), &mut c).unwrap();
        let err = exchange
            .on_receive(&reply(19, vec![0x07; 33]).bytes, &mut c)
            .unwrap_err();
        assert_eq!(err, PasnError::Protocol(ProtocolError::UnknownKeyEncoding(0x07)));
        assert_eq!(bed.sent().len(), 2);
    }

    #[test]
    fn test_start_validation_errors() {
        let ap = responder();
        let settings = PasnSettings::default();

        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);
        let err = PasnExchange::start(
            ExchangeParams { cipher: Cipher::Gcmp256, ..params() },
            &settings,
            &mut c,
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::CipherNotAdvertised(Cipher::Gcmp256).into());

        let err = PasnExchange::start(ExchangeParams { group: 2, ..params() }, &settings, &mut c)
            .unwrap_err();
        assert_eq!(err, ConfigError::GroupNotAllowed(2).into());

        let err = PasnExchange::start(ExchangeParams { akm: Akm::Sae, ..params() }, &settings, &mut c)
            .unwrap_err();
        assert_eq!(err, ConfigError::AkmNotAdvertised(Akm::Sae).into());

        let err = PasnExchange::start(
            ExchangeParams { peer_addr: MacAddr([2, 9, 9, 9, 9, 9]), ..params() },
            &settings,
            &mut c,
        )
        .unwrap_err();
        assert!(matches!(err, PasnError::Config(ConfigError::UnknownBss(_))));

        bed.set_current_bssid(Some(peer()));
        let err = PasnExchange::start(params(), &settings, &mut c).unwrap_err();
        assert_eq!(err, ConfigError::CurrentBss(peer()).into());

        bed.set_current_bssid(None);
        bed.set_offchannel_tx(false);
        let err = PasnExchange::start(params(), &settings, &mut c).unwrap_err();
        assert_eq!(err, ConfigError::NoOffchannelTx.into());

        // Nothing went on air for any of the rejected requests
        assert!(bed.sent().is_empty());
    }

    #[test]
    fn test_sae_requires_password() {
        let ap = Responder::new(ResponderConfig {
            akms: vec![Akm::Sae, Akm::Pasn],
            ..ResponderConfig::pasn(peer())
        });
        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);
        let sae = ExchangeParams { akm: Akm::Sae, ..params() };

        let err = PasnExchange::start(sae.clone(), &PasnSettings::default(), &mut c).unwrap_err();
        assert_eq!(err, ConfigError::MissingNetworkProfile.into());

        bed.add_profile(NetworkProfile {
            ssid: ap.bss_info().ssid,
            sae_password: None,
            erp: false,
        });
        let err = PasnExchange::start(sae, &PasnSettings::default(), &mut c).unwrap_err();
        assert_eq!(err, ConfigError::MissingSaePassword.into());
    }

    #[test]
    fn test_timeout_scrubs() {
        let ap = responder();
        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);
        let mut exchange = PasnExchange::start(params(), &PasnSettings::default(), &mut c).unwrap();

        bed.clock.advance(Duration::from_millis(1999));
        assert!(exchange.check_timeout(bed.clock.now()).is_none());
        bed.clock.advance(Duration::from_millis(1));
        assert_eq!(exchange.check_timeout(bed.clock.now()), Some(PasnError::Timeout));
        assert_eq!(exchange.phase(), ExchangePhase::Failed);
        assert!(exchange.secrets_scrubbed());
    }

    #[test]
    fn test_kdk_follows_request() {
        let mut ap = responder();
        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);
        let mut exchange = PasnExchange::start(
            ExchangeParams { kdk_required: true, ..params() },
            &PasnSettings::default(),
            &mut c,
        )
        .unwrap();
        assert!(exchange.derives_kdk());

        let frame2 = ap.handle(&bed.sent()[0].frame).unwrap().unwrap();
        assert_eq!(exchange.on_receive(&frame2, &mut c).unwrap(), Action::Proceed);
        exchange.build_confirm(&mut c).unwrap();
        let frame3 = bed.sent()[1].frame.clone();
        let done = exchange.on_tx_status(&frame3, false, &mut c).unwrap();
        assert_eq!(done.ptk.kdk().len(), KDK_LEN);
    }

    #[test]
    fn test_frame2_without_mic_is_rejected() {
        let (mut c, _bed) = testbed(own(), &[responder().bss_info()]);
        let mut exchange = PasnExchange::start(params(), &PasnSettings::default(), &mut c).unwrap();

        let peer_key = c.crypto.ecdh_generate(19).unwrap();
        let mut b = PasnFrameBuilder::new(peer(), peer(), own(), 2, status::SUCCESS);
        b.rsne = Some(RsnElement::pasn(Akm::Pasn, Cipher::Ccmp128, None));
        b.params = Some(PasnParams {
            wrapped_data_format: crate::pasn::WrappedDataFormat::None,
            comeback: None,
            group: Some(19),
            public_key: Some(peer_key.public),
        });
        let frame = b.build();

        let err = exchange.on_receive(&frame.bytes, &mut c).unwrap_err();
        assert_eq!(err, PasnError::Protocol(ProtocolError::MissingElement("MIC")));
        assert!(exchange.secrets_scrubbed());
    }

    #[test]
    fn test_ft_pmk_r1_outranks_cached_pmksa() {
        let bss = responder_with(vec![Akm::FtPsk, Akm::Pasn]).bss_info();
        let (mut c, bed) = testbed(own(), &[bss.clone()]);
        bed.set_pmk_r1(peer(), Akm::FtPsk, &[0x71; 32], [0x0F; 16]);
        bed.add_pmksa(cached([0x22; 16], 0x99, Akm::FtPsk));

        let ft = ExchangeParams { akm: Akm::FtPsk, ..params() };
        let mut exchange = PasnExchange::start(ft, &PasnSettings::default(), &mut c).unwrap();
        let frame1 = bed.sent()[0].frame.clone();
        let parsed = PasnFrame::parse(&frame1, false).unwrap();
        assert_eq!(parsed.rsne.as_ref().unwrap().pmkid(), Some(&[0x0F; 16]));
        assert_eq!(
            parsed.params.as_ref().unwrap().wrapped_data_format,
            WrappedDataFormat::None
        );
        assert!(parsed.wrapped_data.is_none());

        // Frame 2 names the cached PMKSA; the PMK-R1 loaded at start still wins
        let (frame2, ptk) = answer(
            &c,
            &bss,
            &frame1,
            Reply {
                pmk: &[0x71; 32],
                pmkid: Some([0x22; 16]),
                format: WrappedDataFormat::None,
                wrapped_data: None,
            },
        );
        assert_eq!(exchange.on_receive(&frame2, &mut c).unwrap(), Action::Proceed);
        let (_, done) = confirm(&mut exchange, &mut c, &bed);
        assert_eq!(done.akm, Akm::FtPsk);
        assert_eq!(done.ptk.tk(), ptk.tk());
    }

    #[test]
    fn test_ft_without_pmk_r1_is_config_error() {
        let bss = responder_with(vec![Akm::FtPsk, Akm::Pasn]).bss_info();
        let (mut c, bed) = testbed(own(), &[bss]);
        let ft = ExchangeParams { akm: Akm::FtPsk, ..params() };
        let err = PasnExchange::start(ft, &PasnSettings::default(), &mut c).unwrap_err();
        assert_eq!(err, ConfigError::MissingPmkR1.into());
        assert!(bed.sent().is_empty());
    }

    #[test]
    fn test_cached_pmksa_replaces_sae_wrapped_data() {
        let bss = responder_with(vec![Akm::Sae, Akm::Pasn]).bss_info();
        let (mut c, bed) = testbed(own(), &[bss.clone()]);
        c.backends = Box::new(FakeBackends);
        bed.add_profile(profile(&bss));
        bed.add_pmksa(cached([0x22; 16], 0x99, Akm::Sae));

        let sae = ExchangeParams { akm: Akm::Sae, ..params() };
        let mut exchange = PasnExchange::start(sae, &PasnSettings::default(), &mut c).unwrap();
        let frame1 = bed.sent()[0].frame.clone();
        let parsed = PasnFrame::parse(&frame1, false).unwrap();
        assert_eq!(parsed.rsne.as_ref().unwrap().pmkid(), Some(&[0x22; 16]));
        assert_eq!(
            parsed.params.as_ref().unwrap().wrapped_data_format,
            WrappedDataFormat::None
        );
        assert!(parsed.wrapped_data.is_none());

        let (frame2, ptk) = answer(
            &c,
            &bss,
            &frame1,
            Reply {
                pmk: &[0x99; 32],
                pmkid: Some([0x22; 16]),
                format: WrappedDataFormat::None,
                wrapped_data: None,
            },
        );
        assert_eq!(exchange.on_receive(&frame2, &mut c).unwrap(), Action::Proceed);
        let (frame3, done) = confirm(&mut exchange, &mut c, &bed);
        assert!(PasnFrame::parse(&frame3, false).unwrap().wrapped_data.is_none());
        assert_eq!(done.ptk.tk(), ptk.tk());
    }

    #[test]
    fn test_sae_wrapped_data_derives_and_stores_pmksa() {
        let bss = responder_with(vec![Akm::Sae, Akm::Pasn]).bss_info();
        let (mut c, bed) = testbed(own(), &[bss.clone()]);
        c.backends = Box::new(FakeBackends);
        bed.add_profile(profile(&bss));

        let sae = ExchangeParams { akm: Akm::Sae, ..params() };
        let mut exchange = PasnExchange::start(sae, &PasnSettings::default(), &mut c).unwrap();
        let frame1 = bed.sent()[0].frame.clone();
        let parsed = PasnFrame::parse(&frame1, false).unwrap();
        assert!(parsed.rsne.as_ref().unwrap().pmkid().is_none());
        assert!(parsed.rsnxe.as_ref().unwrap().has(rsnx_capab::SAE_H2E));
        assert_eq!(
            parsed.params.as_ref().unwrap().wrapped_data_format,
            WrappedDataFormat::Sae
        );
        assert_eq!(
            parsed.wrapped_data,
            Some(vec![3, 0, 1, 0, 126, 0, 0xC0, 0xC1, 0xC2, 0xC3])
        );

        let commit_confirm = [
            &[3, 0, 1, 0, 126, 0][..],
            &[0xD0, 0xD1, 0xD2, 0xD3],
            &[3, 0, 2, 0, 0, 0],
            &[0xF0, 0xF1],
        ]
        .concat();
        let (frame2, ptk) = answer(
            &c,
            &bss,
            &frame1,
            Reply {
                pmk: &[0x5A; 32],
                pmkid: None,
                format: WrappedDataFormat::Sae,
                wrapped_data: Some(commit_confirm),
            },
        );
        assert_eq!(exchange.on_receive(&frame2, &mut c).unwrap(), Action::Proceed);

        exchange.build_confirm(&mut c).unwrap();
        let frame3 = bed.sent()[1].frame.clone();
        let parsed3 = PasnFrame::parse(&frame3, false).unwrap();
        assert_eq!(parsed3.wrapped_data, Some(vec![3, 0, 2, 0, 0, 0, 0xF0, 0xF1]));
        assert_eq!(
            parsed3.params.as_ref().unwrap().wrapped_data_format,
            WrappedDataFormat::Sae
        );

        // Offered to the store only once frame 3 is out
        assert!(bed.pmksa(peer(), Akm::Sae).is_none());
        let done = exchange.on_tx_status(&frame3, true, &mut c).unwrap();
        assert_eq!(done.ptk.tk(), ptk.tk());
        let stored = bed.pmksa(peer(), Akm::Sae).unwrap();
        assert_eq!(stored.pmkid, [0x11; 16]);
        assert_eq!(*stored.pmk, vec![0x5A; 32]);
    }

    #[test]
    fn test_pmkid_in_frame2_outranks_wrapped_data() {
        let bss = responder_with(vec![Akm::Sae, Akm::Pasn]).bss_info();
        let (mut c, bed) = testbed(own(), &[bss.clone()]);
        c.backends = Box::new(FakeBackends);
        bed.add_profile(profile(&bss));

        let sae = ExchangeParams { akm: Akm::Sae, ..params() };
        let mut exchange = PasnExchange::start(sae, &PasnSettings::default(), &mut c).unwrap();
        let frame1 = bed.sent()[0].frame.clone();

        // The PMKSA shows up after frame 1 went out with SAE commit data
        bed.add_pmksa(cached([0x22; 16], 0x99, Akm::Sae));
        let (frame2, ptk) = answer(
            &c,
            &bss,
            &frame1,
            Reply {
                pmk: &[0x99; 32],
                pmkid: Some([0x22; 16]),
                format: WrappedDataFormat::Sae,
                wrapped_data: None,
            },
        );
        assert_eq!(exchange.on_receive(&frame2, &mut c).unwrap(), Action::Proceed);
        let (_, done) = confirm(&mut exchange, &mut c, &bed);
        assert_eq!(done.ptk.tk(), ptk.tk());
        assert_eq!(bed.pmksa(peer(), Akm::Sae).unwrap().pmkid, [0x22; 16]);
    }

    #[test]
    fn test_fils_pmk_from_erp_is_not_cached() {
        let bss = responder_with(vec![Akm::FilsSha256, Akm::Pasn]).bss_info();
        let (mut c, bed) = testbed(own(), &[bss.clone()]);
        c.backends = Box::new(FakeBackends);
        bed.add_profile(profile(&bss));

        let fils = ExchangeParams { akm: Akm::FilsSha256, ..params() };
        let mut exchange = PasnExchange::start(fils, &PasnSettings::default(), &mut c).unwrap();
        let frame1 = bed.sent()[0].frame.clone();
        let parsed = PasnFrame::parse(&frame1, false).unwrap();
        assert_eq!(
            parsed.params.as_ref().unwrap().wrapped_data_format,
            WrappedDataFormat::FilsSk
        );
        let wd = parsed.wrapped_data.clone().unwrap();
        assert_eq!(&wd[..6], &[4, 0, 1, 0, 0, 0]);
        let elements = parse_elements(&wd[6..]).unwrap();
        let snonce = defrag_ext(&elements, eid::EXT_FILS_NONCE).unwrap();
        let session = defrag_ext(&elements, eid::EXT_FILS_SESSION).unwrap();

        let mut reply = BytesMut::new();
        reply.extend_from_slice(&[4, 0, 2, 0, 0, 0]);
        put_ext_element(&mut reply, eid::EXT_FILS_NONCE, &[0x77; 16]);
        put_ext_element(&mut reply, eid::EXT_FILS_SESSION, &session);
        put_ext_element(&mut reply, eid::EXT_FILS_WRAPPED_DATA, &[0x05, 0x02]);
        let pmk = c
            .crypto
            .fils_rmsk_to_pmk(Akm::FilsSha256, &[0x33; 32], &snonce, &[0x77; 16])
            .unwrap();

        let (frame2, ptk) = answer(
            &c,
            &bss,
            &frame1,
            Reply {
                pmk: pmk.as_slice(),
                pmkid: None,
                format: WrappedDataFormat::FilsSk,
                wrapped_data: Some(reply.to_vec()),
            },
        );
        assert_eq!(exchange.on_receive(&frame2, &mut c).unwrap(), Action::Proceed);
        let (frame3, done) = confirm(&mut exchange, &mut c, &bed);
        assert!(PasnFrame::parse(&frame3, false).unwrap().wrapped_data.is_none());
        assert_eq!(done.ptk.tk(), ptk.tk());
        assert!(bed.pmksa(peer(), Akm::FilsSha256).is_none());
    }

    #[test]
    fn test_every_flipped_frame2_octet_is_refused() {
        let mut ap = Responder::new(ResponderConfig {
            rsnxe_bits: vec![rsnx_capab::SECURE_RTT],
            ..ResponderConfig::pasn(peer())
        });
        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);
        let settings = PasnSettings::default();

        // Each flip ends its exchange, so every octet gets a fresh one
        let mut at = MGMT_HDR_LEN;
        loop {
            let mut exchange = PasnExchange::start(params(), &settings, &mut c).unwrap();
            let mut frame2 = ap.handle(&bed.take_sent()[0].frame).unwrap().unwrap();
            let mic_at = frame2.len() - mic_len(Cipher::Ccmp128);
            if at >= mic_at {
                break;
            }
            frame2[at] ^= 0x01;
            let result = exchange.on_receive(&frame2, &mut c);
            assert!(
                !matches!(result, Ok(Action::Proceed)),
                "frame 2 accepted with octet {} flipped",
                at
            );
            at += 1;
        }
        assert!(at > MGMT_HDR_LEN + 60);
    }

    #[test]
    fn test_every_flipped_frame3_octet_is_refused() {
        let mut ap = responder();
        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);
        let mut exchange = PasnExchange::start(params(), &PasnSettings::default(), &mut c).unwrap();
        let frame2 = ap.handle(&bed.sent()[0].frame).unwrap().unwrap();
        assert_eq!(exchange.on_receive(&frame2, &mut c).unwrap(), Action::Proceed);
        exchange.build_confirm(&mut c).unwrap();
        let frame3 = bed.sent()[1].frame.clone();

        let mic_at = frame3.len() - mic_len(Cipher::Ccmp128);
        for at in MGMT_HDR_LEN..mic_at {
            let mut flipped = frame3.clone();
            flipped[at] ^= 0x01;
            let _ = ap.handle(&flipped);
            assert!(
                ap.established(own()).is_none(),
                "frame 3 accepted with octet {} flipped",
                at
            );
        }

        // The untouched frame still completes the handshake
        assert!(ap.handle(&frame3).unwrap().is_none());
        assert!(ap.established(own()).is_some());
    }

    #[test]
    fn test_frame2_rsnxe_length_mismatch_is_rejected() {
        let mut ap = Responder::new(ResponderConfig {
            rsnxe_bits: vec![rsnx_capab::SECURE_RTT],
            ..ResponderConfig::pasn(peer())
        });
        let (mut c, bed) = testbed(own(), &[ap.bss_info()]);
        let mut exchange = PasnExchange::start(params(), &PasnSettings::default(), &mut c).unwrap();
        let mut frame2 = ap.handle(&bed.sent()[0].frame).unwrap().unwrap();

        let rsnxe_at = frame2
            .windows(4)
            .position(|w| w == [eid::RSNX, 2, 0x01, 0x02])
            .unwrap();
        // Length nibble now claims a one-octet field
        frame2[rsnxe_at + 2] = 0x00;

        let err = exchange.on_receive(&frame2, &mut c).unwrap_err();
        assert_eq!(
            err,
            PasnError::Protocol(ProtocolError::Rsn(RsnError::RsnxeLength {
                declared: 1,
                actual: 2
            }))
        );
        assert_eq!(err.status_code(), status::INVALID_RSNIE);
        assert!(exchange.secrets_scrubbed());
    }
}
