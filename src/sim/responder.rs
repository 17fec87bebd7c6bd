//! Simulated PASN responder (access point side)
//!
//! Answers frame 1 with frame 2 using the default PASN PMK, optionally
//! demanding an anti-clogging token first, and verifies frame 3 before
//! recording its own PTKSA for the station.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::host::BssInfo;
use crate::ieee80211::rsn::{rsnx_capab, Akm, Cipher, RsnElement, Rsnxe};
use crate::ieee80211::{auth_alg, parse_auth, status, MacAddr, MgmtHeader, FC_DEAUTH};
use crate::pasn::crypto::{mic_len, mic_matches, CryptoSuite, Ieee80211Crypto, Ptk, PtkInputs};
use crate::pasn::frame::{ComebackInfo, PasnFrame, PasnFrameBuilder, PasnParams};
use crate::pasn::{PasnError, ProtocolError, WrappedDataFormat, KDK_LEN, PASN_DEFAULT_PMK};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderConfig {
    pub bssid: MacAddr,
    pub ssid: String,
    pub freq: u32,
    pub akms: Vec<Akm>,
    pub ciphers: Vec<Cipher>,
    pub rsnxe_bits: Vec<u8>,
    pub groups: Vec<u16>,
    /// Token the station must present, and the delay handed out with it
    pub comeback: Option<(Vec<u8>, u16)>,
    pub derive_kek: bool,
}

impl ResponderConfig {
    /// Plain PASN, CCMP-128, group 19
    pub fn pasn(bssid: MacAddr) -> Self {
        Self {
            bssid,
            ssid: "pasn-sim".to_string(),
            freq: 2437,
            akms: vec![Akm::Pasn],
            ciphers: vec![Cipher::Ccmp128],
            rsnxe_bits: Vec::new(),
            groups: vec![19],
            comeback: None,
            derive_kek: false,
        }
    }
}

struct Pending {
    akm: Akm,
    cipher: Cipher,
    ptk: Ptk,
    frame1_hash: Vec<u8>,
}

pub struct Responder {
    config: ResponderConfig,
    crypto: Ieee80211Crypto,
    pending: HashMap<MacAddr, Pending>,
    established: HashMap<MacAddr, Ptk>,
    comebacks_issued: usize,
}

impl Responder {
    pub fn new(config: ResponderConfig) -> Self {
        Self {
            config,
            crypto: Ieee80211Crypto,
            pending: HashMap::new(),
            established: HashMap::new(),
            comebacks_issued: 0,
        }
    }

    pub fn bssid(&self) -> MacAddr {
        self.config.bssid
    }

    /// What this responder advertises in its beacon
    pub fn bss_info(&self) -> BssInfo {
        BssInfo {
            bssid: self.config.bssid,
            ssid: self.config.ssid.clone(),
            freq: self.config.freq,
            rsne: Some(RsnElement::advertised(&self.config.akms, &self.config.ciphers).to_bytes()),
            rsnxe: self.rsnxe().map(|x| x.to_bytes()),
        }
    }

    fn rsnxe(&self) -> Option<Rsnxe> {
        (!self.config.rsnxe_bits.is_empty()).then(|| Rsnxe::from_bits(&self.config.rsnxe_bits))
    }

    /// PTK established with `sta`, if frame 3 verified
    pub fn established(&self, sta: MacAddr) -> Option<&Ptk> {
        self.established.get(&sta)
    }

    pub fn comebacks_issued(&self) -> usize {
        self.comebacks_issued
    }

    /// Process a frame addressed to this responder; returns the reply, if any
    pub fn handle(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, PasnError> {
        let header = MgmtHeader::parse(frame)?;
        if header.da != self.config.bssid {
            return Ok(None);
        }
        if header.frame_control & 0x00fc == FC_DEAUTH {
            info!("sim {}: deauthenticated by {}", self.config.bssid, header.sa);
            self.pending.remove(&header.sa);
            self.established.remove(&header.sa);
            return Ok(None);
        }

        let auth = parse_auth(frame)?;
        if auth.algorithm != auth_alg::PASN {
            return Ok(None);
        }
        match auth.transaction {
            1 => self.on_frame1(frame).map(Some),
            3 => self.on_frame3(frame).map(|_| None),
            other => {
                debug!("sim {}: ignoring transaction {}", self.config.bssid, other);
                Ok(None)
            }
        }
    }

    fn reply(&self, sta: MacAddr, status: u16, params: Option<PasnParams>) -> Vec<u8> {
        let mut b = PasnFrameBuilder::new(self.config.bssid, self.config.bssid, sta, 2, status);
        b.params = params;
        b.build().bytes
    }

    fn on_frame1(&mut self, frame: &[u8]) -> Result<Vec<u8>, PasnError> {
        let rx = PasnFrame::parse(frame, false)?;
        let sta = rx.auth.header.sa;

        let Some((akm, cipher)) = rx.rsne.as_ref().and_then(|r| r.validate_pasn().ok()) else {
            return Ok(self.reply(sta, status::INVALID_RSNIE, None));
        };
        if akm != Akm::Pasn || !self.config.akms.contains(&akm) || !self.config.ciphers.contains(&cipher) {
            return Ok(self.reply(sta, status::INVALID_RSNIE, None));
        }
        let Some(params) = rx.params.as_ref() else {
            return Ok(self.reply(sta, status::INVALID_PARAMETERS, None));
        };

        if let Some((token, after)) = &self.config.comeback {
            let presented = params.comeback.as_ref().map(|c| &c.token);
            if presented != Some(token) {
                self.comebacks_issued += 1;
                info!("sim {}: sending comeback to {}", self.config.bssid, sta);
                let cb = PasnParams {
                    wrapped_data_format: WrappedDataFormat::None,
                    comeback: Some(ComebackInfo {
                        after: Some(*after),
                        token: token.clone(),
                    }),
                    group: None,
                    public_key: None,
                };
                return Ok(self.reply(sta, status::ASSOC_REJECTED_TEMPORARILY, Some(cb)));
            }
        }

        let group = params.group.unwrap_or(0);
        if !self.config.groups.contains(&group) {
            return Ok(self.reply(sta, status::FINITE_CYCLIC_GROUP_NOT_SUPPORTED, None));
        }
        let Some(sta_key) = params.public_key.as_deref() else {
            return Ok(self.reply(sta, status::INVALID_PARAMETERS, None));
        };

        let keypair = self.crypto.ecdh_generate(group)?;
        let shared = self.crypto.ecdh_shared_secret(group, &keypair.private, sta_key)?;
        let kdk_len = if rx.rsnxe.as_ref().map_or(false, |x| x.has(rsnx_capab::SECURE_LTF)) {
            KDK_LEN
        } else {
            0
        };
        let ptk = self.crypto.pmk_to_ptk(&PtkInputs {
            pmk: &PASN_DEFAULT_PMK,
            spa: sta,
            bssid: self.config.bssid,
            dh_ss: &shared,
            akm,
            cipher,
            kdk_len,
            derive_kek: self.config.derive_kek,
        })?;

        let mut b = PasnFrameBuilder::new(self.config.bssid, self.config.bssid, sta, 2, status::SUCCESS);
        b.rsne = Some(RsnElement::pasn(akm, cipher, None));
        b.params = Some(PasnParams {
            wrapped_data_format: WrappedDataFormat::None,
            comeback: None,
            group: Some(group),
            public_key: Some(keypair.public),
        });
        b.rsnxe = self.rsnxe();
        b.mic_len = Some(mic_len(cipher));
        let mut built = b.build();
        let mic = self.crypto.mic(
            ptk.kck(),
            akm,
            cipher,
            self.config.bssid,
            sta,
            &self.bss_info().rsne_rsnxe(),
            built.body(),
        )?;
        built.set_mic(&mic);

        let frame1_hash = self.crypto.frame_hash(akm, cipher, rx.auth.body);
        self.pending.insert(
            sta,
            Pending {
                akm,
                cipher,
                ptk,
                frame1_hash,
            },
        );
        debug!("sim {}: answered frame 1 from {}", self.config.bssid, sta);
        Ok(built.bytes)
    }

    fn on_frame3(&mut self, frame: &[u8]) -> Result<(), PasnError> {
        let rx = PasnFrame::parse(frame, false)?;
        let sta = rx.auth.header.sa;
        // A frame 3 that fails verification leaves the handshake pending
        let pending = self.pending.get(&sta).ok_or(ProtocolError::InvalidPhase)?;

        let received = rx.mic.ok_or(ProtocolError::MissingElement("MIC"))?;
        let expected = self.crypto.mic(
            pending.ptk.kck(),
            pending.akm,
            pending.cipher,
            sta,
            self.config.bssid,
            &pending.frame1_hash,
            &rx.body_with_zeroed_mic(),
        )?;
        if !mic_matches(&expected, received) {
            return Err(ProtocolError::Mic.into());
        }

        info!("sim {}: PASN complete with {}", self.config.bssid, sta);
        if let Some(pending) = self.pending.remove(&sta) {
            self.established.insert(sta, pending.ptk);
        }
        Ok(())
    }
}
