//! AKM-specific wrapped data carried in PASN frames
//!
//! SAE runs a commit/confirm exchange inside frames 1-3; FILS runs an ERP
//! re-authentication inside frames 1-2. The cryptographic sub-protocols are
//! supplied by the host through [`SaeBackend`] and [`ErpBackend`]; this
//! module frames their messages and turns their results into a PMK.

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;
use zeroize::Zeroizing;

use super::crypto::CryptoSuite;
use super::{ConfigError, ProtocolError, WrappedDataFormat};
use crate::ieee80211::rsn::{Akm, Cipher, Pmkid, RsnElement};
use crate::ieee80211::{auth_alg, defrag_ext, eid, parse_elements, put_ext_element, status, MacAddr};

pub const FILS_NONCE_LEN: usize = 16;
pub const FILS_SESSION_LEN: usize = 8;

/// SAE commit/confirm engine
pub trait SaeBackend {
    /// Derive the password element for this peer. Fails when no PT can be
    /// derived from the password.
    fn prepare(
        &mut self,
        group: u16,
        own: MacAddr,
        peer: MacAddr,
        ssid: &str,
        password: &str,
    ) -> anyhow::Result<()>;

    fn write_commit(&mut self, buf: &mut Vec<u8>) -> anyhow::Result<()>;

    /// Consume the peer commit at the start of `data`; returns the number of
    /// octets it occupied.
    fn process_commit(&mut self, data: &[u8]) -> anyhow::Result<usize>;

    fn check_confirm(&mut self, data: &[u8]) -> anyhow::Result<()>;

    fn write_confirm(&mut self, buf: &mut Vec<u8>) -> anyhow::Result<()>;

    /// PMK and PMKID once the confirm has been verified
    fn pmk(&self) -> Option<(Zeroizing<Vec<u8>>, Pmkid)>;
}

/// EAP Re-authentication Protocol engine for FILS
pub trait ErpBackend {
    /// EAP-Initiate/Re-auth message
    fn reauth_start(&mut self) -> anyhow::Result<Vec<u8>>;

    /// Process EAP-Finish/Re-auth; returns the rMSK
    fn reauth_finish(&mut self, data: &[u8]) -> anyhow::Result<Zeroizing<Vec<u8>>>;
}

/// PMK produced by a wrapped-data exchange
pub struct DerivedPmk {
    pub pmk: Zeroizing<Vec<u8>>,
    pub pmkid: Option<Pmkid>,
}

pub struct SaeState {
    backend: Box<dyn SaeBackend>,
}

pub struct FilsState {
    backend: Box<dyn ErpBackend>,
    nonce: [u8; FILS_NONCE_LEN],
    session: [u8; FILS_SESSION_LEN],
}

/// Per-exchange wrapped-data adapter, chosen once from the AKM
pub enum WrappedDataState {
    None,
    Sae(SaeState),
    Fils(FilsState),
}

impl std::fmt::Debug for WrappedDataState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WrappedDataState::None => write!(f, "None"),
            WrappedDataState::Sae(_) => write!(f, "Sae"),
            WrappedDataState::Fils(_) => write!(f, "Fils"),
        }
    }
}

fn wd_err(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::WrappedData(e.to_string())
}

fn put_auth_fields(buf: &mut Vec<u8>, algorithm: u16, transaction: u16, status: u16) {
    buf.put_u16_le(algorithm);
    buf.put_u16_le(transaction);
    buf.put_u16_le(status);
}

/// Strip and check an embedded Authentication header
fn take_auth_fields(
    data: &mut &[u8],
    algorithm: u16,
    transaction: u16,
    expected_status: u16,
) -> Result<(), ProtocolError> {
    if data.remaining() < 6 {
        return Err(wd_err("embedded authentication header truncated"));
    }
    let alg = data.get_u16_le();
    let seq = data.get_u16_le();
    let st = data.get_u16_le();
    if alg != algorithm || seq != transaction || st != expected_status {
        return Err(wd_err(format!(
            "unexpected embedded header alg={alg} seq={seq} status={st}"
        )));
    }
    Ok(())
}

impl WrappedDataState {
    /// SAE adapter; fails when the password element cannot be derived
    pub fn sae(
        mut backend: Box<dyn SaeBackend>,
        group: u16,
        own: MacAddr,
        peer: MacAddr,
        ssid: &str,
        password: &str,
    ) -> Result<Self, ConfigError> {
        backend
            .prepare(group, own, peer, ssid, password)
            .map_err(|e| {
                debug!("SAE preparation failed: {}", e);
                ConfigError::SaePtUnavailable
            })?;
        Ok(WrappedDataState::Sae(SaeState { backend }))
    }

    /// FILS adapter with a fresh nonce and session
    pub fn fils(backend: Box<dyn ErpBackend>, crypto: &dyn CryptoSuite) -> Self {
        let mut nonce = [0u8; FILS_NONCE_LEN];
        let mut session = [0u8; FILS_SESSION_LEN];
        crypto.random_bytes(&mut nonce);
        crypto.random_bytes(&mut session);
        WrappedDataState::Fils(FilsState {
            backend,
            nonce,
            session,
        })
    }

    pub fn format(&self) -> WrappedDataFormat {
        match self {
            WrappedDataState::None => WrappedDataFormat::None,
            WrappedDataState::Sae(_) => WrappedDataFormat::Sae,
            WrappedDataState::Fils(_) => WrappedDataFormat::FilsSk,
        }
    }

    /// Wrapped data for frame 1
    pub fn frame1(&mut self, akm: Akm, cipher: Cipher) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self {
            WrappedDataState::None => Ok(None),
            WrappedDataState::Sae(sae) => {
                let mut buf = Vec::with_capacity(128);
                put_auth_fields(&mut buf, auth_alg::SAE, 1, status::SAE_HASH_TO_ELEMENT);
                sae.backend.write_commit(&mut buf).map_err(wd_err)?;
                Ok(Some(buf))
            }
            WrappedDataState::Fils(fils) => {
                let erp = fils.backend.reauth_start().map_err(wd_err)?;
                let mut buf = BytesMut::with_capacity(64 + erp.len());
                buf.put_u16_le(auth_alg::FILS_SK);
                buf.put_u16_le(1);
                buf.put_u16_le(status::SUCCESS);
                RsnElement::pasn(akm, cipher, None).write(&mut buf);
                put_ext_element(&mut buf, eid::EXT_FILS_NONCE, &fils.nonce);
                put_ext_element(&mut buf, eid::EXT_FILS_SESSION, &fils.session);
                put_ext_element(&mut buf, eid::EXT_FILS_WRAPPED_DATA, &erp);
                Ok(Some(buf.to_vec()))
            }
        }
    }

    /// Consume the wrapped data of frame 2 and derive a PMK from it
    pub fn process_frame2(
        &mut self,
        akm: Akm,
        data: &[u8],
        crypto: &dyn CryptoSuite,
    ) -> Result<DerivedPmk, ProtocolError> {
        match self {
            WrappedDataState::None => Err(wd_err("no wrapped data expected")),
            WrappedDataState::Sae(sae) => {
                let mut buf = data;
                take_auth_fields(&mut buf, auth_alg::SAE, 1, status::SAE_HASH_TO_ELEMENT)?;
                let used = sae.backend.process_commit(buf).map_err(wd_err)?;
                if used > buf.len() {
                    return Err(wd_err("SAE commit overruns wrapped data"));
                }
                buf.advance(used);

                take_auth_fields(&mut buf, auth_alg::SAE, 2, status::SUCCESS)?;
                sae.backend.check_confirm(buf).map_err(wd_err)?;

                let (pmk, pmkid) = sae
                    .backend
                    .pmk()
                    .ok_or_else(|| wd_err("SAE finished without a PMK"))?;
                Ok(DerivedPmk {
                    pmk,
                    pmkid: Some(pmkid),
                })
            }
            WrappedDataState::Fils(fils) => {
                let mut buf = data;
                take_auth_fields(&mut buf, auth_alg::FILS_SK, 2, status::SUCCESS)?;
                let elements = parse_elements(buf)?;

                let anonce = defrag_ext(&elements, eid::EXT_FILS_NONCE)
                    .ok_or(ProtocolError::MissingElement("FILS nonce"))?;
                if anonce.len() != FILS_NONCE_LEN {
                    return Err(wd_err("FILS nonce has wrong length"));
                }
                let session = defrag_ext(&elements, eid::EXT_FILS_SESSION)
                    .ok_or(ProtocolError::MissingElement("FILS session"))?;
                if session != fils.session {
                    return Err(wd_err("FILS session mismatch"));
                }
                let erp = defrag_ext(&elements, eid::EXT_FILS_WRAPPED_DATA)
                    .ok_or(ProtocolError::MissingElement("FILS wrapped data"))?;

                let rmsk = fils.backend.reauth_finish(&erp).map_err(wd_err)?;
                let pmk = crypto
                    .fils_rmsk_to_pmk(akm, &rmsk, &fils.nonce, &anonce)
                    .map_err(wd_err)?;
                Ok(DerivedPmk { pmk, pmkid: None })
            }
        }
    }

    /// Wrapped data for frame 3: the SAE confirm, nothing otherwise
    pub fn frame3(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self {
            WrappedDataState::Sae(sae) => {
                let mut buf = Vec::with_capacity(64);
                put_auth_fields(&mut buf, auth_alg::SAE, 2, status::SUCCESS);
                sae.backend.write_confirm(&mut buf).map_err(wd_err)?;
                Ok(Some(buf))
            }
            WrappedDataState::None | WrappedDataState::Fils(_) => Ok(None),
        }
    }
}
