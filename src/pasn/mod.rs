//! Pre-Association Security Negotiation (PASN), initiator side
//!
//! - [`frame`] builds and parses the PASN Authentication frames
//! - [`crypto`] holds the key-agreement/KDF/MIC seam and its default suite
//! - [`wrapped`] produces and consumes AKM-specific wrapped data (SAE, FILS)
//! - [`exchange`] is the three-message handshake state machine

pub mod crypto;
pub mod exchange;
pub mod frame;
pub mod wrapped;

use thiserror::Error;

use crate::ieee80211::rsn::{Akm, Cipher, RsnError};
use crate::ieee80211::{status, FrameError, MacAddr};
use crate::time::Duration;

pub use exchange::{Action, Completion, ExchangeParams, ExchangePhase, PasnExchange};

/// PMK used by the plain PASN AKM: "PMKz" followed by zero octets
pub const PASN_DEFAULT_PMK: [u8; 32] = {
    let mut pmk = [0u8; 32];
    pmk[0] = b'P';
    pmk[1] = b'M';
    pmk[2] = b'K';
    pmk[3] = b'z';
    pmk
};

/// Key derivation key length used for secure ranging
pub const KDK_LEN: usize = 32;

/// KCK length for every PASN AKM
pub const KCK_LEN: usize = 32;

/// Largest PMK any supported AKM produces (SHA-384 based FILS)
pub const PMK_MAX_LEN: usize = 64;

/// Elliptic-curve groups PASN may run over. Finite-field groups are never
/// accepted.
pub const ECC_GROUPS: [u16; 8] = [19, 20, 21, 25, 26, 28, 29, 30];

/// Station-wide PASN settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasnSettings {
    /// Groups the station is willing to use
    pub accepted_groups: Vec<u16>,
    /// Bound on waiting for frame 2 and for the frame 3 transmit status
    pub auth_timeout: Duration,
    pub force_kdk_derivation: bool,
    pub derive_kek: bool,
}

impl Default for PasnSettings {
    fn default() -> Self {
        Self {
            accepted_groups: vec![19],
            auth_timeout: Duration::from_millis(2000),
            force_kdk_derivation: false,
            derive_kek: false,
        }
    }
}

/// Format of the Wrapped Data element announced in the PASN Parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WrappedDataFormat {
    None = 0,
    Ft = 1,
    FilsSk = 2,
    Sae = 3,
}

impl TryFrom<u8> for WrappedDataFormat {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(WrappedDataFormat::None),
            1 => Ok(WrappedDataFormat::Ft),
            2 => Ok(WrappedDataFormat::FilsSk),
            3 => Ok(WrappedDataFormat::Sae),
            other => Err(ProtocolError::UnknownWrappedDataFormat(other)),
        }
    }
}

/// Fails `start()` synchronously, before anything is transmitted
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("driver cannot transmit off-channel management frames")]
    NoOffchannelTx,
    #[error("{0} is the currently associated BSS")]
    CurrentBss(MacAddr),
    #[error("no BSS entry for {0}")]
    UnknownBss(MacAddr),
    #[error("peer does not advertise an RSNE")]
    MissingRsne,
    #[error("peer RSNE is invalid: {0}")]
    InvalidRsne(RsnError),
    #[error("peer does not advertise AKM {0}")]
    AkmNotAdvertised(Akm),
    #[error("peer does not advertise cipher {0}")]
    CipherNotAdvertised(Cipher),
    #[error("group {0} is not allowed")]
    GroupNotAllowed(u16),
    #[error("no SAE password configured")]
    MissingSaePassword,
    #[error("SAE password element cannot be derived")]
    SaePtUnavailable,
    #[error("no network profile for the peer")]
    MissingNetworkProfile,
    #[error("FILS requires an ERP key")]
    MissingErp,
    #[error("FT requires a PMK-R1 for the peer")]
    MissingPmkR1,
    #[error("peer offers no AKM usable for PASN")]
    NoUsableAkm,
    #[error("peer offers no supported pairwise cipher")]
    NoUsableCipher,
}

/// Malformed or inconsistent frames; aborts the exchange
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Rsn(#[from] RsnError),
    #[error("missing {0}")]
    MissingElement(&'static str),
    #[error("malformed PASN Parameters: {0}")]
    MalformedParams(&'static str),
    #[error("unknown wrapped data format {0}")]
    UnknownWrappedDataFormat(u8),
    #[error("group mismatch: sent {expected}, got {got}")]
    GroupMismatch { expected: u16, got: u16 },
    #[error("wrapped data format mismatch")]
    WrappedDataFormatMismatch,
    #[error("unrecognised public key encoding 0x{0:02x}")]
    UnknownKeyEncoding(u8),
    #[error("public key not expected here")]
    UnexpectedPublicKey,
    #[error("peer RSNE does not match the negotiated AKM/cipher")]
    RsneMismatch,
    #[error("wrapped data: {0}")]
    WrappedData(String),
    #[error("MIC verification failed")]
    Mic,
    #[error("operation not valid in the current exchange phase")]
    InvalidPhase,
}

/// Key agreement or derivation failed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("crypto failure: {0}")]
pub struct CryptoError(pub String);

impl CryptoError {
    pub fn new(msg: impl Into<String>) -> Self {
        CryptoError(msg.into())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PasnError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("no response from peer")]
    Timeout,
    #[error("a PASN exchange is already pending")]
    Busy,
    #[error("transmit failed: {0}")]
    Transmit(String),
}

impl PasnError {
    /// 802.11 status code reported for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            PasnError::Protocol(ProtocolError::Rsn(_))
            | PasnError::Protocol(ProtocolError::RsneMismatch) => status::INVALID_RSNIE,
            PasnError::Protocol(ProtocolError::MalformedParams(_)) => status::INVALID_PARAMETERS,
            PasnError::Protocol(ProtocolError::GroupMismatch { .. })
            | PasnError::Config(ConfigError::GroupNotAllowed(_)) => {
                status::FINITE_CYCLIC_GROUP_NOT_SUPPORTED
            }
            _ => status::UNSPECIFIED_FAILURE,
        }
    }
}

impl From<FrameError> for PasnError {
    fn from(e: FrameError) -> Self {
        PasnError::Protocol(ProtocolError::Frame(e))
    }
}

impl From<RsnError> for PasnError {
    fn from(e: RsnError) -> Self {
        PasnError::Protocol(ProtocolError::Rsn(e))
    }
}

/// Comeback parameters handed out by a responder under anti-clogging
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Comeback {
    /// Anti-clogging token, hex encoded when serialized
    #[serde(serialize_with = "serialize_hex")]
    pub token: Vec<u8>,
    /// Seconds to wait before retrying
    pub after: u16,
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}
