//! Key agreement, key derivation and MIC computation for PASN
//!
//! [`CryptoSuite`] is the seam the exchange calls through; the default
//! [`Ieee80211Crypto`] implements group 19 over P-256 and the IEEE 802.11
//! SHA-256/SHA-384 PRF.

use hmac::{Hmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha384};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{CryptoError, KCK_LEN};
use crate::ieee80211::rsn::{Akm, Cipher};
use crate::ieee80211::MacAddr;

type HmacSha256 = Hmac<Sha256>;
type HmacSha384 = Hmac<Sha384>;

const PTK_LABEL: &[u8] = b"PASN PTK Derivation";

/// Longest key slot held by [`Ptk`]
const KEY_SLOT: usize = 32;

/// Whether the exchange runs on SHA-384: any SHA-384 AKM, or plain PASN
/// with a 256-bit cipher.
pub fn uses_sha384(akm: Akm, cipher: Cipher) -> bool {
    akm.uses_sha384() || (akm == Akm::Pasn && cipher.is_256())
}

/// MIC length for the negotiated cipher
pub fn mic_len(cipher: Cipher) -> usize {
    if cipher.is_256() {
        24
    } else {
        16
    }
}

/// KEK length when KEK derivation is requested
pub fn kek_len(akm: Akm, cipher: Cipher) -> usize {
    if uses_sha384(akm, cipher) {
        32
    } else {
        16
    }
}

/// Constant-time MIC comparison
pub fn mic_matches(expected: &[u8], received: &[u8]) -> bool {
    expected.len() == received.len() && bool::from(expected.ct_eq(received))
}

/// Ephemeral key pair. `public` is SEC1 encoded, tag octet included.
pub struct EcdhKeypair {
    pub private: Zeroizing<Vec<u8>>,
    pub public: Vec<u8>,
}

impl std::fmt::Debug for EcdhKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdhKeypair")
            .field("public", &hex::encode(&self.public))
            .finish_non_exhaustive()
    }
}

/// Pairwise transient key, split as KCK | KEK | TK | KDK
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ptk {
    kck: [u8; KEY_SLOT],
    kek: [u8; KEY_SLOT],
    tk: [u8; KEY_SLOT],
    kdk: [u8; KEY_SLOT],
    kck_len: usize,
    kek_len: usize,
    tk_len: usize,
    kdk_len: usize,
}

impl Ptk {
    /// Split PRF output into its keys
    pub fn from_prf_output(
        output: &[u8],
        kek_len: usize,
        tk_len: usize,
        kdk_len: usize,
    ) -> Result<Self, CryptoError> {
        let kck_len = KCK_LEN;
        if kek_len > KEY_SLOT || tk_len > KEY_SLOT || kdk_len > KEY_SLOT {
            return Err(CryptoError::new("key length exceeds PTK slot"));
        }
        if output.len() != kck_len + kek_len + tk_len + kdk_len {
            return Err(CryptoError::new(format!(
                "PTK output length {} does not match layout",
                output.len()
            )));
        }

        let mut ptk = Ptk {
            kck: [0; KEY_SLOT],
            kek: [0; KEY_SLOT],
            tk: [0; KEY_SLOT],
            kdk: [0; KEY_SLOT],
            kck_len,
            kek_len,
            tk_len,
            kdk_len,
        };
        let (kck, rest) = output.split_at(kck_len);
        let (kek, rest) = rest.split_at(kek_len);
        let (tk, kdk) = rest.split_at(tk_len);
        ptk.kck[..kck_len].copy_from_slice(kck);
        ptk.kek[..kek_len].copy_from_slice(kek);
        ptk.tk[..tk_len].copy_from_slice(tk);
        ptk.kdk[..kdk_len].copy_from_slice(kdk);
        Ok(ptk)
    }

    pub fn kck(&self) -> &[u8] {
        &self.kck[..self.kck_len]
    }

    pub fn kek(&self) -> &[u8] {
        &self.kek[..self.kek_len]
    }

    pub fn tk(&self) -> &[u8] {
        &self.tk[..self.tk_len]
    }

    /// Key derivation key for secure ranging; empty unless requested
    pub fn kdk(&self) -> &[u8] {
        &self.kdk[..self.kdk_len]
    }

    /// True when every key octet is zero
    pub fn is_zeroed(&self) -> bool {
        [&self.kck, &self.kek, &self.tk, &self.kdk]
            .iter()
            .all(|k| k.iter().all(|b| *b == 0))
    }
}

impl std::fmt::Debug for Ptk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ptk")
            .field("kck_len", &self.kck_len)
            .field("kek_len", &self.kek_len)
            .field("tk_len", &self.tk_len)
            .field("kdk_len", &self.kdk_len)
            .finish_non_exhaustive()
    }
}

/// Inputs to PMK→PTK derivation
#[derive(Debug, Clone, Copy)]
pub struct PtkInputs<'a> {
    pub pmk: &'a [u8],
    /// Station (supplicant) address
    pub spa: MacAddr,
    pub bssid: MacAddr,
    /// ECDH shared secret
    pub dh_ss: &'a [u8],
    pub akm: Akm,
    pub cipher: Cipher,
    pub kdk_len: usize,
    pub derive_kek: bool,
}

/// Crypto primitives consumed by the PASN exchange
pub trait CryptoSuite {
    /// Generate an ephemeral key pair for `group`
    fn ecdh_generate(&self, group: u16) -> Result<EcdhKeypair, CryptoError>;

    /// Shared secret (x coordinate) with a peer public key carrying its
    /// SEC1 tag octet
    fn ecdh_shared_secret(
        &self,
        group: u16,
        private: &[u8],
        peer_public: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    fn pmk_to_ptk(&self, inputs: &PtkInputs<'_>) -> Result<Ptk, CryptoError>;

    /// MIC over `addr1 || addr2 || data || frame`, truncated to the cipher's
    /// MIC length
    #[allow(clippy::too_many_arguments)]
    fn mic(
        &self,
        kck: &[u8],
        akm: Akm,
        cipher: Cipher,
        addr1: MacAddr,
        addr2: MacAddr,
        data: &[u8],
        frame: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Hash of an Authentication frame body
    fn frame_hash(&self, akm: Akm, cipher: Cipher, body: &[u8]) -> Vec<u8>;

    /// FILS PMK from the ERP rMSK and both nonces
    fn fils_rmsk_to_pmk(
        &self,
        akm: Akm,
        rmsk: &[u8],
        snonce: &[u8],
        anonce: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    fn random_bytes(&self, buf: &mut [u8]);
}

/// Default primitives: P-256 ECDH, HMAC-SHA-256/384 KDF and MIC
#[derive(Debug, Clone, Copy, Default)]
pub struct Ieee80211Crypto;

impl Ieee80211Crypto {
    pub fn new() -> Self {
        Ieee80211Crypto
    }
}

/// IEEE 802.11 PRF: HMAC(key, i || label || data || L) with LE16 counter
/// and LE16 bit length, concatenated and truncated to `len` octets.
pub fn prf(
    sha384: bool,
    key: &[u8],
    label: &[u8],
    data: &[&[u8]],
    len: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let bits = u16::try_from(len * 8).map_err(|_| CryptoError::new("PRF length too large"))?;
    let mut out = Zeroizing::new(Vec::with_capacity(len + 48));
    let mut counter: u16 = 1;

    while out.len() < len {
        let counter_le = counter.to_le_bytes();
        let bits_le = bits.to_le_bytes();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(data.len() + 3);
        parts.push(&counter_le);
        parts.push(label);
        parts.extend_from_slice(data);
        parts.push(&bits_le);
        let block = Zeroizing::new(hmac_vector(sha384, key, &parts)?);
        out.extend_from_slice(&block);
        counter = counter.wrapping_add(1);
    }

    out.truncate(len);
    Ok(out)
}

fn hmac_vector(sha384: bool, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, CryptoError> {
    if sha384 {
        let mut mac = HmacSha384::new_from_slice(key)
            .map_err(|e| CryptoError::new(format!("HMAC key: {e}")))?;
        for p in parts {
            mac.update(p);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    } else {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| CryptoError::new(format!("HMAC key: {e}")))?;
        for p in parts {
            mac.update(p);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn require_p256(group: u16) -> Result<(), CryptoError> {
    if group == 19 {
        Ok(())
    } else {
        Err(CryptoError::new(format!("group {group} not implemented")))
    }
}

impl CryptoSuite for Ieee80211Crypto {
    fn ecdh_generate(&self, group: u16) -> Result<EcdhKeypair, CryptoError> {
        require_p256(group)?;
        let secret = p256::SecretKey::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(true).as_bytes().to_vec();
        Ok(EcdhKeypair {
            private: Zeroizing::new(secret.to_bytes().to_vec()),
            public,
        })
    }

    fn ecdh_shared_secret(
        &self,
        group: u16,
        private: &[u8],
        peer_public: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        require_p256(group)?;
        let secret = p256::SecretKey::from_slice(private)
            .map_err(|_| CryptoError::new("invalid private scalar"))?;
        let public = p256::PublicKey::from_sec1_bytes(peer_public)
            .map_err(|_| CryptoError::new("peer public key is not on the curve"))?;
        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }

    fn pmk_to_ptk(&self, inputs: &PtkInputs<'_>) -> Result<Ptk, CryptoError> {
        if inputs.pmk.is_empty() {
            return Err(CryptoError::new("empty PMK"));
        }
        let sha384 = uses_sha384(inputs.akm, inputs.cipher);
        let kek_len = if inputs.derive_kek {
            kek_len(inputs.akm, inputs.cipher)
        } else {
            0
        };
        let tk_len = inputs.cipher.key_len();
        let total = KCK_LEN + kek_len + tk_len + inputs.kdk_len;

        let output = prf(
            sha384,
            inputs.pmk,
            PTK_LABEL,
            &[&inputs.spa.0, &inputs.bssid.0, inputs.dh_ss],
            total,
        )?;
        Ptk::from_prf_output(&output, kek_len, tk_len, inputs.kdk_len)
    }

    fn mic(
        &self,
        kck: &[u8],
        akm: Akm,
        cipher: Cipher,
        addr1: MacAddr,
        addr2: MacAddr,
        data: &[u8],
        frame: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut full = hmac_vector(
            uses_sha384(akm, cipher),
            kck,
            &[&addr1.0, &addr2.0, data, frame],
        )?;
        full.truncate(mic_len(cipher));
        Ok(full)
    }

    fn frame_hash(&self, akm: Akm, cipher: Cipher, body: &[u8]) -> Vec<u8> {
        if uses_sha384(akm, cipher) {
            Sha384::digest(body).to_vec()
        } else {
            Sha256::digest(body).to_vec()
        }
    }

    fn fils_rmsk_to_pmk(
        &self,
        akm: Akm,
        rmsk: &[u8],
        snonce: &[u8],
        anonce: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut key = Vec::with_capacity(snonce.len() + anonce.len());
        key.extend_from_slice(snonce);
        key.extend_from_slice(anonce);
        let pmk = hmac_vector(akm.uses_sha384(), &key, &[rmsk])?;
        Ok(Zeroizing::new(pmk))
    }

    fn random_bytes(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}
