//! RSN and RSNX elements, AKM and cipher suite selectors

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::{eid, put_element};

/// IEEE 802.11 OUI used by all suite selectors here
const RSN_OUI: u32 = 0x000fac00;

/// Group data cipher used by PASN: group addressed traffic not allowed
pub const CIPHER_NO_GROUP_ADDRESSED: u32 = RSN_OUI | 7;

pub const PMKID_LEN: usize = 16;

pub type Pmkid = [u8; PMKID_LEN];

/// RSN capabilities: management frame protection capable/required
pub const RSN_CAPAB_MFPR: u16 = 0x0040;
pub const RSN_CAPAB_MFPC: u16 = 0x0080;

/// RSNXE capability bit numbers
pub mod rsnx_capab {
    pub const SAE_H2E: u8 = 5;
    pub const SAE_PK: u8 = 6;
    pub const SECURE_LTF: u8 = 8;
    pub const SECURE_RTT: u8 = 9;
    pub const PROT_RANGE_NEG: u8 = 10;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RsnError {
    #[error("RSNE too short")]
    TooShort,
    #[error("unsupported RSN version {0}")]
    Version(u16),
    #[error("RSNE list truncated")]
    Truncated,
    #[error("RSNE must carry exactly one AKM and one pairwise cipher")]
    NotSingleSuite,
    #[error("RSNE carries {0} PMKIDs")]
    TooManyPmkids(usize),
    #[error("unknown suite: {0}")]
    UnknownSuite(String),
    #[error("RSNXE length field says {declared} octets, element has {actual}")]
    RsnxeLength { declared: usize, actual: usize },
}

/// Authentication and key management suites PASN can run over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Akm {
    Pasn,
    Sae,
    FtSae,
    FilsSha256,
    FilsSha384,
    FtFilsSha256,
    FtFilsSha384,
    FtPsk,
    FtIeee8021x,
}

impl Akm {
    pub const ALL: [Akm; 9] = [
        Akm::Pasn,
        Akm::Sae,
        Akm::FtSae,
        Akm::FilsSha256,
        Akm::FilsSha384,
        Akm::FtFilsSha256,
        Akm::FtFilsSha384,
        Akm::FtPsk,
        Akm::FtIeee8021x,
    ];

    pub fn selector(self) -> u32 {
        RSN_OUI
            | match self {
                Akm::FtIeee8021x => 3,
                Akm::FtPsk => 4,
                Akm::Sae => 8,
                Akm::FtSae => 9,
                Akm::FilsSha256 => 14,
                Akm::FilsSha384 => 15,
                Akm::FtFilsSha256 => 16,
                Akm::FtFilsSha384 => 17,
                Akm::Pasn => 21,
            }
    }

    pub fn from_selector(selector: u32) -> Option<Self> {
        Akm::ALL.into_iter().find(|a| a.selector() == selector)
    }

    pub fn is_ft(self) -> bool {
        matches!(
            self,
            Akm::FtSae | Akm::FtFilsSha256 | Akm::FtFilsSha384 | Akm::FtPsk | Akm::FtIeee8021x
        )
    }

    pub fn is_fils(self) -> bool {
        matches!(self, Akm::FilsSha256 | Akm::FilsSha384)
    }

    pub fn is_sae(self) -> bool {
        self == Akm::Sae
    }

    /// AKMs whose key hierarchy is built on SHA-384
    pub fn uses_sha384(self) -> bool {
        matches!(self, Akm::FilsSha384 | Akm::FtFilsSha384)
    }
}

impl fmt::Display for Akm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Akm::Pasn => "PASN",
            Akm::Sae => "SAE",
            Akm::FtSae => "FT-SAE",
            Akm::FilsSha256 => "FILS-SHA256",
            Akm::FilsSha384 => "FILS-SHA384",
            Akm::FtFilsSha256 => "FT-FILS-SHA256",
            Akm::FtFilsSha384 => "FT-FILS-SHA384",
            Akm::FtPsk => "FT-PSK",
            Akm::FtIeee8021x => "FT-EAP",
        };
        f.write_str(name)
    }
}

impl FromStr for Akm {
    type Err = RsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Akm::ALL
            .into_iter()
            .find(|a| a.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| RsnError::UnknownSuite(s.to_string()))
    }
}

impl TryFrom<String> for Akm {
    type Error = RsnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Akm> for String {
    fn from(akm: Akm) -> Self {
        akm.to_string()
    }
}

/// Pairwise cipher suites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Cipher {
    Ccmp128,
    Gcmp128,
    Ccmp256,
    Gcmp256,
}

impl Cipher {
    /// Preference order when picking a cipher from a peer's RSNE
    pub const PREFERENCE: [Cipher; 4] = [
        Cipher::Ccmp256,
        Cipher::Gcmp256,
        Cipher::Ccmp128,
        Cipher::Gcmp128,
    ];

    pub fn selector(self) -> u32 {
        RSN_OUI
            | match self {
                Cipher::Ccmp128 => 4,
                Cipher::Gcmp128 => 8,
                Cipher::Gcmp256 => 9,
                Cipher::Ccmp256 => 10,
            }
    }

    pub fn from_selector(selector: u32) -> Option<Self> {
        Cipher::PREFERENCE
            .into_iter()
            .find(|c| c.selector() == selector)
    }

    /// Temporal key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            Cipher::Ccmp128 | Cipher::Gcmp128 => 16,
            Cipher::Ccmp256 | Cipher::Gcmp256 => 32,
        }
    }

    pub fn is_256(self) -> bool {
        self.key_len() == 32
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cipher::Ccmp128 => "CCMP-128",
            Cipher::Gcmp128 => "GCMP-128",
            Cipher::Ccmp256 => "CCMP-256",
            Cipher::Gcmp256 => "GCMP-256",
        };
        f.write_str(name)
    }
}

impl FromStr for Cipher {
    type Err = RsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CCMP" | "CCMP-128" => Ok(Cipher::Ccmp128),
            "GCMP" | "GCMP-128" => Ok(Cipher::Gcmp128),
            "CCMP-256" => Ok(Cipher::Ccmp256),
            "GCMP-256" => Ok(Cipher::Gcmp256),
            _ => Err(RsnError::UnknownSuite(s.to_string())),
        }
    }
}

impl TryFrom<String> for Cipher {
    type Error = RsnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cipher> for String {
    fn from(cipher: Cipher) -> Self {
        cipher.to_string()
    }
}

/// Decoded RSN element. Suite lists keep raw selectors so unknown
/// suites survive a parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsnElement {
    pub version: u16,
    pub group_cipher: u32,
    pub pairwise: Vec<u32>,
    pub akms: Vec<u32>,
    pub capabilities: u16,
    pub pmkids: Vec<Pmkid>,
    pub group_mgmt_cipher: Option<u32>,
}

impl RsnElement {
    /// The single-suite RSNE carried in PASN frames
    pub fn pasn(akm: Akm, cipher: Cipher, pmkid: Option<Pmkid>) -> Self {
        Self {
            version: 1,
            group_cipher: CIPHER_NO_GROUP_ADDRESSED,
            pairwise: vec![cipher.selector()],
            akms: vec![akm.selector()],
            capabilities: RSN_CAPAB_MFPC | RSN_CAPAB_MFPR,
            pmkids: pmkid.into_iter().collect(),
            group_mgmt_cipher: None,
        }
    }

    /// An RSNE as a peer would advertise it in its beacon
    pub fn advertised(akms: &[Akm], ciphers: &[Cipher]) -> Self {
        Self {
            version: 1,
            group_cipher: Cipher::Ccmp128.selector(),
            pairwise: ciphers.iter().map(|c| c.selector()).collect(),
            akms: akms.iter().map(|a| a.selector()).collect(),
            capabilities: RSN_CAPAB_MFPC,
            pmkids: Vec::new(),
            group_mgmt_cipher: None,
        }
    }

    /// Decode from an element body (without the ID/length header)
    pub fn parse(body: &[u8]) -> Result<Self, RsnError> {
        if body.len() < 2 {
            return Err(RsnError::TooShort);
        }
        let mut buf = body;
        let version = buf.get_u16_le();
        if version != 1 {
            return Err(RsnError::Version(version));
        }

        let mut rsn = RsnElement {
            version,
            group_cipher: Cipher::Ccmp128.selector(),
            pairwise: vec![Cipher::Ccmp128.selector()],
            akms: Vec::new(),
            capabilities: 0,
            pmkids: Vec::new(),
            group_mgmt_cipher: None,
        };

        if buf.remaining() < 4 {
            return Ok(rsn);
        }
        rsn.group_cipher = buf.get_u32();

        if buf.remaining() < 2 {
            return Ok(rsn);
        }
        rsn.pairwise = read_suite_list(&mut buf)?;

        if buf.remaining() < 2 {
            return Ok(rsn);
        }
        rsn.akms = read_suite_list(&mut buf)?;

        if buf.remaining() < 2 {
            return Ok(rsn);
        }
        rsn.capabilities = buf.get_u16_le();

        if buf.remaining() < 2 {
            return Ok(rsn);
        }
        let count = buf.get_u16_le() as usize;
        if buf.remaining() < count * PMKID_LEN {
            return Err(RsnError::Truncated);
        }
        for _ in 0..count {
            let mut pmkid = [0u8; PMKID_LEN];
            buf.copy_to_slice(&mut pmkid);
            rsn.pmkids.push(pmkid);
        }

        if buf.remaining() >= 4 {
            rsn.group_mgmt_cipher = Some(buf.get_u32());
        }
        Ok(rsn)
    }

    /// Append as a complete element
    pub fn write(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(64);
        body.put_u16_le(self.version);
        body.put_u32(self.group_cipher);
        body.put_u16_le(self.pairwise.len() as u16);
        for s in &self.pairwise {
            body.put_u32(*s);
        }
        body.put_u16_le(self.akms.len() as u16);
        for s in &self.akms {
            body.put_u32(*s);
        }
        body.put_u16_le(self.capabilities);
        if !self.pmkids.is_empty() || self.group_mgmt_cipher.is_some() {
            body.put_u16_le(self.pmkids.len() as u16);
            for p in &self.pmkids {
                body.put_slice(p);
            }
        }
        if let Some(gm) = self.group_mgmt_cipher {
            body.put_u32(gm);
        }
        put_element(buf, eid::RSN, &body);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.write(&mut buf);
        buf.to_vec()
    }

    pub fn has_akm(&self, akm: Akm) -> bool {
        self.akms.contains(&akm.selector())
    }

    pub fn has_cipher(&self, cipher: Cipher) -> bool {
        self.pairwise.contains(&cipher.selector())
    }

    /// Most preferred cipher this RSNE offers
    pub fn best_cipher(&self) -> Option<Cipher> {
        Cipher::PREFERENCE.into_iter().find(|c| self.has_cipher(*c))
    }

    pub fn pmkid(&self) -> Option<&Pmkid> {
        self.pmkids.first()
    }

    /// The single AKM and cipher of a PASN RSNE
    pub fn validate_pasn(&self) -> Result<(Akm, Cipher), RsnError> {
        if self.akms.len() != 1 || self.pairwise.len() != 1 {
            return Err(RsnError::NotSingleSuite);
        }
        if self.pmkids.len() > 1 {
            return Err(RsnError::TooManyPmkids(self.pmkids.len()));
        }
        let akm = Akm::from_selector(self.akms[0])
            .ok_or_else(|| RsnError::UnknownSuite(format!("AKM {:08x}", self.akms[0])))?;
        let cipher = Cipher::from_selector(self.pairwise[0])
            .ok_or_else(|| RsnError::UnknownSuite(format!("cipher {:08x}", self.pairwise[0])))?;
        Ok((akm, cipher))
    }
}

fn read_suite_list(buf: &mut &[u8]) -> Result<Vec<u32>, RsnError> {
    let count = buf.get_u16_le() as usize;
    if buf.remaining() < count * 4 {
        return Err(RsnError::Truncated);
    }
    Ok((0..count).map(|_| buf.get_u32()).collect())
}

/// RSN Extension element: a little-endian capability bitfield whose low
/// four bits hold the field length minus one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rsnxe {
    pub field: Vec<u8>,
}

impl Rsnxe {
    pub fn from_bits(bits: &[u8]) -> Self {
        let max = bits.iter().copied().max().unwrap_or(0) as usize;
        let len = (max / 8 + 1).max(1);
        let mut field = vec![0u8; len];
        for &b in bits {
            field[b as usize / 8] |= 1 << (b % 8);
        }
        field[0] = (field[0] & 0xf0) | ((len - 1) as u8 & 0x0f);
        Self { field }
    }

    pub fn parse(body: &[u8]) -> Self {
        Self {
            field: body.to_vec(),
        }
    }

    /// Check the length subfield against the element length
    pub fn validate(&self) -> Result<(), RsnError> {
        let Some(first) = self.field.first() else {
            return Err(RsnError::RsnxeLength {
                declared: 1,
                actual: 0,
            });
        };
        let declared = usize::from(first & 0x0f) + 1;
        if declared != self.field.len() {
            return Err(RsnError::RsnxeLength {
                declared,
                actual: self.field.len(),
            });
        }
        Ok(())
    }

    pub fn has(&self, bit: u8) -> bool {
        // Bits 0-3 hold the field length
        if bit < 4 {
            return false;
        }
        self.field
            .get(bit as usize / 8)
            .map(|o| o & (1 << (bit % 8)) != 0)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.field.is_empty()
    }

    pub fn write(&self, buf: &mut BytesMut) {
        if !self.field.is_empty() {
            put_element(buf, eid::RSNX, &self.field);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.write(&mut buf);
        buf.to_vec()
    }
}
