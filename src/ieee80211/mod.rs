pub mod rsn;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of the 802.11 management frame header.
pub const MGMT_HDR_LEN: usize = 24;

/// Frame control for Authentication (type 0, subtype 11), little-endian.
pub const FC_AUTH: u16 = 0x00b0;
/// Frame control for Deauthentication (type 0, subtype 12), little-endian.
pub const FC_DEAUTH: u16 = 0x00c0;

/// Authentication algorithm numbers
pub mod auth_alg {
    pub const FILS_SK: u16 = 4;
    pub const PASN: u16 = 7;
    pub const SAE: u16 = 3;
}

/// Status codes carried in Authentication frames
pub mod status {
    pub const SUCCESS: u16 = 0;
    pub const UNSPECIFIED_FAILURE: u16 = 1;
    pub const ASSOC_REJECTED_TEMPORARILY: u16 = 30;
    pub const INVALID_PARAMETERS: u16 = 38;
    pub const INVALID_RSNIE: u16 = 72;
    pub const FINITE_CYCLIC_GROUP_NOT_SUPPORTED: u16 = 77;
    pub const SAE_HASH_TO_ELEMENT: u16 = 126;
}

/// Deauthentication reason: previous authentication no longer valid.
pub const REASON_PREV_AUTH_NOT_VALID: u16 = 2;

/// Element identifiers
pub mod eid {
    pub const RSN: u8 = 48;
    pub const MIC: u8 = 140;
    pub const FRAGMENT: u8 = 242;
    pub const RSNX: u8 = 244;
    pub const EXTENSION: u8 = 255;

    pub const EXT_FILS_SESSION: u8 = 4;
    pub const EXT_FILS_WRAPPED_DATA: u8 = 8;
    pub const EXT_FILS_NONCE: u8 = 13;
    pub const EXT_PASN_PARAMS: u8 = 100;
    pub const EXT_WRAPPED_DATA: u8 = 108;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("not an authentication frame (fc=0x{0:04x})")]
    NotAuthentication(u16),
    #[error("element {id} truncated: need {need} bytes, have {have}")]
    TruncatedElement { id: u8, need: usize, have: usize },
    #[error("invalid MAC address: {0}")]
    InvalidAddress(String),
}

/// IEEE 802 MAC address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }

    pub fn octets(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(FrameError::InvalidAddress(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| FrameError::InvalidAddress(s.to_string()))?;
        }
        Ok(MacAddr(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = FrameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(addr: MacAddr) -> Self {
        addr.to_string()
    }
}

/// One information element. `ext_id` is set for Element ID Extension
/// elements, in which case `data` excludes the extension octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element<'a> {
    pub id: u8,
    pub ext_id: Option<u8>,
    pub data: &'a [u8],
}

impl Element<'_> {
    /// The element including its two header octets, as it appears on air.
    pub fn raw_len(&self) -> usize {
        2 + self.data.len() + usize::from(self.ext_id.is_some())
    }
}

/// Walks a sequence of information elements, stopping at the first
/// truncated one.
pub fn parse_elements(mut ies: &[u8]) -> Result<Vec<Element<'_>>, FrameError> {
    let mut out = Vec::new();
    while !ies.is_empty() {
        if ies.len() < 2 {
            return Err(FrameError::TruncatedElement {
                id: ies[0],
                need: 2,
                have: ies.len(),
            });
        }
        let id = ies[0];
        let len = ies[1] as usize;
        if ies.len() < 2 + len {
            return Err(FrameError::TruncatedElement {
                id,
                need: len,
                have: ies.len() - 2,
            });
        }
        let body = &ies[2..2 + len];
        let element = if id == eid::EXTENSION && !body.is_empty() {
            Element {
                id,
                ext_id: Some(body[0]),
                data: &body[1..],
            }
        } else {
            Element {
                id,
                ext_id: None,
                data: body,
            }
        };
        out.push(element);
        ies = &ies[2 + len..];
    }
    Ok(out)
}

/// Reassembles an extension element that may continue in Fragment
/// elements. Returns `None` if the element is absent.
pub fn defrag_ext(elements: &[Element<'_>], ext_id: u8) -> Option<Vec<u8>> {
    let start = elements
        .iter()
        .position(|e| e.id == eid::EXTENSION && e.ext_id == Some(ext_id))?;

    let first = &elements[start];
    let mut out = first.data.to_vec();
    // The first element is full when its body (ext id included) is 255 bytes.
    let mut full = first.data.len() + 1 == 255;
    for e in &elements[start + 1..] {
        if !full || e.id != eid::FRAGMENT {
            break;
        }
        out.extend_from_slice(e.data);
        full = e.data.len() == 255;
    }
    Some(out)
}

/// Writes a plain element. Payloads are expected to fit in one element.
pub fn put_element(buf: &mut BytesMut, id: u8, data: &[u8]) {
    buf.put_u8(id);
    buf.put_u8(data.len() as u8);
    buf.put_slice(data);
}

/// Writes an extension element, spilling into Fragment elements when the
/// payload does not fit.
pub fn put_ext_element(buf: &mut BytesMut, ext_id: u8, data: &[u8]) {
    let first = data.len().min(254);
    buf.put_u8(eid::EXTENSION);
    buf.put_u8((first + 1) as u8);
    buf.put_u8(ext_id);
    buf.put_slice(&data[..first]);

    for chunk in data[first..].chunks(255) {
        buf.put_u8(eid::FRAGMENT);
        buf.put_u8(chunk.len() as u8);
        buf.put_slice(chunk);
    }
}

/// 802.11 management frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MgmtHeader {
    pub frame_control: u16,
    pub da: MacAddr,
    pub sa: MacAddr,
    pub bssid: MacAddr,
    pub seq_ctrl: u16,
}

impl MgmtHeader {
    pub fn new(frame_control: u16, da: MacAddr, sa: MacAddr, bssid: MacAddr) -> Self {
        Self {
            frame_control,
            da,
            sa,
            bssid,
            seq_ctrl: 0,
        }
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.frame_control);
        // Duration is filled in by the driver.
        buf.put_u16_le(0);
        buf.put_slice(&self.da.0);
        buf.put_slice(&self.sa.0);
        buf.put_slice(&self.bssid.0);
        buf.put_u16_le(self.seq_ctrl);
    }

    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < MGMT_HDR_LEN {
            return Err(FrameError::TooShort(data.len()));
        }
        let mut buf = data;
        let frame_control = buf.get_u16_le();
        let _duration = buf.get_u16_le();
        let mut da = [0u8; 6];
        buf.copy_to_slice(&mut da);
        let mut sa = [0u8; 6];
        buf.copy_to_slice(&mut sa);
        let mut bssid = [0u8; 6];
        buf.copy_to_slice(&mut bssid);
        let seq_ctrl = buf.get_u16_le();

        Ok(Self {
            frame_control,
            da: MacAddr(da),
            sa: MacAddr(sa),
            bssid: MacAddr(bssid),
            seq_ctrl,
        })
    }
}

/// Decoded Authentication frame (header, fixed fields, raw elements)
#[derive(Debug, Clone, Copy)]
pub struct AuthFrame<'a> {
    pub header: MgmtHeader,
    pub algorithm: u16,
    pub transaction: u16,
    pub status: u16,
    /// Everything after the management header (fixed fields + elements).
    pub body: &'a [u8],
    /// Elements following the fixed fields.
    pub ies: &'a [u8],
}

/// Decode an Authentication management frame
pub fn parse_auth(frame: &[u8]) -> Result<AuthFrame<'_>, FrameError> {
    // Header(24) + Algorithm(2) + Transaction(2) + Status(2)
    if frame.len() < MGMT_HDR_LEN + 6 {
        return Err(FrameError::TooShort(frame.len()));
    }
    let header = MgmtHeader::parse(frame)?;
    if header.frame_control & 0x00fc != FC_AUTH {
        return Err(FrameError::NotAuthentication(header.frame_control));
    }

    let body = &frame[MGMT_HDR_LEN..];
    let mut fixed = body;
    let algorithm = fixed.get_u16_le();
    let transaction = fixed.get_u16_le();
    let status = fixed.get_u16_le();

    Ok(AuthFrame {
        header,
        algorithm,
        transaction,
        status,
        body,
        ies: &body[6..],
    })
}

/// Writes the header and fixed fields of an Authentication frame.
pub fn build_auth_header(
    buf: &mut BytesMut,
    bssid: MacAddr,
    src: MacAddr,
    dst: MacAddr,
    algorithm: u16,
    transaction: u16,
    status: u16,
) {
    MgmtHeader::new(FC_AUTH, dst, src, bssid).write(buf);
    buf.put_u16_le(algorithm);
    buf.put_u16_le(transaction);
    buf.put_u16_le(status);
}

/// Build a Deauthentication frame
pub fn build_deauth(da: MacAddr, sa: MacAddr, bssid: MacAddr, reason: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(MGMT_HDR_LEN + 2);
    MgmtHeader::new(FC_DEAUTH, da, sa, bssid).write(&mut buf);
    buf.put_u16_le(reason);
    buf.to_vec()
}
