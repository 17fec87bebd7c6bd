//! PASN Authentication frame builder and parser
//!
//! Frame structure (after the 24-byte management header):
//!   Algorithm(2,LE)=7 | Transaction(2,LE) | Status(2,LE) |
//!   [RSNE] | [PASN Parameters] | [Wrapped Data] | [RSNXE] | [MIC]
//!
//! The MIC is computed over the body with the MIC value zeroed and then
//! written in place.

use bytes::{Buf, BufMut, BytesMut};

use super::{ProtocolError, WrappedDataFormat};
use crate::ieee80211::rsn::{RsnElement, Rsnxe};
use crate::ieee80211::{
    auth_alg, build_auth_header, defrag_ext, eid, parse_auth, parse_elements, put_element,
    put_ext_element, AuthFrame, MacAddr, MGMT_HDR_LEN,
};

/// PASN Parameters control field bits
const CTRL_COMEBACK_INFO_PRESENT: u8 = 0x01;
const CTRL_GROUP_AND_KEY_PRESENT: u8 = 0x02;

/// Public key encodings carried in the PASN Parameters element
pub mod pubkey_tag {
    pub const COMPRESSED_0: u8 = 0x02;
    pub const COMPRESSED_1: u8 = 0x03;
    pub const UNCOMPRESSED: u8 = 0x04;
}

/// Comeback information. `after` is only present in frames sent by the
/// responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComebackInfo {
    pub after: Option<u16>,
    pub token: Vec<u8>,
}

/// PASN Parameters element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasnParams {
    pub wrapped_data_format: WrappedDataFormat,
    pub comeback: Option<ComebackInfo>,
    pub group: Option<u16>,
    /// Public key including its encoding tag octet
    pub public_key: Option<Vec<u8>>,
}

impl PasnParams {
    /// Parameters with neither comeback info nor group/key
    pub fn bare(wrapped_data_format: WrappedDataFormat) -> Self {
        Self {
            wrapped_data_format,
            comeback: None,
            group: None,
            public_key: None,
        }
    }

    pub fn write(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(128);
        let mut control = 0u8;
        if self.comeback.is_some() {
            control |= CTRL_COMEBACK_INFO_PRESENT;
        }
        if self.group.is_some() {
            control |= CTRL_GROUP_AND_KEY_PRESENT;
        }
        body.put_u8(control);
        body.put_u8(self.wrapped_data_format as u8);

        if let Some(cb) = &self.comeback {
            if let Some(after) = cb.after {
                body.put_u16_le(after);
            }
            body.put_u8(cb.token.len() as u8);
            body.put_slice(&cb.token);
        }

        if let Some(group) = self.group {
            body.put_u16_le(group);
            let key = self.public_key.as_deref().unwrap_or(&[]);
            body.put_u8(key.len() as u8);
            body.put_slice(key);
        }

        put_ext_element(buf, eid::EXT_PASN_PARAMS, &body);
    }

    /// Decode an element body. `from_ap` selects whether comeback info
    /// carries the `after` field.
    pub fn parse(data: &[u8], from_ap: bool) -> Result<Self, ProtocolError> {
        if data.len() < 2 {
            return Err(ProtocolError::MalformedParams("too short"));
        }
        let mut buf = data;
        let control = buf.get_u8();
        let wrapped_data_format = WrappedDataFormat::try_from(buf.get_u8())?;

        let comeback = if control & CTRL_COMEBACK_INFO_PRESENT != 0 {
            let after = if from_ap {
                if buf.remaining() < 2 {
                    return Err(ProtocolError::MalformedParams("comeback after truncated"));
                }
                Some(buf.get_u16_le())
            } else {
                None
            };
            if buf.remaining() < 1 {
                return Err(ProtocolError::MalformedParams("comeback length missing"));
            }
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(ProtocolError::MalformedParams("comeback token truncated"));
            }
            let token = buf[..len].to_vec();
            buf.advance(len);
            Some(ComebackInfo { after, token })
        } else {
            None
        };

        let (group, public_key) = if control & CTRL_GROUP_AND_KEY_PRESENT != 0 {
            if buf.remaining() < 3 {
                return Err(ProtocolError::MalformedParams("group/key truncated"));
            }
            let group = buf.get_u16_le();
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(ProtocolError::MalformedParams("public key truncated"));
            }
            let key = (len > 0).then(|| buf[..len].to_vec());
            buf.advance(len);
            (Some(group), key)
        } else {
            (None, None)
        };

        if buf.has_remaining() {
            return Err(ProtocolError::MalformedParams("trailing octets"));
        }

        Ok(Self {
            wrapped_data_format,
            comeback,
            group,
            public_key,
        })
    }
}

/// Parameters for building a PASN Authentication frame
#[derive(Debug, Clone)]
pub struct PasnFrameBuilder {
    pub bssid: MacAddr,
    pub src: MacAddr,
    pub dst: MacAddr,
    pub transaction: u16,
    pub status: u16,
    pub rsne: Option<RsnElement>,
    pub params: Option<PasnParams>,
    pub wrapped_data: Option<Vec<u8>>,
    pub rsnxe: Option<Rsnxe>,
    /// Reserve a zeroed MIC element of this length
    pub mic_len: Option<usize>,
}

impl PasnFrameBuilder {
    pub fn new(bssid: MacAddr, src: MacAddr, dst: MacAddr, transaction: u16, status: u16) -> Self {
        Self {
            bssid,
            src,
            dst,
            transaction,
            status,
            rsne: None,
            params: None,
            wrapped_data: None,
            rsnxe: None,
            mic_len: None,
        }
    }

    pub fn build(&self) -> BuiltFrame {
        let mut buf = BytesMut::with_capacity(256);
        build_auth_header(
            &mut buf,
            self.bssid,
            self.src,
            self.dst,
            auth_alg::PASN,
            self.transaction,
            self.status,
        );

        if let Some(rsne) = &self.rsne {
            rsne.write(&mut buf);
        }
        if let Some(params) = &self.params {
            params.write(&mut buf);
        }
        if let Some(wd) = &self.wrapped_data {
            put_ext_element(&mut buf, eid::EXT_WRAPPED_DATA, wd);
        }
        if let Some(rsnxe) = &self.rsnxe {
            rsnxe.write(&mut buf);
        }

        let mic_offset = self.mic_len.map(|len| {
            put_element(&mut buf, eid::MIC, &vec![0u8; len]);
            buf.len() - len
        });

        BuiltFrame {
            bytes: buf.to_vec(),
            mic_offset,
            mic_len: self.mic_len.unwrap_or(0),
        }
    }
}

/// A built frame with the location of its (still zeroed) MIC field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltFrame {
    pub bytes: Vec<u8>,
    mic_offset: Option<usize>,
    mic_len: usize,
}

impl BuiltFrame {
    /// Authentication frame body (everything after the header)
    pub fn body(&self) -> &[u8] {
        &self.bytes[MGMT_HDR_LEN..]
    }

    pub fn set_mic(&mut self, mic: &[u8]) {
        if let Some(off) = self.mic_offset {
            let n = mic.len().min(self.mic_len);
            self.bytes[off..off + n].copy_from_slice(&mic[..n]);
        }
    }
}

/// A received PASN frame with its elements decoded
#[derive(Debug, Clone)]
pub struct PasnFrame<'a> {
    pub auth: AuthFrame<'a>,
    pub rsne: Option<RsnElement>,
    pub rsnxe: Option<Rsnxe>,
    pub params: Option<PasnParams>,
    pub wrapped_data: Option<Vec<u8>>,
    pub mic: Option<&'a [u8]>,
    /// Offset of the MIC value within `auth.body`
    mic_offset: Option<usize>,
}

impl<'a> PasnFrame<'a> {
    /// Decode a PASN Authentication frame. `from_ap` controls how the PASN
    /// Parameters comeback info is read.
    pub fn parse(frame: &'a [u8], from_ap: bool) -> Result<Self, ProtocolError> {
        let auth = parse_auth(frame)?;
        let elements = parse_elements(auth.ies)?;

        let mut rsne = None;
        let mut rsnxe = None;
        let mut mic = None;
        let mut mic_offset = None;

        // Fixed fields occupy the first six octets of the body
        let mut pos = 6;
        for e in &elements {
            match (e.id, e.ext_id) {
                (eid::RSN, _) if rsne.is_none() => rsne = Some(RsnElement::parse(e.data)?),
                (eid::RSNX, _) if rsnxe.is_none() => rsnxe = Some(Rsnxe::parse(e.data)),
                (eid::MIC, _) if mic.is_none() => {
                    mic = Some(e.data);
                    mic_offset = Some(pos + 2);
                }
                _ => {}
            }
            pos += e.raw_len();
        }

        let params = defrag_ext(&elements, eid::EXT_PASN_PARAMS)
            .map(|data| PasnParams::parse(&data, from_ap))
            .transpose()?;
        let wrapped_data = defrag_ext(&elements, eid::EXT_WRAPPED_DATA);

        Ok(Self {
            auth,
            rsne,
            rsnxe,
            params,
            wrapped_data,
            mic,
            mic_offset,
        })
    }

    /// Copy of the body with the MIC value zeroed, as covered by the MIC
    pub fn body_with_zeroed_mic(&self) -> Vec<u8> {
        let mut body = self.auth.body.to_vec();
        if let (Some(off), Some(mic)) = (self.mic_offset, self.mic) {
            body[off..off + mic.len()].fill(0);
        }
        body
    }

    pub fn is_pasn(&self) -> bool {
        self.auth.algorithm == auth_alg::PASN
    }
}
