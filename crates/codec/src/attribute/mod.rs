mod address;
mod error;

pub use address::{ChangedAddress, MappedAddress, OtherAddress, ResponseOrigin, XorMappedAddress};
pub use error::{ErrorCode, ErrorKind};

use anyhow::{anyhow, Result};
use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util;

/// STUN attribute type numbers this crate understands. Unknown attributes
/// are skipped by the reader, not rejected — per RFC 5389 comprehension
/// rules for attributes below `0x8000` vs above it; this server never
/// needs to reject on an unknown optional attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum AttrKind {
    MappedAddress = 0x0001,
    ChangeRequest = 0x0003,
    ChangedAddress = 0x0005,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorMappedAddress = 0x0020,
    Software = 0x8022,
    Fingerprint = 0x8028,
    ResponseOrigin = 0x802b,
    OtherAddress = 0x802c,
}

/// Encode/decode contract for one attribute type. `Inner` is the value type
/// callers deal with (`&str`, `SocketAddr`, ...); `into`/`try_from` handle the
/// TLV framing, the caller only ever appends/reads a typed value.
pub trait Property<'a>: Sized {
    type Error;
    type Inner;

    fn kind() -> AttrKind;
    fn into(value: Self::Inner, buf: &mut BytesMut, token: &[u8; 12]);
    fn try_from(buf: &'a [u8], token: &'a [u8; 12]) -> Result<Self::Inner, Self::Error>;
}

macro_rules! text_attribute {
    ($name:ident, $kind:ident) => {
        pub struct $name;

        impl<'a> Property<'a> for $name {
            type Error = anyhow::Error;
            type Inner = &'a str;

            fn kind() -> AttrKind {
                AttrKind::$kind
            }

            fn into(value: Self::Inner, buf: &mut BytesMut, _token: &[u8; 12]) {
                buf.extend_from_slice(value.as_bytes());
            }

            fn try_from(buf: &'a [u8], _token: &'a [u8; 12]) -> Result<Self::Inner, Self::Error> {
                std::str::from_utf8(buf).map_err(|e| anyhow!(e))
            }
        }
    };
}

text_attribute!(UserName, UserName);
text_attribute!(Realm, Realm);
text_attribute!(Nonce, Nonce);
text_attribute!(Software, Software);

/// MESSAGE-INTEGRITY: a raw 20-byte HMAC-SHA1 digest. The writer computes
/// and appends this last (see [`crate::message::MessageWriter::flush`]); the
/// reader only hands back the raw bytes for [`crate::reader::StunReader::integrity`]
/// to recompute and compare.
pub struct MessageIntegrity;

impl<'a> Property<'a> for MessageIntegrity {
    type Error = anyhow::Error;
    type Inner = &'a [u8];

    fn kind() -> AttrKind {
        AttrKind::MessageIntegrity
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _token: &[u8; 12]) {
        buf.extend_from_slice(value);
    }

    fn try_from(buf: &'a [u8], _token: &'a [u8; 12]) -> Result<Self::Inner, Self::Error> {
        if buf.len() != 20 {
            return Err(anyhow!("MESSAGE-INTEGRITY must be 20 bytes"));
        }
        Ok(buf)
    }
}

/// FINGERPRINT: CRC32 of everything before it, XORed with a magic constant.
pub struct Fingerprint;

impl<'a> Property<'a> for Fingerprint {
    type Error = anyhow::Error;
    type Inner = u32;

    fn kind() -> AttrKind {
        AttrKind::Fingerprint
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _token: &[u8; 12]) {
        buf.extend_from_slice(&value.to_be_bytes());
    }

    fn try_from(buf: &'a [u8], _token: &'a [u8; 12]) -> Result<Self::Inner, Self::Error> {
        if buf.len() != 4 {
            return Err(anyhow!("FINGERPRINT must be 4 bytes"));
        }
        Ok(util::as_u32(buf))
    }
}

/// CHANGE-REQUEST: two flag bits in a 4-byte reserved word, RFC 5780 §7.2.
pub struct ChangeRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeRequestFlags {
    pub change_ip: bool,
    pub change_port: bool,
}

impl<'a> Property<'a> for ChangeRequest {
    type Error = anyhow::Error;
    type Inner = ChangeRequestFlags;

    fn kind() -> AttrKind {
        AttrKind::ChangeRequest
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _token: &[u8; 12]) {
        let mut word: u32 = 0;
        if value.change_ip {
            word |= 0x04;
        }
        if value.change_port {
            word |= 0x02;
        }
        buf.extend_from_slice(&word.to_be_bytes());
    }

    fn try_from(buf: &'a [u8], _token: &'a [u8; 12]) -> Result<Self::Inner, Self::Error> {
        if buf.len() != 4 {
            return Err(anyhow!("CHANGE-REQUEST must be 4 bytes"));
        }

        let word = util::as_u32(buf);
        Ok(ChangeRequestFlags {
            change_ip: word & 0x04 != 0,
            change_port: word & 0x02 != 0,
        })
    }
}
