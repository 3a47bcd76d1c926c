use anyhow::{anyhow, Result};
use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{AttrKind, Property};

/// STUN error codes this server can emit. Trimmed to what the dispatch core
/// and request handler actually return; TURN-only codes are out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ErrorKind {
    BadRequest = 400,
    Unauthorized = 401,
    ServerError = 600,
}

impl ErrorKind {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::ServerError => "Server Error",
        }
    }
}

/// ERROR-CODE attribute: class/number split of a 3-digit code plus a UTF-8
/// reason phrase, RFC 5389 §15.6.
pub struct ErrorCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCodeValue {
    pub code: u16,
    pub reason: String,
}

impl From<ErrorKind> for ErrorCodeValue {
    fn from(kind: ErrorKind) -> Self {
        Self {
            code: kind as u16,
            reason: kind.reason().to_string(),
        }
    }
}

impl<'a> Property<'a> for ErrorCode {
    type Error = anyhow::Error;
    type Inner = ErrorCodeValue;

    fn kind() -> AttrKind {
        AttrKind::ErrorCode
    }

    fn into(value: Self::Inner, buf: &mut BytesMut, _token: &[u8; 12]) {
        let class = (value.code / 100) as u8;
        let number = (value.code % 100) as u8;
        buf.extend_from_slice(&[0, 0, class, number]);
        buf.extend_from_slice(value.reason.as_bytes());
    }

    fn try_from(buf: &'a [u8], _token: &'a [u8; 12]) -> Result<Self::Inner, Self::Error> {
        if buf.len() < 4 {
            return Err(anyhow!("ERROR-CODE too short"));
        }

        let class = buf[2] as u16;
        let number = buf[3] as u16;
        let reason = std::str::from_utf8(&buf[4..])?.to_string();

        Ok(ErrorCodeValue {
            code: class * 100 + number,
            reason,
        })
    }
}
