use std::convert::TryFrom;

use anyhow::Result;
use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::attribute::{AttrKind, Property};
use crate::util;
use crate::Auth;

const COOKIE: [u8; 4] = 0x2112_a442u32.to_be_bytes();

/// STUN message class+method, RFC 5389 §6. Only Binding and the legacy
/// Shared-Secret method (always answered with a 600) are implemented; every
/// other method is out of scope (TURN relaying is a non-goal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Kind {
    BindingRequest = 0x0001,
    BindingResponse = 0x0101,
    BindingError = 0x0111,
    SharedSecretRequest = 0x0002,
    SharedSecretResponse = 0x0102,
    SharedSecretError = 0x0112,
}

impl Kind {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::BindingRequest | Self::SharedSecretRequest)
    }

    pub fn success(&self) -> Self {
        match self {
            Self::BindingRequest | Self::BindingResponse | Self::BindingError => Self::BindingResponse,
            _ => Self::SharedSecretResponse,
        }
    }

    pub fn error(&self) -> Self {
        match self {
            Self::BindingRequest | Self::BindingResponse | Self::BindingError => Self::BindingError,
            _ => Self::SharedSecretError,
        }
    }
}

/// Incremental message writer. Each `append` backpatches the TLV length and
/// applies RFC 5389 padding; `flush` finalizes the overall message length
/// and optionally signs with MESSAGE-INTEGRITY + FINGERPRINT.
pub struct MessageWriter<'a> {
    kind: Kind,
    token: &'a [u8; 12],
    buf: &'a mut BytesMut,
    start: usize,
}

impl<'a> MessageWriter<'a> {
    pub fn new(kind: Kind, token: &'a [u8; 12], buf: &'a mut BytesMut) -> Self {
        let start = buf.len();

        buf.extend_from_slice(&(kind as u16).to_be_bytes());
        buf.extend_from_slice(&[0, 0]); // length placeholder
        buf.extend_from_slice(&COOKIE);
        buf.extend_from_slice(token);

        Self { kind, token, buf, start }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn append<T: Property<'a>>(&mut self, value: T::Inner) {
        let kind: u16 = T::kind().into();
        self.buf.extend_from_slice(&kind.to_be_bytes());

        let len_offset = self.buf.len();
        self.buf.extend_from_slice(&[0, 0]);

        let before = self.buf.len();
        T::into(value, self.buf, self.token);
        let written = self.buf.len() - before;

        self.buf[len_offset..len_offset + 2].copy_from_slice(&(written as u16).to_be_bytes());

        for _ in 0..util::pad_size(written) {
            self.buf.extend_from_slice(&[0]);
        }
    }

    /// Finalizes the message: patches the length field, then optionally
    /// appends MESSAGE-INTEGRITY and FINGERPRINT (FINGERPRINT is always
    /// appended last so it covers the integrity attribute too).
    pub fn flush(mut self, auth: Option<&Auth>) -> Result<()> {
        let body_len = (self.buf.len() - self.start - 20) as u16;
        self.buf[self.start + 2..self.start + 4].copy_from_slice(&body_len.to_be_bytes());

        if let Some(key) = auth {
            self.sign(key)?;
        }

        Ok(())
    }

    fn sign(&mut self, key: &Auth) -> Result<()> {
        let pre_integrity_len = (self.buf.len() - self.start - 20 + 24) as u16;
        self.buf[self.start + 2..self.start + 4].copy_from_slice(&pre_integrity_len.to_be_bytes());

        let size_buf = pre_integrity_len.to_be_bytes();
        let digest = {
            let header = &self.buf[self.start..self.start + 2];
            let body = &self.buf[self.start + 4..self.buf.len()];
            util::hmac_sha1(key, vec![header, &size_buf, body])?
        };

        let kind: u16 = AttrKind::MessageIntegrity.into();
        self.buf.extend_from_slice(&kind.to_be_bytes());
        self.buf.extend_from_slice(&20u16.to_be_bytes());
        self.buf.extend_from_slice(&digest);

        let final_len = (self.buf.len() - self.start - 20 + 8) as u16;
        self.buf[self.start + 2..self.start + 4].copy_from_slice(&final_len.to_be_bytes());

        let checksum = util::fingerprint(&self.buf[self.start..self.buf.len()]);
        let fp_kind: u16 = AttrKind::Fingerprint.into();
        self.buf.extend_from_slice(&fp_kind.to_be_bytes());
        self.buf.extend_from_slice(&4u16.to_be_bytes());
        self.buf.extend_from_slice(&checksum.to_be_bytes());

        let total_len = (self.buf.len() - self.start - 20) as u16;
        self.buf[self.start + 2..self.start + 4].copy_from_slice(&total_len.to_be_bytes());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::XorMappedAddress;
    use crate::reader::{ReaderState, StunReader};

    #[test]
    fn writer_reader_round_trip() {
        let token = [9u8; 12];
        let mut buf = BytesMut::new();

        let mut writer = MessageWriter::new(Kind::BindingResponse, &token, &mut buf);
        let addr = "203.0.113.5:40000".parse().unwrap();
        writer.append::<XorMappedAddress>(addr);
        writer.flush(None).unwrap();

        let mut reader = StunReader::new();
        assert_eq!(reader.add_bytes(&buf), ReaderState::BodyValidated);

        assert_eq!(reader.kind(), Some(Kind::BindingResponse));
        assert_eq!(reader.token(), &token);
        assert_eq!(reader.get::<XorMappedAddress>(&buf).unwrap().unwrap(), addr);
    }

    #[test]
    fn rejects_bad_cookie() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 1, 0, 0]);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.extend_from_slice(&[0u8; 12]);

        let mut reader = StunReader::new();
        assert_eq!(reader.add_bytes(&buf), ReaderState::Invalid);
    }
}
