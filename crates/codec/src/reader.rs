use std::convert::TryFrom;

use anyhow::{ensure, Result};

use crate::attribute::{AttrKind, ErrorCode, ErrorCodeValue, Property};
use crate::message::Kind;
use crate::util;
use crate::Auth;

const COOKIE: [u8; 4] = 0x2112_a442u32.to_be_bytes();

/// Mirrors the original reader's terminal states: `Empty` before any bytes
/// have been fed, `BodyValidated` once header + attributes parsed cleanly,
/// `Invalid` if they didn't. The dispatch loop only ever acts on
/// `BodyValidated`; anything else means drop the datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Empty,
    BodyValidated,
    Invalid,
}

/// Reusable incremental reader: the sole STUN message parser in this crate.
/// Stores only byte offsets rather than borrowed slices, so one instance can
/// be kept per dispatch loop and reset across iterations without
/// reallocating its attribute index — the same role the original reader's
/// `Reset`/`AddBytes` pair played per receive.
pub struct StunReader {
    attributes: Vec<(AttrKind, usize, usize)>,
    state: ReaderState,
    kind: Option<Kind>,
    token: [u8; 12],
    valid_offset: usize,
}

impl Default for StunReader {
    fn default() -> Self {
        Self::new()
    }
}

impl StunReader {
    pub fn new() -> Self {
        Self {
            attributes: Vec::with_capacity(16),
            state: ReaderState::Empty,
            kind: None,
            token: [0u8; 12],
            valid_offset: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attributes.clear();
        self.state = ReaderState::Empty;
        self.kind = None;
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn kind(&self) -> Option<Kind> {
        self.kind
    }

    pub fn token(&self) -> &[u8; 12] {
        &self.token
    }

    /// Validates `buf` as a single complete STUN message and indexes its
    /// attributes. Always resets prior state first, matching `Reset` +
    /// `AddBytes` called back to back for one datagram.
    pub fn add_bytes(&mut self, buf: &[u8]) -> ReaderState {
        self.reset();

        match self.parse(buf) {
            Ok(()) => self.state = ReaderState::BodyValidated,
            Err(_) => self.state = ReaderState::Invalid,
        }

        self.state
    }

    fn parse(&mut self, buf: &[u8]) -> Result<()> {
        ensure!(buf.len() >= 20, "message shorter than STUN header");

        let kind = Kind::try_from(util::as_u16(&buf[0..2])).map_err(|_| anyhow::anyhow!("unknown kind"))?;
        let size = util::as_u16(&buf[2..4]) as usize;
        ensure!(buf[4..8] == COOKIE[..], "missing magic cookie");
        ensure!(buf.len() >= size + 20, "declared size overruns buffer");

        self.kind = Some(kind);
        self.token.copy_from_slice(&buf[8..20]);

        let mut offset = 20usize;
        let end = 20 + size;
        let mut valid_offset = end;
        let mut found_integrity = false;

        while end - offset >= 4 {
            let raw_kind = util::as_u16(&buf[offset..offset + 2]);
            let attr_len = util::as_u16(&buf[offset + 2..offset + 4]) as usize;
            offset += 4;

            if end - offset < attr_len {
                break;
            }

            if !found_integrity {
                valid_offset = offset - 4;
            }

            if raw_kind == AttrKind::MessageIntegrity as u16 {
                found_integrity = true;
            }

            if let Ok(attr_kind) = AttrKind::try_from(raw_kind) {
                self.attributes.push((attr_kind, offset, attr_len));
            }

            offset += attr_len + util::pad_size(attr_len);
        }

        self.valid_offset = valid_offset;
        Ok(())
    }

    /// Looks up an attribute by type, re-slicing it out of the caller's
    /// (still-alive) receive buffer.
    pub fn get<'a, T: Property<'a>>(&self, buf: &'a [u8]) -> Option<Result<T::Inner, T::Error>> {
        let kind = T::kind();
        self.attributes
            .iter()
            .find(|(k, _, _)| *k == kind)
            .map(|&(_, start, len)| T::try_from(&buf[start..start + len], &self.token))
    }

    pub fn error(&self, buf: &[u8]) -> Option<ErrorCodeValue> {
        self.get::<ErrorCode>(buf).and_then(|r| r.ok())
    }

    pub fn integrity(&self, buf: &[u8], auth: &Auth) -> Result<()> {
        use crate::attribute::MessageIntegrity;

        ensure!(self.valid_offset > 20, "no attributes precede MESSAGE-INTEGRITY");

        let integrity = self
            .get::<MessageIntegrity>(buf)
            .ok_or_else(|| anyhow::anyhow!("MESSAGE-INTEGRITY not present"))??;

        let size_buf = (self.valid_offset as u16 + 4 - 20).to_be_bytes();
        let body = vec![&buf[0..2], &size_buf[..], &buf[4..self.valid_offset]];
        let computed = util::hmac_sha1(auth, body)?;

        ensure!(integrity == computed, "MESSAGE-INTEGRITY mismatch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::XorMappedAddress;
    use crate::message::MessageWriter;
    use bytes::BytesMut;

    #[test]
    fn add_bytes_reaches_body_validated() {
        let token = [3u8; 12];
        let mut buf = BytesMut::new();
        let writer = MessageWriter::new(Kind::BindingRequest, &token, &mut buf);
        writer.flush(None).unwrap();

        let mut reader = StunReader::new();
        assert_eq!(reader.add_bytes(&buf), ReaderState::BodyValidated);
        assert_eq!(reader.kind(), Some(Kind::BindingRequest));
    }

    #[test]
    fn add_bytes_rejects_truncated_message() {
        let mut reader = StunReader::new();
        assert_eq!(reader.add_bytes(&[0u8; 4]), ReaderState::Invalid);
    }

    #[test]
    fn reused_reader_recovers_attribute_after_reset() {
        let token = [1u8; 12];
        let mut buf = BytesMut::new();
        let mut writer = MessageWriter::new(Kind::BindingResponse, &token, &mut buf);
        let addr = "198.51.100.7:5000".parse().unwrap();
        writer.append::<XorMappedAddress>(addr);
        writer.flush(None).unwrap();

        let mut reader = StunReader::new();
        reader.add_bytes(&buf);
        reader.add_bytes(&buf);

        assert_eq!(reader.get::<XorMappedAddress>(&buf).unwrap().unwrap(), addr);
    }
}
