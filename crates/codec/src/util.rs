use anyhow::Result;
use hmac::{Hmac, Mac};

/// Number of padding bytes needed so `size` rounds up to a 4-byte boundary.
pub fn pad_size(size: usize) -> usize {
    (4 - (size % 4)) % 4
}

/// `MD5(username ":" realm ":" password)`, the long-term credential key used
/// by both MESSAGE-INTEGRITY signing and verification.
pub fn long_key(username: &str, key: &str, realm: &str) -> [u8; 16] {
    let text = [username, realm, key].join(":");
    md5::compute(text.as_bytes()).0
}

/// HMAC-SHA1 over the concatenation of `source`, keyed by `key`.
pub fn hmac_sha1(key: &[u8], source: Vec<&[u8]>) -> Result<[u8; 20]> {
    let mut mac = <Hmac<sha1::Sha1> as Mac>::new_from_slice(key)?;
    for part in source {
        mac.update(part);
    }

    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// CRC32/ISO-HDLC of `buffer`, XORed with the STUN FINGERPRINT magic.
pub fn fingerprint(buffer: &[u8]) -> u32 {
    const FINGERPRINT_XOR: u32 = 0x5354_554e;
    let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    crc.checksum(buffer) ^ FINGERPRINT_XOR
}

pub fn as_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

pub fn as_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_size_rounds_to_four() {
        assert_eq!(pad_size(0), 0);
        assert_eq!(pad_size(1), 3);
        assert_eq!(pad_size(4), 0);
        assert_eq!(pad_size(5), 3);
    }

    #[test]
    fn long_key_is_stable() {
        let a = long_key("panda", "panda", "raspberry");
        let b = long_key("panda", "panda", "raspberry");
        assert_eq!(a, b);
    }
}
