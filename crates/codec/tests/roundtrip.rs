use bytes::BytesMut;
use stun_server_codec::attribute::{Realm, UserName, XorMappedAddress};
use stun_server_codec::message::{Kind, MessageWriter};
use stun_server_codec::reader::{ReaderState, StunReader};
use stun_server_codec::util::long_key;

#[test]
fn signed_response_verifies_with_matching_credentials() {
    let token = [5u8; 12];
    let key = long_key("alice", "hunter2", "example.org");

    let mut buf = BytesMut::new();
    let mut writer = MessageWriter::new(Kind::BindingResponse, &token, &mut buf);
    let addr = "203.0.113.9:51000".parse().unwrap();
    writer.append::<XorMappedAddress>(addr);
    writer.append::<UserName>("alice");
    writer.append::<Realm>("example.org");
    writer.flush(Some(&key)).unwrap();

    let mut reader = StunReader::new();
    assert_eq!(reader.add_bytes(&buf), ReaderState::BodyValidated);

    assert_eq!(reader.get::<XorMappedAddress>(&buf).unwrap().unwrap(), addr);
    reader.integrity(&buf, &key).expect("integrity must verify with the signing key");
}

#[test]
fn signed_response_rejects_wrong_key() {
    let token = [6u8; 12];
    let signing_key = long_key("alice", "hunter2", "example.org");
    let wrong_key = long_key("alice", "wrong-password", "example.org");

    let mut buf = BytesMut::new();
    let mut writer = MessageWriter::new(Kind::BindingResponse, &token, &mut buf);
    writer.append::<UserName>("alice");
    writer.flush(Some(&signing_key)).unwrap();

    let mut reader = StunReader::new();
    reader.add_bytes(&buf);

    assert!(reader.integrity(&buf, &wrong_key).is_err());
}

#[test]
fn zero_byte_message_is_rejected() {
    let mut reader = StunReader::new();
    assert_eq!(reader.add_bytes(&[]), ReaderState::Invalid);
}
