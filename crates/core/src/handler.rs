use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;
use bytes::BytesMut;
use stun_server_codec::attribute::{
    ChangeRequest, ChangeRequestFlags, ChangedAddress, ErrorCode, ErrorKind, MappedAddress, Nonce, OtherAddress,
    Realm, ResponseOrigin, UserName, XorMappedAddress,
};
use stun_server_codec::message::{Kind, MessageWriter};
use stun_server_codec::reader::{ReaderState, StunReader};
use stun_server_codec::util::long_key;

use crate::endpoint::TransportAddressSet;
use crate::error::HandlerError;
use crate::role::Role;

/// External collaborator consulted for long-term-credential password
/// lookup. The adapter never stores or validates credentials itself — it
/// only asks "do you know this username" and, if so, signs/verifies with
/// the returned password.
pub trait Authenticator: Send + Sync {
    fn get_password(&self, username: &str) -> Option<String>;
    fn realm(&self) -> &str;
}

/// Used when no credential table is configured. Binding requests without
/// `USERNAME`/`MESSAGE-INTEGRITY` never consult it at all — Binding is a
/// discovery operation, not a privileged one, per RFC 5389.
pub struct NoopAuthenticator;

impl Authenticator for NoopAuthenticator {
    fn get_password(&self, _username: &str) -> Option<String> {
        None
    }

    fn realm(&self) -> &str {
        ""
    }
}

/// One inbound datagram, already validated by the wire reader and enriched
/// with the role it arrived on and the ancillary-recovered local address.
pub struct StunMessageIn<'a> {
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub role: Role,
    pub reader: &'a StunReader,
    pub raw: &'a [u8],
}

/// Outcome of a successful adapter call: which socket to send from, where
/// to send it, and the finished wire bytes.
pub struct StunMessageOut {
    pub send_role: Role,
    pub dest: SocketAddr,
    pub bytes: BytesMut,
}

static NONCE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn fresh_nonce() -> String {
    let counter = NONCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let hash = RandomState::with_seeds(1, 2, 3, 4).hash_one(counter);
    format!("{hash:016x}")
}

/// Stateless adapter: `(msg_in, tsa, auth) -> msg_out`. Holds no state of
/// its own; all scratch space (the output buffer) is caller-provided.
pub struct RequestHandler;

impl RequestHandler {
    pub fn process(
        msg_in: &StunMessageIn,
        tsa: &TransportAddressSet,
        auth: &dyn Authenticator,
        out_buf: &mut BytesMut,
    ) -> Result<StunMessageOut, HandlerError> {
        debug_assert_eq!(msg_in.reader.state(), ReaderState::BodyValidated);

        match msg_in.reader.kind() {
            Some(Kind::BindingRequest) => Self::binding(msg_in, tsa, auth, out_buf),
            Some(Kind::SharedSecretRequest) => Self::shared_secret_unsupported(msg_in, out_buf),
            _ => Err(HandlerError::UnsupportedMethod),
        }
    }

    fn binding(
        msg_in: &StunMessageIn,
        tsa: &TransportAddressSet,
        auth: &dyn Authenticator,
        out_buf: &mut BytesMut,
    ) -> Result<StunMessageOut, HandlerError> {
        let flags = msg_in
            .reader
            .get::<ChangeRequest>(msg_in.raw)
            .and_then(Result::ok)
            .unwrap_or(ChangeRequestFlags {
                change_ip: false,
                change_port: false,
            });

        let send_role = msg_in.role.toggle(flags.change_ip, flags.change_port);
        let send_endpoint = tsa.lookup(send_role);

        if !send_endpoint.valid {
            let token = *msg_in.reader.token();
            let mut writer = MessageWriter::new(Kind::BindingError, &token, out_buf);
            writer.append::<ErrorCode>(ErrorKind::BadRequest.into());
            writer
                .flush(None)
                .map_err(|_| HandlerError::Declined(ErrorKind::BadRequest as u16))?;

            return Ok(StunMessageOut {
                send_role: msg_in.role,
                dest: msg_in.remote,
                bytes: std::mem::take(out_buf),
            });
        }

        let username = msg_in.reader.get::<UserName>(msg_in.raw).and_then(Result::ok);

        if let Some(username) = username {
            if let Some(password) = auth.get_password(username) {
                let key = long_key(username, &password, auth.realm());
                if msg_in.reader.integrity(msg_in.raw, &key).is_err() {
                    return Ok(Self::unauthorized(msg_in, auth, out_buf));
                }

                return Ok(Self::success(msg_in, tsa, send_role, out_buf, Some(&key)));
            }

            return Ok(Self::unauthorized(msg_in, auth, out_buf));
        }

        Ok(Self::success(msg_in, tsa, send_role, out_buf, None))
    }

    fn success(
        msg_in: &StunMessageIn,
        tsa: &TransportAddressSet,
        send_role: Role,
        out_buf: &mut BytesMut,
        auth_key: Option<&[u8; 16]>,
    ) -> StunMessageOut {
        let token = *msg_in.reader.token();
        let send_endpoint = tsa.lookup(send_role);

        let mut writer = MessageWriter::new(Kind::BindingResponse, &token, out_buf);
        writer.append::<XorMappedAddress>(msg_in.remote);
        writer.append::<MappedAddress>(msg_in.remote);
        writer.append::<ResponseOrigin>(send_endpoint.advertised_addr());

        if !tsa.is_basic_mode() {
            let other_role = msg_in.role.toggle(true, true);
            let other_addr = tsa.lookup(other_role).advertised_addr();
            writer.append::<OtherAddress>(other_addr);
            writer.append::<ChangedAddress>(other_addr);
        }

        writer.flush(auth_key).expect("writer flush is infallible for well-formed attributes");

        StunMessageOut {
            send_role,
            dest: msg_in.remote,
            bytes: std::mem::take(out_buf),
        }
    }

    fn unauthorized(msg_in: &StunMessageIn, auth: &dyn Authenticator, out_buf: &mut BytesMut) -> StunMessageOut {
        let token = *msg_in.reader.token();
        let nonce = fresh_nonce();
        let mut writer = MessageWriter::new(Kind::BindingError, &token, out_buf);
        writer.append::<ErrorCode>(ErrorKind::Unauthorized.into());
        writer.append::<Realm>(auth.realm());
        writer.append::<Nonce>(&nonce);
        writer.flush(None).expect("writer flush is infallible for well-formed attributes");

        StunMessageOut {
            send_role: msg_in.role,
            dest: msg_in.remote,
            bytes: std::mem::take(out_buf),
        }
    }

    /// RFC 3489 shared-secret bootstrap requires a TLS channel, which is out
    /// of scope; answer deterministically instead of timing the client out.
    fn shared_secret_unsupported(msg_in: &StunMessageIn, out_buf: &mut BytesMut) -> Result<StunMessageOut, HandlerError> {
        let token = *msg_in.reader.token();
        let mut writer = MessageWriter::new(Kind::SharedSecretError, &token, out_buf);
        writer.append::<ErrorCode>(ErrorKind::ServerError.into());
        writer
            .flush(None)
            .map_err(|_| HandlerError::Declined(ErrorKind::ServerError as u16))?;

        Ok(StunMessageOut {
            send_role: msg_in.role,
            dest: msg_in.remote,
            bytes: std::mem::take(out_buf),
        })
    }
}
