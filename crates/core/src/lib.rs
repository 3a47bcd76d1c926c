//! Dispatch core for a STUN behavior-discovery server: the role/endpoint
//! matrix, socket set, rate limiter, dispatch loop, request handler adapter
//! and server supervisor. Everything here is plain OS threads and blocking
//! syscalls — no async runtime.

pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod rate_limiter;
pub mod role;
pub mod socket_set;
pub mod supervisor;

pub use endpoint::{Endpoint, TransportAddressSet};
pub use error::{CoreError, HandlerError};
pub use handler::{Authenticator, NoopAuthenticator, RequestHandler, StunMessageIn, StunMessageOut};
pub use rate_limiter::RateLimiter;
pub use role::Role;
pub use socket_set::{SocketSet, Transport};
pub use supervisor::{ServerConfig, Supervisor};
