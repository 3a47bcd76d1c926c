//! STUN wire codec: message kinds, attributes and the incremental reader/writer
//! used by the dispatch core. This crate knows nothing about sockets, roles or
//! threads — it only turns bytes into typed attributes and back.

pub mod attribute;
pub mod message;
pub mod reader;
pub mod util;

pub use attribute::{AttrKind, Property};
pub use message::{Kind, MessageWriter};
pub use reader::{ReaderState, StunReader};

/// Long-term-credential key material: `MD5(username ":" realm ":" password)`.
pub type Auth = [u8; 16];
