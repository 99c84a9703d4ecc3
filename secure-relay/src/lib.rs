//! Encrypted chat relay.
//!
//! A server hands every connecting peer its RSA public key, receives an
//! RSA-wrapped AES session key plus a display name, and from then on relays
//! chat lines between peers, re-encrypting each line under every
//! recipient's own session key.
//!
//! - [`crypto`] holds the RSA, AES and base64 primitives.
//! - [`handshake`] runs the key exchange on both ends of a connection.
//! - [`transport`] frames encrypted lines over any async byte stream.
//! - [`registry`] tracks live connections and fans out broadcasts.
//! - [`server`] accepts TCP connections and drives each peer's lifecycle.
//! - [`client`] is the terminal client.
//! - [`protocol`] names the wire markers; [`config`] and [`cli`] cover startup.
//!
//! The session cipher is AES-ECB: deterministic and unauthenticated, and the
//! relay's public key is trusted on first use. Neither is suitable where an
//! active attacker is expected.

pub mod cli;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;

pub use error::{RelayError, RelayResult};
