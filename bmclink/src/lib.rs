//! Umbrella crate: the bmclink IPMI client stack.
//!
//! Re-exports the async client ([`client`]), the sans-IO protocol layer
//! ([`proto`]) and the crypto primitives ([`crypto`]). Most users only
//! need [`client::Session`] and [`client::Console`].

#![deny(unsafe_code)]

pub use bmclink_client as client;
pub use bmclink_crypto as crypto;
pub use bmclink_proto as proto;

pub use bmclink_client::{Console, ConsoleConfig, IpmiError, Session, SessionConfig};
