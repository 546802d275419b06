//! IPMI session-layer protocol, sans IO.
//!
//! This crate handles:
//! * RMCP / RMCP+ packet framing (integrity, confidentiality, sequencing)
//! * The RAKP 1–4 authenticated key exchange
//! * IPMI inner-message framing and request/response correlation
//! * The Serial-over-LAN payload engine
//! * SDR record decoding
//!
//! It is intentionally transport-agnostic: bring your own UDP socket.
//! [`bmclink-client`](https://docs.rs/bmclink-client) drives it over tokio.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod codes;
pub mod message;
pub mod packet;
pub mod rakp;
pub mod sdr;
pub mod session;
pub mod sol;

pub use message::Response;
pub use packet::PayloadType;
pub use session::SessionState;
pub use sol::SolEngine;
