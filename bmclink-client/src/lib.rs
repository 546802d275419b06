//! # bmclink-client
//!
//! Async IPMI client over RMCP+.
//!
//! ## Features
//! - IPMI 2.0 login (RAKP, cipher suites 3 and 17) with automatic SHA-1
//!   and privilege-level downgrade, IPMI 1.5 MD5 fallback
//! - Raw commands with retry, bridged (Send Message) requests
//! - Serial-over-LAN console with break, remote dedup and retransmit
//! - SDR reader with reservation-guarded chunking and two cache tiers
//! - Shared UDP sockets: 64 BMCs to a file handle
//!
//! ```rust,no_run
//! use bmclink_client::{Session, SessionConfig};
//!
//! # async fn demo() -> Result<(), bmclink_client::IpmiError> {
//! let mut session = Session::connect(SessionConfig::new(
//!     "10.0.0.7", "admin", "secret",
//! )).await?;
//! let device = session.raw_command(0x06, 0x01, &[]).await?;
//! println!("device id: {:02x?}", device.data);
//! session.logout().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

mod console;
mod errors;
mod reactor;
mod sdr;
mod session;

pub use console::{Console, ConsoleConfig, ConsoleEvent, ServerConsole};
pub use errors::IpmiError;
pub use reactor::{Reactor, MAX_BMCS_PER_SOCKET};
pub use sdr::{read_sensor, SdrRepository};
pub use session::{
    CommandOpts, KeepaliveId, KeepaliveRequest, Session, SessionConfig, DEFAULT_PORT,
};

pub use bmclink_proto::message::{BridgeTarget, Response};
