//! Inner IPMI message framing and request/response correlation.
//!
//! A LAN request body (figure 13-4) is:
//!
//! ```text
//! rsaddr  netfn<<2|rslun  csum  rqaddr  seqlun<<2|rqlun  cmd  data…  csum
//! ```
//!
//! Each sent request records the triple (netfn+1, seqlun, cmd); a reply is
//! only delivered if it matches a recorded triple, and consumes it.

use bmclink_crypto::checksum;

use crate::codes;
use crate::session::{RequestEntry, SessionState};

/// The BMC's responder address on the system interface.
pub const BMC_ADDRESS: u8 = 0x20;
/// Our software id (table 5-4 allows 0x81–0x8D; 0x81 is customary).
pub const REMOTE_SWID: u8 = 0x81;
/// Application netfn.
pub const NETFN_APP: u8 = 0x06;
/// Send Message, the single-hop bridge wrapper.
pub const SEND_MESSAGE_CMD: u8 = 0x34;

/// A parsed IPMI command response.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// Response netfn (request netfn + 1).
    pub netfn: u8,
    /// Echoed command.
    pub command: u8,
    /// Completion code; 0 is success.
    pub code: u8,
    /// Response data after the completion code.
    pub data: Vec<u8>,
}

impl Response {
    /// Completion-code text, `None` on success.
    pub fn error_text(&self) -> Option<String> {
        if self.code == 0 {
            None
        } else {
            Some(codes::completion_text_or_unknown(self.code))
        }
    }
}

/// Target of a bridged request: a controller behind an IPMB channel.
#[derive(Clone, Copy, Debug)]
pub struct BridgeTarget {
    /// Slave address of the target controller.
    pub addr: u8,
    /// Channel number to route through.
    pub channel: u8,
}

/// A request ready for the session layer, with its recorded entries.
pub struct BuiltRequest {
    /// The inner IPMI payload.
    pub payload: Vec<u8>,
    /// Triples recorded for reply correlation (two for bridged requests).
    pub entries: Vec<RequestEntry>,
}

/// Build a request, allocating a seqlun and recording correlation entries.
pub fn build_request(
    state: &mut SessionState,
    netfn: u8,
    command: u8,
    data: &[u8],
    bridge: Option<BridgeTarget>,
    rslun: u8,
) -> BuiltRequest {
    let seqlun = state.allocate_seqlun(netfn, command);
    let rqlun = state.rqlun;
    let mut entries = Vec::with_capacity(2);

    let (rsaddr, rqaddr, mut payload) = match bridge {
        Some(target) => {
            // Send Message envelope addressed to the BMC itself.
            let head = [BMC_ADDRESS, NETFN_APP << 2];
            let mut wrapper = head.to_vec();
            wrapper.push(checksum(&head));
            wrapper.extend_from_slice(&[
                REMOTE_SWID,
                (seqlun << 2) | rqlun,
                SEND_MESSAGE_CMD,
                0x40 | target.channel,
            ]);
            entries.push((NETFN_APP + 1, seqlun, SEND_MESSAGE_CMD));
            (target.addr, BMC_ADDRESS, wrapper)
        }
        None => (BMC_ADDRESS, REMOTE_SWID, Vec::new()),
    };

    let header = [rsaddr, (netfn << 2) | rslun];
    let mut body = vec![rqaddr, (seqlun << 2) | rqlun, command];
    body.extend_from_slice(data);

    payload.extend_from_slice(&header);
    payload.push(checksum(&header));
    payload.extend_from_slice(&body);
    payload.push(checksum(&body));
    if bridge.is_some() {
        // The bridged message carries its own trailing checksum.
        let tail = checksum(&payload[3..]);
        payload.push(tail);
    }

    entries.push((netfn + 1, seqlun, command));
    for entry in &entries {
        state.add_request_entry(*entry);
    }
    BuiltRequest { payload, entries }
}

/// What an inbound IPMI payload turned out to be.
pub enum Dispatch {
    /// Not a reply to anything outstanding; drop it.
    Unmatched,
    /// The outer hop of a bridged request succeeded; the real reply follows.
    BridgeConfirmed,
    /// A delivered response. The seqlun has advanced for the next request.
    Response(Response),
}

/// Correlate an inbound IPMI payload with the outstanding requests.
pub fn dispatch(state: &mut SessionState, payload: &[u8]) -> Dispatch {
    if payload.len() < 7 {
        // Too short to be an IPMI response; buggy-BMC noise.
        return Dispatch::Unmatched;
    }
    let entry = (payload[1] >> 2, payload[4] >> 2, payload[5]);
    if !state.take_request_entry(entry) {
        return Dispatch::Unmatched;
    }

    // The first response to a bridged request only confirms the outer hop.
    // Its final data byte is the Send Message completion code.
    if (entry.0 == NETFN_APP + 1 || entry.0 == NETFN_APP)
        && entry.2 == SEND_MESSAGE_CMD
        && payload[payload.len() - 2] == 0
    {
        return Dispatch::BridgeConfirmed;
    }

    let response = Response {
        netfn: payload[1] >> 2,
        command: payload[5],
        code: payload[6],
        data: payload[7..payload.len() - 1].to_vec(),
    };
    // A failed bridge wrapper leaves the inner entry dangling; both members
    // of the pair share the seqlun.
    let seqlun = entry.1;
    state.purge_seqlun(seqlun);
    state.advance_seqlun();
    Dispatch::Response(response)
}
