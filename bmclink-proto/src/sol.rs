//! Serial-over-LAN payload engine.
//!
//! SOL rides payload type 1 as an ordered, acknowledged byte stream with at
//! most one frame in flight per direction. Frame layout:
//!
//! ```text
//! byte 0: packet sequence (low 4 bits, 0 = ack-only)
//! byte 1: acked sequence  (0 when not acking)
//! byte 2: accepted character count
//! byte 3: operation/status bits (0x10 break, 0x40 NACK, 0x20 powered off,
//!         0x10 deactivated on inbound status, 0x04 break detected)
//! byte 4…: character data
//! ```
//!
//! The engine is sans-IO: [`SolEngine::handle_inbound`] returns everything
//! the caller must do (deliver bytes, transmit an ack, resend) and the
//! caller owns timers and the wire.

use std::collections::VecDeque;

/// Server-role default transmit limit before activation negotiates one.
pub const DEFAULT_MAX_OUTBOUND: usize = 256;

/// One element of the pending-output queue. Break markers never merge with
/// byte chunks.
#[derive(Clone, Debug, PartialEq)]
pub enum OutItem {
    /// Console bytes, coalesced on append.
    Bytes(Vec<u8>),
    /// A serial break.
    Break,
}

/// A frame to transmit, with its session-layer keepalive hint.
#[derive(Clone, Debug, PartialEq)]
pub struct Outgoing {
    /// The SOL frame.
    pub payload: Vec<u8>,
    /// True for zero-character frames, which the BMC does not count as
    /// activity; the session must keep its own keepalive running.
    pub needs_keepalive: bool,
}

/// Remote-side conditions reported while processing an inbound frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SolEvent {
    /// The managed system reports itself powered down (informational).
    PoweredDown,
    /// The BMC deactivated the SOL payload; the console is dead.
    Deactivated,
}

/// Everything an inbound frame asks of the IO driver.
#[derive(Debug, Default, PartialEq)]
pub struct Actions {
    /// Deduplicated console bytes for the caller, in order.
    pub deliver: Vec<u8>,
    /// Ack frame to transmit (never retried).
    pub ack: Option<Vec<u8>>,
    /// Immediate retransmit of the in-flight frame (defensive path for
    /// BMCs that ack with a foreign sequence while we wait).
    pub resend: Option<Outgoing>,
    /// Status conditions to surface.
    pub events: Vec<SolEvent>,
    /// The in-flight frame was acked; the caller should pull
    /// [`SolEngine::next_outbound`].
    pub ready_to_send: bool,
}

/// Sequencing, dedup and retransmit state for one SOL conversation.
#[derive(Debug)]
pub struct SolEngine {
    myseq: u8,
    remseq: u8,
    lastsize: usize,
    awaiting_ack: bool,
    last_payload: Option<Vec<u8>>,
    last_text_size: usize,
    pending: VecDeque<OutItem>,
    /// Negotiated per-frame character limit.
    pub max_outbound: usize,
    server: bool,
    /// Server role: whether the host is powered on (drives ack flags).
    pub powered_on: bool,
    /// Whether the payload is still active.
    pub activated: bool,
}

impl SolEngine {
    /// Client-role engine with the activation-negotiated transmit limit.
    pub fn new(max_outbound: usize) -> Self {
        Self {
            myseq: 0,
            remseq: 0,
            lastsize: 0,
            awaiting_ack: false,
            last_payload: None,
            last_text_size: 0,
            pending: VecDeque::new(),
            max_outbound,
            server: false,
            powered_on: true,
            activated: true,
        }
    }

    /// Server-role engine (ack flags reflect power and activation state).
    pub fn server() -> Self {
        let mut engine = Self::new(DEFAULT_MAX_OUTBOUND);
        engine.server = true;
        engine
    }

    /// Whether a frame is in flight awaiting its ack.
    pub fn awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    /// Whether anything is queued for transmit.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Queue console bytes, coalescing with a trailing byte chunk.
    pub fn queue_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(OutItem::Bytes(chunk)) = self.pending.back_mut() {
            chunk.extend_from_slice(data);
            return;
        }
        self.pending.push_back(OutItem::Bytes(data.to_vec()));
    }

    /// Queue a serial break. Breaks are sent alone, never merged.
    pub fn queue_break(&mut self) {
        self.pending.push_back(OutItem::Break);
    }

    /// Build the next frame from the queue, if nothing is in flight.
    ///
    /// Byte chunks are clipped to `max_outbound` with the remainder left
    /// queued. The frame stays retrievable via [`SolEngine::retry_payload`]
    /// until acked.
    pub fn next_outbound(&mut self) -> Option<Outgoing> {
        if self.awaiting_ack {
            return None;
        }
        let (chunk, send_break) = match self.pending.pop_front()? {
            OutItem::Break => (Vec::new(), true),
            OutItem::Bytes(mut bytes) => {
                if bytes.len() > self.max_outbound {
                    let rest = bytes.split_off(self.max_outbound);
                    self.pending.push_front(OutItem::Bytes(rest));
                }
                (bytes, false)
            }
        };

        self.myseq = (self.myseq + 1) & 0xf;
        if self.myseq == 0 {
            self.myseq = 1;
        }
        let mut payload = vec![self.myseq, 0, 0, if send_break { 0b1_0000 } else { 0 }];
        payload.extend_from_slice(&chunk);
        self.last_text_size = chunk.len();
        self.awaiting_ack = true;
        self.last_payload = Some(payload.clone());
        Some(Outgoing {
            payload,
            needs_keepalive: self.last_text_size == 0,
        })
    }

    /// The in-flight frame for timer-driven retransmission.
    pub fn retry_payload(&self) -> Option<Outgoing> {
        if !self.awaiting_ack {
            return None;
        }
        self.last_payload.as_ref().map(|p| Outgoing {
            payload: p.clone(),
            needs_keepalive: self.last_text_size == 0,
        })
    }

    fn ack_flags(&self) -> u8 {
        if !self.server {
            return 0;
        }
        let mut flags = 0;
        if !self.powered_on {
            flags |= 0b110_0000;
        }
        if !self.activated {
            flags |= 0b101_0000;
        }
        flags
    }

    /// Absorb an inbound SOL frame.
    ///
    /// Client drivers process `deliver` before `ack`; the server role acks
    /// first, as a BMC would.
    pub fn handle_inbound(&mut self, payload: &[u8]) -> Actions {
        let mut actions = Actions::default();
        if payload.len() < 4 {
            return actions;
        }
        let newseq = payload[0] & 0xf;
        let ackseq = payload[1] & 0xf;
        let ackcount = payload[2] as usize;
        let nacked = payload[3] & 0b100_0000 != 0;
        let poweredoff = payload[3] & 0b10_0000 != 0;
        let deactivated = payload[3] & 0b1_0000 != 0;
        let breakdetected = payload[3] & 0b100 != 0;

        if newseq != 0 {
            let data = &payload[4..];
            let remdatalen = data.len();
            if newseq == self.remseq {
                // A retry, possibly carrying new trailing bytes; ack the
                // whole length but deliver only the unseen tail.
                if remdatalen > self.lastsize {
                    actions.deliver = data[self.lastsize..].to_vec();
                }
            } else {
                self.remseq = newseq;
                actions.deliver = data.to_vec();
            }
            self.lastsize = remdatalen;
            actions.ack = Some(vec![
                0,
                self.remseq,
                remdatalen as u8,
                self.ack_flags(),
            ]);
        }

        if self.myseq != 0 && ackseq == self.myseq {
            self.awaiting_ack = false;
            if nacked && !breakdetected {
                if poweredoff {
                    actions.events.push(SolEvent::PoweredDown);
                }
                if deactivated {
                    self.activated = false;
                    actions.events.push(SolEvent::Deactivated);
                } else if let Some(last) = &self.last_payload {
                    // Requeue whatever the BMC did not accept, ahead of any
                    // newly queued output.
                    let start = (4 + ackcount).min(last.len());
                    let tail = last[start..].to_vec();
                    if !tail.is_empty() {
                        self.prepend(tail);
                    }
                }
            }
            actions.ready_to_send = true;
        } else if ackseq != 0 && self.awaiting_ack {
            actions.resend = self.retry_payload();
        }
        actions
    }

    /// Current local sequence number (0 before the first transmit).
    pub fn myseq(&self) -> u8 {
        self.myseq
    }

    fn prepend(&mut self, mut bytes: Vec<u8>) {
        if let Some(OutItem::Bytes(front)) = self.pending.front_mut() {
            bytes.append(front);
            *front = bytes;
            return;
        }
        self.pending.push_front(OutItem::Bytes(bytes));
    }
}

/// Negotiated parameters from a successful Activate Payload response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ActivationInfo {
    /// Largest character count the BMC accepts per frame.
    pub max_outbound: usize,
    /// UDP port the BMC will use, as the wire bytes give it.
    pub port: u16,
}

/// Extract the transmit limit and port from Activate Payload response data.
pub fn parse_activation(data: &[u8]) -> Option<ActivationInfo> {
    if data.len() < 10 {
        return None;
    }
    Some(ActivationInfo {
        max_outbound: u16::from_le_bytes(data[4..6].try_into().unwrap()) as usize,
        port: u16::from_le_bytes(data[8..10].try_into().unwrap()),
    })
}
