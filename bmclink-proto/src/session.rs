//! Per-session counters and request bookkeeping.

use std::collections::HashMap;

/// Number of retry rounds a (netfn, command, seqlun) triple stays taboo
/// after an ambiguous retransmit.
const TABOO_ROUNDS: u8 = 16;

/// Login phase of the session state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Context {
    /// Nothing negotiated yet; next step is the auth-cap probe.
    Initial,
    /// RMCP+ Open Session Request sent.
    OpenSession,
    /// RAKP1 sent, waiting on RAKP2.
    ExpectingRakp2,
    /// RAKP3 sent, waiting on RAKP4.
    ExpectingRakp4,
    /// Key exchange complete; session packets flow.
    Established,
    /// Login failed terminally.
    Failed,
}

/// A recorded outstanding request: (expected response netfn, seqlun, command).
pub type RequestEntry = (u8, u8, u8);

/// Tracks the counters every IPMI session carries.
///
/// Cheap to create; [`SessionState::reset`] rewinds it for a fresh login
/// attempt (the handshake must restart from scratch rather than retransmit
/// RAKP messages).
#[derive(Debug)]
pub struct SessionState {
    /// Login phase.
    pub context: Context,
    /// Our session id. Seeded so a hexdump of the open request is
    /// recognizable, bumped per open attempt to shake off stale replies.
    pub localsid: u32,
    /// Remote-assigned session id (0 until granted).
    pub session_id: u32,
    /// Session id offered in the RMCP+ open response, committed at RAKP4.
    pub pending_session_id: u32,
    /// Outbound session sequence number.
    pub sequence: u32,
    /// Highest remote sequence number seen.
    pub remote_sequence: Option<u32>,
    /// RMCP+ message tag, advanced per login-phase request.
    pub rmcptag: u8,
    /// 6-bit IPMI sequence number (upper bits of the seq/lun byte).
    pub seqlun: u8,
    /// Requester LUN.
    pub rqlun: u8,
    /// 1.5 authtype currently in force (0 none, 2 MD5, 6 RMCP+).
    pub authtype: u8,
    /// Outstanding request entries, consumed by matching replies.
    entries: Vec<RequestEntry>,
    /// Retried triples that must not be reused for a while.
    taboo: HashMap<(u8, u8, u8), u8>,
}

impl SessionState {
    /// Fresh state for a new connection.
    pub fn new() -> Self {
        Self {
            context: Context::Initial,
            localsid: 2017673555,
            session_id: 0,
            pending_session_id: 0,
            sequence: 0,
            remote_sequence: None,
            rmcptag: 1,
            seqlun: 0,
            rqlun: 0,
            authtype: 0,
            entries: Vec::new(),
            taboo: HashMap::new(),
        }
    }

    /// Rewind everything but `localsid` for a new login attempt.
    pub fn reset(&mut self) {
        self.context = Context::Initial;
        self.session_id = 0;
        self.pending_session_id = 0;
        self.sequence = 0;
        self.remote_sequence = None;
        self.seqlun = 0;
        self.authtype = 0;
        self.entries.clear();
        self.taboo.clear();
    }

    /// Bump and return the RMCP+ tag for the next login-phase payload.
    pub fn next_tag(&mut self) -> u8 {
        self.rmcptag = self.rmcptag.wrapping_add(1);
        self.rmcptag
    }

    /// Sequence number to stamp on the next transmitted packet.
    ///
    /// Zero is special (pre-session) and stays put; otherwise the counter
    /// advances after use, so established-session packets are strictly
    /// increasing.
    pub fn next_xmit_sequence(&mut self) -> u32 {
        let seq = self.sequence;
        if self.sequence != 0 {
            self.sequence = self.sequence.wrapping_add(1);
        }
        seq
    }

    /// Accept or reject a remote sequence number.
    ///
    /// Numbers must be monotonically non-decreasing, with a rollover
    /// allowance once the remote side saturates at `0xFFFFFFFF`.
    pub fn accept_remote_sequence(&mut self, seq: u32) -> bool {
        if let Some(last) = self.remote_sequence {
            if seq < last && last != 0xffff_ffff {
                return false;
            }
        }
        self.remote_sequence = Some(seq);
        true
    }

    /// Pick the seqlun for the next request, skipping taboo slots.
    ///
    /// The IPMI spec forbids gaps larger than 7, so after 7 skips the taboo
    /// is risked rather than the rule violated.
    pub fn allocate_seqlun(&mut self, netfn: u8, command: u8) -> u8 {
        let mut hops = 7;
        while hops > 0 {
            match self.taboo.get_mut(&(netfn, command, self.seqlun)) {
                Some(rounds) if *rounds > 0 => {
                    *rounds -= 1;
                    self.seqlun = (self.seqlun + 1) & 0x3f;
                    hops -= 1;
                }
                _ => break,
            }
        }
        self.seqlun
    }

    /// Advance seqlun after a completed exchange.
    pub fn advance_seqlun(&mut self) {
        self.seqlun = (self.seqlun + 1) & 0x3f;
    }

    /// Mark a retried triple taboo for the next [`TABOO_ROUNDS`] rounds.
    pub fn mark_taboo(&mut self, netfn: u8, command: u8, seqlun: u8) {
        self.taboo.insert((netfn, command, seqlun), TABOO_ROUNDS);
    }

    /// Record an outstanding request entry (idempotent).
    pub fn add_request_entry(&mut self, entry: RequestEntry) {
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    /// Consume a request entry if the reply matches one.
    pub fn take_request_entry(&mut self, entry: RequestEntry) -> bool {
        match self.entries.iter().position(|e| *e == entry) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Drop a specific entry without requiring a match (bridged cleanup).
    pub fn remove_request_entry(&mut self, entry: RequestEntry) {
        self.entries.retain(|e| *e != entry);
    }

    /// Drop every entry using the given seqlun. A bridged request records
    /// two entries on one seqlun; a surfaced wrapper error orphans the
    /// inner one.
    pub fn purge_seqlun(&mut self, seqlun: u8) {
        self.entries.retain(|e| e.1 != seqlun);
    }

    /// Whether any request entries remain outstanding.
    pub fn has_request_entries(&self) -> bool {
        !self.entries.is_empty()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
