//! Sans-IO RMCP+ session establishment: Open Session plus RAKP 1–4.
//!
//! # Flow
//!
//! ```text
//! let payload = rakp::open_session(localsid, tag, HashAlg::Sha256);
//! // send as PayloadType::OpenSessionRequest, receive response body
//! let opened  = rakp::handle_open_session_response(&body, tag, localsid)?;
//! let (payload, s1) = rakp::rakp1(tag, &auth);
//! // send as PayloadType::Rakp1, receive RAKP2 body
//! let verified = rakp::handle_rakp2(&body, &auth, &s1)?;
//! let payload  = rakp::rakp3(tag3, &auth, &verified);
//! // send as PayloadType::Rakp3, receive RAKP4 body
//! rakp::handle_rakp4(&body, &auth, &s1, &verified, tag3)?;
//! ```
//!
//! Every `handle_*` returns `Ok(None)` for packets that must be silently
//! ignored (stale tag, foreign session id, superseded attempt) so retry
//! logic upstream keeps working.

use std::fmt;

use bmclink_crypto::{hmac, hmac_trunc, HashAlg, SessionKeys};

use crate::codes::rmcp_status_text_or_unknown;

/// User-name-only lookup flag ORed with the requested privilege in RAKP1.
pub const NAMEONLY_LOOKUP: u8 = 0x10;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Terminal failures of the key exchange.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// RAKP2's HMAC did not verify: the BMC and we disagree on the password.
    IncorrectPassword,
    /// RAKP4's integrity code did not verify against the SIK.
    Rakp4Integrity,
    /// Nonzero RMCP+ status in RAKP2.
    Rakp2Status(u8),
    /// Nonzero RMCP+ status in RAKP4.
    Rakp4Status(u8),
    /// Nonzero RMCP+ status in the Open Session Response.
    OpenSessionStatus(u8),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncorrectPassword => write!(f, "Incorrect password provided"),
            Self::Rakp4Integrity => {
                write!(f, "Invalid RAKP4 integrity code (wrong Kg?)")
            }
            Self::Rakp2Status(c) => {
                write!(f, "{} in RAKP2", rmcp_status_text_or_unknown(*c))
            }
            Self::Rakp4Status(c) => {
                write!(f, "{} reported in RAKP4", rmcp_status_text_or_unknown(*c))
            }
            Self::OpenSessionStatus(c) => {
                write!(f, "{}", rmcp_status_text_or_unknown(*c))
            }
        }
    }
}

impl std::error::Error for Error {}

// ─── Inputs and step state ───────────────────────────────────────────────────

/// Credentials and identifiers that stay fixed across one login attempt.
pub struct AuthInfo<'a> {
    /// Negotiated (attempted) hash algorithm.
    pub alg: HashAlg,
    /// User name, at most 16 bytes.
    pub userid: &'a [u8],
    /// Password, the RAKP authentication key.
    pub password: &'a [u8],
    /// Kg when the BMC requires one, otherwise the password again.
    pub kg: &'a [u8],
    /// Our session id from the open request.
    pub localsid: u32,
    /// The BMC-granted id from the open response, committed at RAKP4.
    pub pending_session_id: u32,
    /// Privilege level requested (1..4).
    pub privlevel: u8,
}

impl AuthInfo<'_> {
    fn priv_byte(&self) -> u8 {
        NAMEONLY_LOOKUP | self.privlevel
    }
}

/// State carried out of RAKP1 into the later steps.
pub struct Rakp1State {
    /// Tag stamped on RAKP1; RAKP2 must echo it.
    pub tag: u8,
    /// Our 16 random bytes.
    pub local_random: [u8; 16],
}

/// Output of a verified RAKP2.
pub struct Rakp2Verified {
    /// SIK / K1 / K2 derived from both random values.
    pub keys: SessionKeys,
    /// The BMC's 16 random bytes.
    pub remote_random: [u8; 16],
    /// The BMC's GUID.
    pub remote_guid: [u8; 16],
}

// ─── Open Session ────────────────────────────────────────────────────────────

/// Build the RMCP+ Open Session Request payload.
///
/// Proposes authentication, integrity and confidentiality for the given
/// hash: cipher suite 17 for SHA-256, suite 3 for SHA-1, AES-CBC-128 either
/// way. Privilege byte 0 asks for the most the channel will grant.
pub fn open_session(localsid: u32, tag: u8, alg: HashAlg) -> Vec<u8> {
    let mut data = vec![tag, 0, 0, 0];
    data.extend_from_slice(&localsid.to_le_bytes());
    match alg {
        HashAlg::Sha1 => {
            data.extend_from_slice(&[
                0, 0, 0, 8, 1, 0, 0, 0, // RAKP-HMAC-SHA1
                1, 0, 0, 8, 1, 0, 0, 0, // HMAC-SHA1-96
                2, 0, 0, 8, 1, 0, 0, 0, // AES-CBC-128
            ]);
        }
        HashAlg::Sha256 => {
            data.extend_from_slice(&[
                0, 0, 0, 8, 3, 0, 0, 0, // RAKP-HMAC-SHA256
                1, 0, 0, 8, 4, 0, 0, 0, // HMAC-SHA256-128
                2, 0, 0, 8, 1, 0, 0, 0, // AES-CBC-128
            ]);
        }
    }
    data
}

/// Result of a non-ignored Open Session Response.
pub enum OpenOutcome {
    /// The BMC granted a session id to carry into RAKP.
    Opened {
        /// BMC-side session id, pending until RAKP4 commits it.
        pending_session_id: u32,
        /// Maximum privilege the channel reports.
        allowed_priv: u8,
    },
    /// Nonzero status; the caller decides between hash fallback and failure.
    Status(u8),
}

/// Vet an Open Session Response body.
pub fn handle_open_session_response(
    body: &[u8],
    tag: u8,
    localsid: u32,
) -> Option<OpenOutcome> {
    if body.len() < 2 || body[0] != tag {
        return None;
    }
    // Status replies stop at the status byte; only a success carries ids.
    if body[1] != 0 {
        return Some(OpenOutcome::Status(body[1]));
    }
    if body.len() < 12 {
        return None;
    }
    if u32::from_le_bytes(body[4..8].try_into().unwrap()) != localsid {
        return None;
    }
    Some(OpenOutcome::Opened {
        pending_session_id: u32::from_le_bytes(body[8..12].try_into().unwrap()),
        allowed_priv: body[2],
    })
}

// ─── RAKP 1 / 2 ──────────────────────────────────────────────────────────────

/// Build RAKP1 with 16 fresh random bytes.
pub fn rakp1(tag: u8, auth: &AuthInfo<'_>) -> (Vec<u8>, Rakp1State) {
    let mut random = [0u8; 16];
    getrandom::getrandom(&mut random).expect("getrandom");
    do_rakp1(tag, auth, random)
}

fn do_rakp1(tag: u8, auth: &AuthInfo<'_>, local_random: [u8; 16]) -> (Vec<u8>, Rakp1State) {
    let mut payload = vec![tag, 0, 0, 0];
    payload.extend_from_slice(&auth.pending_session_id.to_le_bytes());
    payload.extend_from_slice(&local_random);
    payload.extend_from_slice(&[auth.priv_byte(), 0, 0, auth.userid.len() as u8]);
    payload.extend_from_slice(auth.userid);
    (payload, Rakp1State { tag, local_random })
}

/// Result of a non-ignored RAKP2.
pub enum Rakp2Outcome {
    /// HMAC verified; key material is ready and RAKP3 may go out.
    Verified(Rakp2Verified),
    /// Nonzero status other than the silently-ignored "Invalid Session ID".
    Status(u8),
}

/// Verify a RAKP2 body and derive the session keys.
///
/// `Ok(None)` means drop the packet: stale tag, mismatched session id, or
/// status 2 (a retry invalidated an in-flight attempt).
pub fn handle_rakp2(
    body: &[u8],
    auth: &AuthInfo<'_>,
    state: &Rakp1State,
) -> Result<Option<Rakp2Outcome>, Error> {
    if body.len() < 2 || body[0] != state.tag {
        return Ok(None);
    }
    if body[1] != 0 {
        if body[1] == 2 {
            return Ok(None);
        }
        return Ok(Some(Rakp2Outcome::Status(body[1])));
    }
    if body.len() < 40 {
        return Ok(None);
    }
    if u32::from_le_bytes(body[4..8].try_into().unwrap()) != auth.localsid {
        return Ok(None);
    }
    let mut remote_random = [0u8; 16];
    remote_random.copy_from_slice(&body[8..24]);
    let mut remote_guid = [0u8; 16];
    remote_guid.copy_from_slice(&body[24..40]);

    let mut hmacdata = Vec::with_capacity(58 + auth.userid.len());
    hmacdata.extend_from_slice(&auth.localsid.to_le_bytes());
    hmacdata.extend_from_slice(&auth.pending_session_id.to_le_bytes());
    hmacdata.extend_from_slice(&state.local_random);
    hmacdata.extend_from_slice(&remote_random);
    hmacdata.extend_from_slice(&remote_guid);
    hmacdata.push(auth.priv_byte());
    hmacdata.push(auth.userid.len() as u8);
    hmacdata.extend_from_slice(auth.userid);

    let expected = hmac(auth.alg, auth.password, &hmacdata);
    let given = body.get(40..40 + expected.len());
    if given != Some(expected.as_slice()) {
        return Err(Error::IncorrectPassword);
    }

    let keys = SessionKeys::derive(
        auth.alg,
        auth.kg,
        &state.local_random,
        &remote_random,
        auth.priv_byte(),
        auth.userid,
    );
    Ok(Some(Rakp2Outcome::Verified(Rakp2Verified {
        keys,
        remote_random,
        remote_guid,
    })))
}

// ─── RAKP 3 / 4 ──────────────────────────────────────────────────────────────

/// Build RAKP3, proving knowledge of the password over the BMC's random.
pub fn rakp3(tag: u8, auth: &AuthInfo<'_>, verified: &Rakp2Verified) -> Vec<u8> {
    let mut payload = vec![tag, 0, 0, 0];
    payload.extend_from_slice(&auth.pending_session_id.to_le_bytes());

    let mut hmacdata = Vec::with_capacity(22 + auth.userid.len());
    hmacdata.extend_from_slice(&verified.remote_random);
    hmacdata.extend_from_slice(&auth.localsid.to_le_bytes());
    hmacdata.push(auth.priv_byte());
    hmacdata.push(auth.userid.len() as u8);
    hmacdata.extend_from_slice(auth.userid);

    payload.extend_from_slice(&hmac(auth.alg, auth.password, &hmacdata));
    payload
}

/// Result of a non-ignored RAKP4.
pub enum Rakp4Outcome {
    /// The BMC's integrity code verified; commit the session.
    Established,
    /// Nonzero status; 2 usually means the BMC already considers the
    /// exchange finished after a RAKP3 retry and a full re-login is due.
    Status(u8),
}

/// Verify a RAKP4 body against the SIK.
///
/// `tag` is the one RAKP3 went out with; RAKP4 echoes it.
pub fn handle_rakp4(
    body: &[u8],
    auth: &AuthInfo<'_>,
    state: &Rakp1State,
    verified: &Rakp2Verified,
    tag: u8,
) -> Result<Option<Rakp4Outcome>, Error> {
    if body.len() < 2 || body[0] != tag {
        return Ok(None);
    }
    if body[1] != 0 {
        return Ok(Some(Rakp4Outcome::Status(body[1])));
    }
    if body.len() < 8 {
        return Ok(None);
    }
    if u32::from_le_bytes(body[4..8].try_into().unwrap()) != auth.localsid {
        return Ok(None);
    }

    let mut hmacdata = Vec::with_capacity(36);
    hmacdata.extend_from_slice(&state.local_random);
    hmacdata.extend_from_slice(&auth.pending_session_id.to_le_bytes());
    hmacdata.extend_from_slice(&verified.remote_guid);

    let expected = hmac_trunc(auth.alg, verified.keys.sik(), &hmacdata);
    let given = body.get(8..8 + expected.len());
    if given != Some(expected.as_slice()) {
        return Err(Error::Rakp4Integrity);
    }
    Ok(Some(Rakp4Outcome::Established))
}
