//! RMCP / RMCP+ packet framing.
//!
//! Every IPMI LAN packet starts with the class-7 RMCP leader `06 00 FF 07`.
//! What follows depends on the negotiated version:
//!
//! ```text
//! v1.5:  authtype:u8  seq:u32le  sid:u32le  [authcode:16]  len:u8  payload  [pad]
//! v2.0:  06  ptype:u8  sid:u32le  seq:u32le  len:u16le  payload  [integrity]
//! ```
//!
//! In the 2.0 form the payload-type byte carries the type in its low six
//! bits, bit 6 flags integrity and bit 7 confidentiality. Decoding is
//! deliberately silent: any mismatch in HMAC, session id, authtype or
//! sequence drops the packet without telling the caller why.

use bmclink_crypto::{aes_pad, cbc, hmac_trunc, md5_authcode, HashAlg};

/// RMCP class-7 leader shared by every IPMI LAN packet.
pub const RMCP_LEADER: [u8; 4] = [0x06, 0x00, 0xff, 0x07];

/// RMCP+ authtype value.
pub const AUTHTYPE_RMCP_PLUS: u8 = 6;

/// IPMI 1.5 totals (including the 34 pseudo-header bytes) that require the
/// empirical legacy pad byte.
const LEGACY_PAD_TOTALS: [usize; 5] = [56, 84, 112, 128, 156];

// ─── Payload types ───────────────────────────────────────────────────────────

/// RMCP+ payload type (table 13-16), low six bits of the type byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PayloadType {
    /// Standard IPMI message.
    Ipmi,
    /// Serial-over-LAN data.
    Sol,
    /// RMCP+ Open Session Request.
    OpenSessionRequest,
    /// RMCP+ Open Session Response.
    OpenSessionResponse,
    /// RAKP message 1.
    Rakp1,
    /// RAKP message 2.
    Rakp2,
    /// RAKP message 3.
    Rakp3,
    /// RAKP message 4.
    Rakp4,
}

impl PayloadType {
    /// The on-wire value.
    pub fn wire(self) -> u8 {
        match self {
            Self::Ipmi => 0x00,
            Self::Sol => 0x01,
            Self::OpenSessionRequest => 0x10,
            Self::OpenSessionResponse => 0x11,
            Self::Rakp1 => 0x12,
            Self::Rakp2 => 0x13,
            Self::Rakp3 => 0x14,
            Self::Rakp4 => 0x15,
        }
    }

    /// Parse the low six bits of a payload-type byte.
    pub fn from_wire(v: u8) -> Option<Self> {
        Some(match v & 0x3f {
            0x00 => Self::Ipmi,
            0x01 => Self::Sol,
            0x10 => Self::OpenSessionRequest,
            0x11 => Self::OpenSessionResponse,
            0x12 => Self::Rakp1,
            0x13 => Self::Rakp2,
            0x14 => Self::Rakp3,
            0x15 => Self::Rakp4,
            _ => return None,
        })
    }
}

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Encode an IPMI 1.5 packet.
///
/// `authcode` is present once MD5 authentication is active (authtype 2).
pub fn encode_v15(
    authtype: u8,
    sequence: u32,
    session_id: u32,
    authcode: Option<&[u8; 16]>,
    payload: &[u8],
) -> Vec<u8> {
    let mut message = Vec::with_capacity(30 + payload.len());
    message.extend_from_slice(&RMCP_LEADER);
    message.push(authtype);
    message.extend_from_slice(&sequence.to_le_bytes());
    message.extend_from_slice(&session_id.to_le_bytes());
    if let Some(code) = authcode {
        message.extend_from_slice(code);
    }
    message.push(payload.len() as u8);
    message.extend_from_slice(payload);
    if LEGACY_PAD_TOTALS.contains(&(34 + message.len())) {
        message.push(0);
    }
    message
}

/// Integrity and confidentiality material for an established 2.0 session.
pub struct Protection<'a> {
    /// Negotiated hash algorithm.
    pub alg: HashAlg,
    /// Integrity sub-key K1.
    pub k1: &'a [u8],
    /// AES-CBC-128 key (first 16 bytes of K2).
    pub aes_key: [u8; 16],
}

/// Encode an RMCP+ (2.0) packet with a fresh random IV.
///
/// Login-phase payloads (open session, RAKP) pass `prot = None` and go out
/// with neither integrity nor confidentiality.
pub fn encode_v20(
    ptype: PayloadType,
    session_id: u32,
    sequence: u32,
    payload: &[u8],
    prot: Option<&Protection<'_>>,
) -> Vec<u8> {
    let mut iv = [0u8; 16];
    getrandom::getrandom(&mut iv).expect("getrandom");
    do_encode_v20(ptype, session_id, sequence, payload, prot, &iv)
}

pub(crate) fn do_encode_v20(
    ptype: PayloadType,
    session_id: u32,
    sequence: u32,
    payload: &[u8],
    prot: Option<&Protection<'_>>,
    iv: &[u8; 16],
) -> Vec<u8> {
    let mut type_byte = ptype.wire();
    if prot.is_some() {
        type_byte |= 0b0100_0000; // integrity
        type_byte |= 0b1000_0000; // confidentiality
    }

    let mut message = Vec::with_capacity(40 + payload.len());
    message.extend_from_slice(&RMCP_LEADER);
    message.push(AUTHTYPE_RMCP_PLUS);
    message.push(type_byte);
    message.extend_from_slice(&session_id.to_le_bytes());
    message.extend_from_slice(&sequence.to_le_bytes());

    match prot {
        Some(p) => {
            let mut body = payload.to_vec();
            body.extend_from_slice(&aes_pad(payload.len()));
            cbc::cbc_encrypt(&p.aes_key, iv, &mut body);
            let psize = body.len() + 16;
            message.extend_from_slice(&(psize as u16).to_le_bytes());
            message.extend_from_slice(iv);
            message.extend_from_slice(&body);

            // Integrity pad so the authenticated region is 4-byte aligned
            // once the pad-length and next-header bytes land.
            let needed = (4 - (message.len() - 2) % 4) % 4;
            message.extend(std::iter::repeat(0xff).take(needed));
            message.push(needed as u8);
            message.push(0x07);
            let tag = hmac_trunc(p.alg, p.k1, &message[4..]);
            message.extend_from_slice(&tag);
        }
        None => {
            message.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            message.extend_from_slice(payload);
        }
    }
    message
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Everything the decoder needs to vet an inbound datagram.
pub struct InboundCtx<'a> {
    /// Our session id, which the BMC must echo on 2.0 session packets.
    pub localsid: u32,
    /// Session keys once RAKP4 committed; `None` during login.
    pub keys: Option<Protection<'a>>,
    /// Expected 1.5 authtype (0 or 2).
    pub v15_authtype: u8,
    /// The 1.5 session id granted by Get Session Challenge.
    pub v15_session_id: u32,
    /// Password for 1.5 authcode verification.
    pub password: &'a [u8],
    /// Highest remote sequence accepted so far.
    pub last_remote_sequence: Option<u32>,
}

/// A decoded, vetted inbound packet.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// An IPMI message payload (either protocol version).
    Ipmi {
        /// Remote sequence number observed on the wire.
        sequence: u32,
        /// The inner IPMI message.
        payload: Vec<u8>,
    },
    /// A Serial-over-LAN payload.
    Sol {
        /// Remote sequence number observed on the wire.
        sequence: u32,
        /// The SOL frame.
        payload: Vec<u8>,
    },
    /// A login-phase payload (open session response, RAKP 2/4).
    Rakp {
        /// Which login payload arrived.
        ptype: PayloadType,
        /// Its body, starting after the RMCP+ header.
        body: Vec<u8>,
    },
}

/// Decode one datagram.
///
/// Returns `None` for anything that should be silently dropped: wrong
/// leader, foreign authtype or session id, bad authcode or HMAC, stale
/// sequence, truncated structure.
pub fn decode(data: &[u8], ctx: &InboundCtx<'_>) -> Option<Inbound> {
    if data.len() < 5 || data[0] != 0x06 || data[2] != 0xff || data[3] != 0x07 {
        return None;
    }
    match data[4] {
        0 | 2 => decode_v15(data, ctx),
        AUTHTYPE_RMCP_PLUS => decode_v20(data, ctx),
        _ => None,
    }
}

fn decode_v15(data: &[u8], ctx: &InboundCtx<'_>) -> Option<Inbound> {
    if data.len() < 14 {
        return None;
    }
    let sequence = u32::from_le_bytes(data[5..9].try_into().unwrap());
    let session_id = u32::from_le_bytes(data[9..13].try_into().unwrap());
    if let Some(last) = ctx.last_remote_sequence {
        if sequence < last {
            return None;
        }
    }
    if data[4] != ctx.v15_authtype || session_id != ctx.v15_session_id {
        return None;
    }

    let (authcode, rest) = if data[4] == 2 {
        if data.len() < 30 {
            return None;
        }
        (Some(&data[13..29]), &data[29..])
    } else {
        (None, &data[13..])
    };
    let plen = rest[0] as usize;
    if rest.len() < 1 + plen {
        return None;
    }
    let payload = rest[1..1 + plen].to_vec();

    if let Some(code) = authcode {
        let expected =
            md5_authcode(ctx.password, session_id, sequence, &payload).ok()?;
        if code != expected {
            return None;
        }
    }
    Some(Inbound::Ipmi { sequence, payload })
}

fn decode_v20(data: &[u8], ctx: &InboundCtx<'_>) -> Option<Inbound> {
    if data.len() < 16 {
        return None;
    }
    let type_byte = data[5];
    let ptype = PayloadType::from_wire(type_byte)?;

    match ptype {
        PayloadType::OpenSessionResponse
        | PayloadType::Rakp2
        | PayloadType::Rakp4
        | PayloadType::OpenSessionRequest
        | PayloadType::Rakp1
        | PayloadType::Rakp3 => {
            let psize = u16::from_le_bytes(data[14..16].try_into().unwrap()) as usize;
            let body = data[16..].get(..psize).unwrap_or(&data[16..]).to_vec();
            Some(Inbound::Rakp { ptype, body })
        }
        PayloadType::Ipmi | PayloadType::Sol => {
            // Session traffic must carry mutual integrity assurance.
            if type_byte & 0b0100_0000 == 0 {
                return None;
            }
            let keys = ctx.keys.as_ref()?;
            let trunc = keys.alg.trunc_len();
            if data.len() < 16 + trunc {
                return None;
            }
            let (covered, tag) = data.split_at(data.len() - trunc);
            if hmac_trunc(keys.alg, keys.k1, &covered[4..]) != tag {
                log::debug!("dropping session packet with bad integrity code");
                return None;
            }
            let session_id = u32::from_le_bytes(data[6..10].try_into().unwrap());
            if session_id != ctx.localsid {
                return None;
            }
            let sequence = u32::from_le_bytes(data[10..14].try_into().unwrap());
            if let Some(last) = ctx.last_remote_sequence {
                if sequence < last && last != 0xffff_ffff {
                    return None;
                }
            }
            let psize = u16::from_le_bytes(data[14..16].try_into().unwrap()) as usize;
            if data.len() < 16 + psize {
                return None;
            }
            let mut payload = data[16..16 + psize].to_vec();
            if type_byte & 0b1000_0000 != 0 {
                if payload.len() < 16 || (payload.len() - 16) % 16 != 0 {
                    return None;
                }
                let mut iv = [0u8; 16];
                iv.copy_from_slice(&payload[..16]);
                payload.drain(..16);
                cbc::cbc_decrypt(&keys.aes_key, &iv, &mut payload);
                let padsize = *payload.last()? as usize + 1;
                if padsize > payload.len() {
                    return None;
                }
                payload.truncate(payload.len() - padsize);
            }
            match ptype {
                PayloadType::Ipmi => Some(Inbound::Ipmi { sequence, payload }),
                _ => Some(Inbound::Sol { sequence, payload }),
            }
        }
    }
}
