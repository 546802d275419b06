//! A loopback mock BMC speaking just enough RMCP+ for the client tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use bmclink_crypto::{checksum, hmac, hmac_trunc, HashAlg, SessionKeys};
use bmclink_proto::packet::{self, Inbound, InboundCtx, PayloadType, Protection};

pub const USER: &[u8] = b"admin";
pub const PASSWORD: &[u8] = b"admin";

const BMC_SID: u32 = 0x0200_0001;
const BMC_RANDOM: [u8; 16] = [0xbb; 16];
const BMC_GUID: [u8; 16] = [0x5a; 16];

/// What the mock should do beyond the straight happy path.
#[derive(Default)]
pub struct BmcOptions {
    /// Refuse SHA-256 open-session proposals with status 1.
    pub reject_sha256: bool,
    /// Answer the first RAKP1 requesting privilege 4 with this status.
    pub rakp2_status_first: Option<u8>,
    /// Corrupt the RAKP2 key-exchange authcode.
    pub wrong_password: bool,
    /// Completion code for Set Session Privilege at level 4.
    pub priv4_code: u8,
    /// Commands (netfn, cmd) the BMC swallows without replying.
    pub ignore: Vec<(u8, u8)>,
    /// Activate Payload response data override.
    pub activation_data: Option<Vec<u8>>,
    /// Custom handler for established commands; return None to fall
    /// through to the defaults.
    #[allow(clippy::type_complexity)]
    pub handler: Option<Box<dyn FnMut(u8, u8, &[u8]) -> Option<(u8, Vec<u8>)> + Send>>,
    /// SOL payload handler: inbound frame to frames to send back.
    #[allow(clippy::type_complexity)]
    pub sol: Option<Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>>,
}

pub struct MockBmc {
    pub addr: SocketAddr,
    /// SOL frames and commands observed, for assertions.
    pub seen_sol: mpsc::UnboundedReceiver<Vec<u8>>,
}

struct BmcState {
    opts: BmcOptions,
    alg: HashAlg,
    client_sid: u32,
    client_random: [u8; 16],
    priv_byte: u8,
    userid: Vec<u8>,
    keys: Option<SessionKeys>,
    sequence: u32,
    last_client_seq: Option<u32>,
    rakp1_count: u32,
    port: u16,
    sol_seen_tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// IPMI response payload mirroring a request's netfn/seqlun/command.
pub fn ipmi_response(request: &[u8], code: u8, data: &[u8]) -> Vec<u8> {
    let netfn = (request[1] >> 2) + 1;
    let head = [0x81, netfn << 2];
    let mut rsp = head.to_vec();
    rsp.push(checksum(&head));
    let mut body = vec![0x20, request[4], request[5], code];
    body.extend_from_slice(data);
    rsp.extend_from_slice(&body);
    rsp.push(checksum(&body));
    rsp
}

pub async fn spawn(opts: BmcOptions) -> MockBmc {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (sol_seen_tx, seen_sol) = mpsc::unbounded_channel();
    let state = BmcState {
        opts,
        alg: HashAlg::Sha256,
        client_sid: 0,
        client_random: [0; 16],
        priv_byte: 0,
        userid: Vec::new(),
        keys: None,
        sequence: 0,
        last_client_seq: None,
        rakp1_count: 0,
        port: addr.port(),
        sol_seen_tx,
    };
    tokio::spawn(run(socket, state));
    MockBmc { addr, seen_sol }
}

async fn run(socket: UdpSocket, mut state: BmcState) {
    let mut buf = vec![0u8; 3000];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(_) => return,
        };
        for reply in state.handle(&buf[..len]) {
            let _ = socket.send_to(&reply, from).await;
        }
    }
}

impl BmcState {
    fn handle(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if data.len() < 6 || data[0] != 0x06 {
            return Vec::new();
        }
        match data[4] {
            0 => self.handle_v15(data),
            6 => self.handle_v20(data),
            _ => Vec::new(),
        }
    }

    fn handle_v15(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let plen = data[13] as usize;
        let payload = &data[14..14 + plen];
        let netfn = payload[1] >> 2;
        let cmd = payload[5];
        if netfn == 0x06 && cmd == 0x38 {
            // Channel 1, IPMI 2.0 + MD5, 2.0 capable.
            let caps = [0x01, 0x84, 0x00, 0x02, 0, 0, 0, 0];
            let rsp = ipmi_response(payload, 0, &caps);
            return vec![packet::encode_v15(0, 0, 0, None, &rsp)];
        }
        Vec::new()
    }

    fn handle_v20(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let ptype = data[5] & 0x3f;
        match ptype {
            0x10 => self.open_session(&data[16..]),
            0x12 => self.rakp1(&data[16..]),
            0x14 => self.rakp3(&data[16..]),
            0x00 | 0x01 => self.session_payload(data),
            _ => Vec::new(),
        }
    }

    fn open_session(&mut self, body: &[u8]) -> Vec<Vec<u8>> {
        let tag = body[0];
        let alg_byte = body[12];
        self.client_sid = u32::from_le_bytes(body[4..8].try_into().unwrap());
        if alg_byte == 3 && self.opts.reject_sha256 {
            return vec![packet::encode_v20(
                PayloadType::OpenSessionResponse,
                0,
                0,
                &[tag, 1, 0, 0],
                None,
            )];
        }
        self.alg = if alg_byte == 3 {
            HashAlg::Sha256
        } else {
            HashAlg::Sha1
        };
        let mut rsp = vec![tag, 0, 4, 0];
        rsp.extend_from_slice(&self.client_sid.to_le_bytes());
        rsp.extend_from_slice(&BMC_SID.to_le_bytes());
        vec![packet::encode_v20(
            PayloadType::OpenSessionResponse,
            0,
            0,
            &rsp,
            None,
        )]
    }

    fn rakp1(&mut self, body: &[u8]) -> Vec<Vec<u8>> {
        let tag = body[0];
        self.client_random.copy_from_slice(&body[8..24]);
        self.priv_byte = body[24];
        let userlen = body[27] as usize;
        self.userid = body[28..28 + userlen].to_vec();
        self.rakp1_count += 1;

        if let Some(status) = self.opts.rakp2_status_first {
            if self.priv_byte & 0x0f == 4 && self.rakp1_count == 1 {
                return vec![packet::encode_v20(
                    PayloadType::Rakp2,
                    0,
                    0,
                    &[tag, status, 0, 0],
                    None,
                )];
            }
        }

        let mut hmacdata = Vec::new();
        hmacdata.extend_from_slice(&self.client_sid.to_le_bytes());
        hmacdata.extend_from_slice(&BMC_SID.to_le_bytes());
        hmacdata.extend_from_slice(&self.client_random);
        hmacdata.extend_from_slice(&BMC_RANDOM);
        hmacdata.extend_from_slice(&BMC_GUID);
        hmacdata.push(self.priv_byte);
        hmacdata.push(self.userid.len() as u8);
        hmacdata.extend_from_slice(&self.userid);
        let mut code = hmac(self.alg, PASSWORD, &hmacdata);
        if self.opts.wrong_password {
            code[0] ^= 0xff;
        }

        let mut rsp = vec![tag, 0, 0, 0];
        rsp.extend_from_slice(&self.client_sid.to_le_bytes());
        rsp.extend_from_slice(&BMC_RANDOM);
        rsp.extend_from_slice(&BMC_GUID);
        rsp.extend_from_slice(&code);
        vec![packet::encode_v20(PayloadType::Rakp2, 0, 0, &rsp, None)]
    }

    fn rakp3(&mut self, body: &[u8]) -> Vec<Vec<u8>> {
        let tag = body[0];
        let keys = SessionKeys::derive(
            self.alg,
            PASSWORD,
            &self.client_random,
            &BMC_RANDOM,
            self.priv_byte,
            &self.userid,
        );
        let mut hmacdata = Vec::new();
        hmacdata.extend_from_slice(&self.client_random);
        hmacdata.extend_from_slice(&BMC_SID.to_le_bytes());
        hmacdata.extend_from_slice(&BMC_GUID);
        let code = hmac_trunc(self.alg, keys.sik(), &hmacdata);

        let mut rsp = vec![tag, 0, 0, 0];
        rsp.extend_from_slice(&self.client_sid.to_le_bytes());
        rsp.extend_from_slice(&code);
        self.keys = Some(keys);
        self.sequence = 0;
        self.last_client_seq = None;
        vec![packet::encode_v20(PayloadType::Rakp4, 0, 0, &rsp, None)]
    }

    fn protection(&self) -> Option<Protection<'_>> {
        self.keys.as_ref().map(|k| Protection {
            alg: k.alg(),
            k1: k.k1(),
            aes_key: k.aes_key(),
        })
    }

    fn session_payload(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let ctx = InboundCtx {
            localsid: BMC_SID,
            keys: self.protection(),
            v15_authtype: 0xff,
            v15_session_id: 0,
            password: PASSWORD,
            last_remote_sequence: self.last_client_seq,
        };
        let inbound = match packet::decode(data, &ctx) {
            Some(i) => i,
            None => return Vec::new(),
        };
        match inbound {
            Inbound::Ipmi { sequence, payload } => {
                self.last_client_seq = Some(sequence);
                let netfn = payload[1] >> 2;
                let cmd = payload[5];
                if netfn == 0x06 && cmd == 0x34 {
                    return self.bridged(&payload);
                }
                let body = payload[6..payload.len() - 1].to_vec();
                if self.opts.ignore.contains(&(netfn, cmd)) {
                    return Vec::new();
                }
                let (code, rdata) = self.command_response(netfn, cmd, &body);
                let rsp = ipmi_response(&payload, code, &rdata);
                vec![self.frame(PayloadType::Ipmi, &rsp)]
            }
            Inbound::Sol { sequence, payload } => {
                self.last_client_seq = Some(sequence);
                let _ = self.sol_seen_tx.send(payload.clone());
                let replies = match self.opts.sol.as_mut() {
                    Some(f) => f(&payload),
                    None => Vec::new(),
                };
                replies
                    .into_iter()
                    .map(|p| self.frame(PayloadType::Sol, &p))
                    .collect()
            }
            Inbound::Rakp { .. } => Vec::new(),
        }
    }

    /// Answer a Send Message wrapper: the outer-hop confirmation first,
    /// then the bridged target's own reply.
    fn bridged(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        let confirm = ipmi_response(payload, 0, &[0x00]);
        let inner = &payload[7..];
        let inner_netfn = inner[1] >> 2;
        let inner_cmd = inner[5];
        let (code, rdata) = self.command_response(inner_netfn, inner_cmd, &inner[6..]);

        let head = [0x81, (inner_netfn + 1) << 2];
        let mut real = head.to_vec();
        real.push(checksum(&head));
        let mut body = vec![0x20, payload[4], inner_cmd, code];
        body.extend_from_slice(&rdata);
        real.extend_from_slice(&body);
        real.push(checksum(&body));

        vec![
            self.frame(PayloadType::Ipmi, &confirm),
            self.frame(PayloadType::Ipmi, &real),
        ]
    }

    fn command_response(&mut self, netfn: u8, cmd: u8, body: &[u8]) -> (u8, Vec<u8>) {
        if let Some(handler) = self.opts.handler.as_mut() {
            if let Some(r) = handler(netfn, cmd, body) {
                return r;
            }
        }
        match (netfn, cmd) {
            (0x06, 0x3b) => {
                if body.first() == Some(&4) && self.opts.priv4_code != 0 {
                    (self.opts.priv4_code, Vec::new())
                } else {
                    (0, vec![body.first().copied().unwrap_or(0)])
                }
            }
            (0x06, 0x01) => (
                0,
                vec![0x20, 0x01, 0x02, 0x21, 0x02, 0xbf, 0x57, 0x01, 0x00, 0x34, 0x12],
            ),
            (0x06, 0x3c) => (0, Vec::new()),
            (0x06, 0x48) => {
                let data = self.opts.activation_data.clone().unwrap_or_else(|| {
                    let mut d = vec![0, 0, 0, 0, 64, 0, 4, 0];
                    d.extend_from_slice(&self.port.to_le_bytes());
                    d
                });
                (0, data)
            }
            (0x06, 0x49) => (0, Vec::new()),
            (0x06, 0x4b) => {
                let mut d = BMC_SID.to_le_bytes().to_vec();
                d.extend_from_slice(&[0, 0, 0, 0]);
                (0, d)
            }
            _ => (0xc1, Vec::new()),
        }
    }

    fn frame(&mut self, ptype: PayloadType, payload: &[u8]) -> Vec<u8> {
        self.sequence += 1;
        let prot = self.keys.as_ref().map(|k| Protection {
            alg: k.alg(),
            k1: k.k1(),
            aes_key: k.aes_key(),
        });
        packet::encode_v20(ptype, self.client_sid, self.sequence, payload, prot.as_ref())
    }
}

/// Counter helper for handlers that change behavior per call.
pub fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

pub fn bump(c: &Arc<AtomicU32>) -> u32 {
    c.fetch_add(1, Ordering::SeqCst)
}
