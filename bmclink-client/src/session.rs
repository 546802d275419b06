//! IPMI session management: login, commands, keepalives.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use bmclink_crypto::{md5_authcode, HashAlg, SessionKeys};
use bmclink_proto::codes::completion_text_or_unknown;
use bmclink_proto::message::{self, BridgeTarget, Dispatch, Response};
use bmclink_proto::packet::{self, Inbound, InboundCtx, PayloadType, Protection};
use bmclink_proto::rakp::{self, OpenOutcome, Rakp2Outcome, Rakp4Outcome};
use bmclink_proto::session::{Context, SessionState};

use crate::errors::IpmiError;
use crate::reactor::{Reactor, Registration};

/// Default RMCP port.
pub const DEFAULT_PORT: u16 = 623;

/// Idle ceiling before a BMC may drop the session.
const MAX_IDLE: f64 = 29.0;

/// First-packet retry timeout, randomized upward to stagger fleets.
const INITIAL_TIMEOUT: f64 = 0.5;

fn jitter(max: f64) -> Duration {
    let mut b = [0u8; 4];
    getrandom::getrandom(&mut b).expect("getrandom");
    Duration::from_secs_f64(max * (u32::from_le_bytes(b) as f64 / u32::MAX as f64))
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Connection parameters for [`Session::connect`].
#[derive(Clone)]
pub struct SessionConfig {
    /// BMC hostname or address.
    pub bmc: String,
    /// User name, at most 16 bytes.
    pub userid: String,
    /// Password, at most 20 bytes for IPMI 2.0.
    pub password: String,
    /// Kg key for BMCs configured to require one.
    pub kg: Option<Vec<u8>>,
    /// UDP port, pretty much always 623.
    pub port: u16,
    /// Explicit privilege level 1..=4. Leaving it unset requests
    /// administrator and downgrades automatically when the BMC objects.
    pub privlevel: Option<u8>,
    /// Keep the session alive while idle. When false the session logs out
    /// instead once idle.
    pub keepalive: bool,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("bmc", &self.bmc)
            .field("userid", &self.userid)
            .field("password", &"<redacted>")
            .field("kg", &self.kg)
            .field("port", &self.port)
            .field("privlevel", &self.privlevel)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

impl SessionConfig {
    /// Config with the usual defaults.
    pub fn new(
        bmc: impl Into<String>,
        userid: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            bmc: bmc.into(),
            userid: userid.into(),
            password: password.into(),
            kg: None,
            port: DEFAULT_PORT,
            privlevel: None,
            keepalive: true,
        }
    }
}

/// Per-command options for [`Session::raw_command_with`].
pub struct CommandOpts {
    /// Route the request through a Send Message wrapper.
    pub bridge: Option<BridgeTarget>,
    /// Retry on timeout. Without it the command gets one second and a
    /// non-terminal [`IpmiError::Timeout`].
    pub retry: bool,
    /// Sleep before transmitting.
    pub delay_xmit: Option<Duration>,
    /// Custom initial timeout for long-running commands.
    pub timeout: Option<Duration>,
    /// Responder LUN.
    pub rslun: u8,
}

impl Default for CommandOpts {
    fn default() -> Self {
        Self {
            bridge: None,
            retry: true,
            delay_xmit: None,
            timeout: None,
            rslun: 0,
        }
    }
}

// ─── Keepalives ──────────────────────────────────────────────────────────────

/// Handle identifying a registered custom keepalive.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct KeepaliveId(u64);

/// A command to issue in place of the default keepalive while idle.
#[derive(Clone, Debug)]
pub struct KeepaliveRequest {
    /// Request netfn.
    pub netfn: u8,
    /// Request command.
    pub command: u8,
    /// Request data.
    pub data: Vec<u8>,
}

// ─── Session ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum IpmiVersion {
    V15,
    V20,
}

enum Event {
    Response(Response),
    Rakp(PayloadType, Vec<u8>),
}

enum Recv {
    Event(Event),
    Nothing,
    Elapsed,
}

/// A login attempt that should rewind to the auth-cap probe rather than
/// fail outright.
enum LoginStep {
    Restart,
    Fail(IpmiError),
}

impl From<IpmiError> for LoginStep {
    fn from(e: IpmiError) -> Self {
        Self::Fail(e)
    }
}

/// One authenticated IPMI session to a BMC.
///
/// All network IO happens inside the async methods; between calls inbound
/// datagrams queue on the reactor route. Sessions are single-task by
/// contract: [`Session::wait_for_rsp`] is the only idle suspension point.
#[derive(Debug)]
pub struct Session {
    cfg: SessionConfig,
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    _registration_guard: RegistrationGuard,

    state: SessionState,
    ipmi_version: IpmiVersion,
    ipmi15only: bool,
    attempted_alg: HashAlg,
    keys: Option<SessionKeys>,

    userid: Vec<u8>,
    password: Vec<u8>,
    kg: Vec<u8>,
    privlevel: u8,
    autopriv: bool,

    logged: bool,
    broken: bool,
    logontries: u32,
    logout_expiry: Option<Instant>,
    timeout: Duration,
    maxtimeout: Duration,

    last_payload: Option<(Vec<u8>, PayloadType)>,
    pending_payloads: VecDeque<(Vec<u8>, PayloadType, bool)>,

    idle_deadline: Instant,
    custom_keepalives: HashMap<KeepaliveId, KeepaliveRequest>,
    next_keepalive_id: u64,
    keepalive_events: Vec<(KeepaliveId, Response)>,

    sol_attached: bool,
    sol_inbox: VecDeque<Vec<u8>>,
}

/// Keeps the reactor route alive for the session's lifetime.
#[derive(Debug)]
struct RegistrationGuard(#[allow(dead_code)] Registration);

impl Session {
    // ── Connect ────────────────────────────────────────────────────────────

    /// Connect and log in using the process-wide reactor.
    pub async fn connect(cfg: SessionConfig) -> Result<Self, IpmiError> {
        Self::connect_with(cfg, Reactor::shared()).await
    }

    /// Connect and log in on an explicit reactor.
    pub async fn connect_with(
        cfg: SessionConfig,
        reactor: Arc<Reactor>,
    ) -> Result<Self, IpmiError> {
        if cfg.userid.len() > 16 {
            return Err(IpmiError::InvalidArgument(
                "Username too long for IPMI, must not exceed 16".into(),
            ));
        }
        if cfg.password.len() > 20 {
            return Err(IpmiError::InvalidArgument(
                "Password too long for IPMI 2.0, must not exceed 20".into(),
            ));
        }
        if let Some(p) = cfg.privlevel {
            if !(1..=4).contains(&p) {
                return Err(IpmiError::InvalidArgument(format!(
                    "Privilege level {p} out of range 1..=4"
                )));
            }
        }

        let peer = tokio::net::lookup_host((cfg.bmc.as_str(), cfg.port))
            .await?
            .next()
            .ok_or_else(|| {
                IpmiError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Unable to transmit to specified address",
                ))
            })?;
        let mut registration = reactor.register(peer).await?;
        let rx = std::mem::replace(&mut registration.rx, mpsc::unbounded_channel().1);

        let (privlevel, autopriv) = match cfg.privlevel {
            Some(p) => (p, false),
            None => (4, true),
        };

        let now = Instant::now();
        let mut session = Self {
            userid: cfg.userid.clone().into_bytes(),
            password: cfg.password.clone().into_bytes(),
            kg: cfg
                .kg
                .clone()
                .unwrap_or_else(|| cfg.password.clone().into_bytes()),
            peer,
            socket: registration.socket.clone(),
            rx,
            _registration_guard: RegistrationGuard(registration),
            state: SessionState::new(),
            ipmi_version: IpmiVersion::V15,
            ipmi15only: false,
            attempted_alg: HashAlg::Sha256,
            keys: None,
            privlevel,
            autopriv,
            logged: false,
            broken: false,
            logontries: 0,
            logout_expiry: None,
            timeout: Duration::from_secs_f64(INITIAL_TIMEOUT),
            maxtimeout: Duration::from_secs(3),
            last_payload: None,
            pending_payloads: VecDeque::new(),
            idle_deadline: now + Duration::from_secs(3600),
            custom_keepalives: HashMap::new(),
            next_keepalive_id: 0,
            keepalive_events: Vec::new(),
            sol_attached: false,
            sol_inbox: VecDeque::new(),
            cfg,
        };
        session.login().await?;
        Ok(session)
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    /// The remote-granted session id (0 before establishment).
    pub fn session_id(&self) -> u32 {
        self.state.session_id
    }

    /// UDP port this session talks to.
    pub fn port(&self) -> u16 {
        self.cfg.port
    }

    /// Whether the session is logged in and usable.
    pub fn is_logged(&self) -> bool {
        self.logged
    }

    /// Whether the session failed terminally.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// The privilege level in force after auto-downgrades.
    pub fn privlevel(&self) -> u8 {
        self.privlevel
    }

    // ── Login ──────────────────────────────────────────────────────────────

    async fn login(&mut self) -> Result<(), IpmiError> {
        self.logontries = 5;
        loop {
            match self.try_login().await {
                Ok(()) => {
                    log::info!(
                        "[bmclink] {} logged in (IPMI {}, priv {})",
                        self.cfg.bmc,
                        if self.ipmi_version == IpmiVersion::V20 { "2.0" } else { "1.5" },
                        self.privlevel
                    );
                    return Ok(());
                }
                Err(LoginStep::Restart) if self.logontries > 0 => {
                    self.logontries -= 1;
                    log::debug!(
                        "[bmclink] {} login rewinding ({} tries left)",
                        self.cfg.bmc,
                        self.logontries
                    );
                }
                Err(LoginStep::Restart) => {
                    self.mark_broken();
                    return Err(IpmiError::Timeout);
                }
                Err(LoginStep::Fail(e)) => {
                    self.mark_broken();
                    return Err(e);
                }
            }
        }
    }

    fn init_session(&mut self) {
        self.state.reset();
        self.keys = None;
        self.ipmi_version = IpmiVersion::V15;
        self.ipmi15only = false;
        self.attempted_alg = HashAlg::Sha256;
        self.logged = false;
        self.last_payload = None;
        self.pending_payloads.clear();
        self.timeout = Duration::from_secs_f64(INITIAL_TIMEOUT) + jitter(0.5);
        self.logout_expiry = Some(Instant::now() + self.max_command_budget());
    }

    /// Total worst-case wait across the growing per-try timeouts.
    fn max_command_budget(&self) -> Duration {
        let mut cumulative = Duration::ZERO;
        let mut increment = self.timeout;
        while increment < self.maxtimeout {
            cumulative += increment;
            increment += Duration::from_secs(1);
        }
        cumulative + Duration::from_secs(1)
    }

    async fn try_login(&mut self) -> Result<(), LoginStep> {
        self.init_session();

        // Auth-cap probe. 0x8E advertises 2.0 support in the request;
        // BMCs that check "reserved" bits answer 0xCC and get the 1.5
        // form instead.
        let caps = loop {
            let probe = if self.ipmi15only { 0x0e } else { 0x8e };
            let rsp = self
                .issue_command(0x06, 0x38, &[probe, self.privlevel], &CommandOpts::default())
                .await?;
            // A reply means a live BMC; worth more patience from here on.
            self.maxtimeout = Duration::from_secs(6);
            if rsp.code == 0xcc && !self.ipmi15only {
                self.ipmi15only = true;
                continue;
            }
            if let Some(err) = rsp.error_text() {
                return Err(LoginStep::Fail(IpmiError::Login(format!(
                    "{err} while trying to get channel authentication capabilities"
                ))));
            }
            break rsp.data;
        };
        if caps.len() < 4 {
            return Err(LoginStep::Fail(IpmiError::Protocol(
                "Short channel authentication capabilities response".into(),
            )));
        }
        if caps[1] & 0b1000_0000 != 0 && caps[3] & 0b10 != 0 {
            self.ipmi_version = IpmiVersion::V20;
        }
        match self.ipmi_version {
            IpmiVersion::V15 => {
                if caps[1] & 0b100 == 0 {
                    return Err(LoginStep::Fail(IpmiError::Login(
                        "MD5 required but not enabled/available on target BMC".into(),
                    )));
                }
                self.login_v15().await
            }
            IpmiVersion::V20 => self.login_v20().await,
        }
    }

    async fn login_v15(&mut self) -> Result<(), LoginStep> {
        let mut rq = vec![2u8];
        rq.extend_from_slice(&self.userid);
        rq.resize(17, 0);
        let rsp = self
            .issue_command(0x06, 0x39, &rq, &CommandOpts::default())
            .await?;
        if let Some(err) = rsp.error_text() {
            return Err(LoginStep::Fail(IpmiError::Login(format!(
                "{err} while getting session challenge"
            ))));
        }
        if rsp.data.len() < 20 {
            return Err(LoginStep::Fail(IpmiError::Protocol(
                "Short session challenge response".into(),
            )));
        }
        self.state.session_id = u32::from_le_bytes(rsp.data[0..4].try_into().unwrap());
        self.state.authtype = 2;

        // Activate Session: MD5, admin request, initial seq 1.
        let mut rq = vec![2u8, 4];
        rq.extend_from_slice(&rsp.data[4..20]);
        rq.extend_from_slice(&[1, 0, 0, 0]);
        let rsp = self
            .issue_command(0x06, 0x3a, &rq, &CommandOpts::default())
            .await?;
        if let Some(err) = rsp.error_text() {
            return Err(LoginStep::Fail(IpmiError::Login(err)));
        }
        if rsp.data.len() < 9 {
            return Err(LoginStep::Fail(IpmiError::Protocol(
                "Short activate session response".into(),
            )));
        }
        self.state.session_id = u32::from_le_bytes(rsp.data[1..5].try_into().unwrap());
        self.state.sequence = u32::from_le_bytes(rsp.data[5..9].try_into().unwrap());
        self.state.context = Context::Established;
        self.req_priv_level().await
    }

    async fn login_v20(&mut self) -> Result<(), LoginStep> {
        self.state.authtype = packet::AUTHTYPE_RMCP_PLUS;
        let userid = self.userid.clone();
        let password = self.password.clone();
        let kg = self.kg.clone();

        // Open Session, falling back from SHA-256 to SHA-1 when refused.
        let opened = 'open: loop {
            self.state.localsid = self.state.localsid.wrapping_add(1);
            let tag = self.state.next_tag();
            let request = rakp::open_session(self.state.localsid, tag, self.attempted_alg);
            self.state.context = Context::OpenSession;
            self.send_payload(&request, PayloadType::OpenSessionRequest, false, false)
                .await?;
            loop {
                match self.recv_event().await? {
                    Recv::Event(Event::Rakp(PayloadType::OpenSessionResponse, body)) => {
                        match rakp::handle_open_session_response(&body, tag, self.state.localsid)
                        {
                            None => continue,
                            Some(OpenOutcome::Status(status)) => {
                                if self.attempted_alg == HashAlg::Sha256 {
                                    log::debug!(
                                        "[bmclink] {} refused SHA-256 (status {status}), retrying with SHA-1",
                                        self.cfg.bmc
                                    );
                                    self.attempted_alg = HashAlg::Sha1;
                                    continue 'open;
                                }
                                return Err(LoginStep::Fail(
                                    rakp::Error::OpenSessionStatus(status).into(),
                                ));
                            }
                            Some(OpenOutcome::Opened {
                                pending_session_id, ..
                            }) => break 'open pending_session_id,
                        }
                    }
                    Recv::Event(_) | Recv::Nothing => continue,
                    Recv::Elapsed => {
                        // The open request is idempotent; resend verbatim.
                        self.grow_timeout()?;
                        self.send_payload(
                            &rakp::open_session(self.state.localsid, tag, self.attempted_alg),
                            PayloadType::OpenSessionRequest,
                            false,
                            false,
                        )
                        .await?;
                    }
                }
            }
        };
        self.state.pending_session_id = opened;

        let auth = rakp::AuthInfo {
            alg: self.attempted_alg,
            userid: &userid,
            password: &password,
            kg: &kg,
            localsid: self.state.localsid,
            pending_session_id: self.state.pending_session_id,
            privlevel: self.privlevel,
        };

        // RAKP1 → RAKP2. A timeout here rewinds the whole login: BMCs
        // treat a repeated RAKP1 as an error.
        let tag1 = self.state.next_tag();
        let (rakp1_payload, s1) = rakp::rakp1(tag1, &auth);
        self.state.context = Context::ExpectingRakp2;
        self.send_payload(&rakp1_payload, PayloadType::Rakp1, false, false)
            .await?;
        let verified = loop {
            match self.recv_event().await? {
                Recv::Event(Event::Rakp(PayloadType::Rakp2, body)) => {
                    match rakp::handle_rakp2(&body, &auth, &s1) {
                        Ok(None) => continue,
                        Ok(Some(Rakp2Outcome::Status(status)))
                            if (status == 9 || status == 0x0d)
                                && self.autopriv
                                && self.privlevel == 4 =>
                        {
                            // The BMC dislikes administrator for this user;
                            // degrade to operator and start over.
                            log::info!(
                                "[bmclink] {} rejected priv 4, retrying as operator",
                                self.cfg.bmc
                            );
                            self.privlevel = 3;
                            self.logontries = 5;
                            return Err(LoginStep::Restart);
                        }
                        Ok(Some(Rakp2Outcome::Status(status))) => {
                            return Err(LoginStep::Fail(
                                rakp::Error::Rakp2Status(status).into(),
                            ));
                        }
                        Ok(Some(Rakp2Outcome::Verified(v))) => break v,
                        Err(e) => {
                            self.state.context = Context::Failed;
                            return Err(LoginStep::Fail(e.into()));
                        }
                    }
                }
                Recv::Event(_) | Recv::Nothing => continue,
                Recv::Elapsed => {
                    self.grow_timeout()?;
                    return Err(LoginStep::Restart);
                }
            }
        };

        // RAKP3 → RAKP4.
        let tag3 = self.state.next_tag();
        let rakp3_payload = rakp::rakp3(tag3, &auth, &verified);
        self.state.context = Context::ExpectingRakp4;
        self.send_payload(&rakp3_payload, PayloadType::Rakp3, false, false)
            .await?;
        loop {
            match self.recv_event().await? {
                Recv::Event(Event::Rakp(PayloadType::Rakp4, body)) => {
                    match rakp::handle_rakp4(&body, &auth, &s1, &verified, tag3) {
                        Ok(None) => continue,
                        Ok(Some(Rakp4Outcome::Status(2))) if self.logontries > 0 => {
                            // Our retried RAKP3 closed the exchange on the
                            // BMC side; only a fresh login recovers.
                            return Err(LoginStep::Restart);
                        }
                        Ok(Some(Rakp4Outcome::Status(15))) if self.logontries > 0 => continue,
                        Ok(Some(Rakp4Outcome::Status(status))) => {
                            return Err(LoginStep::Fail(
                                rakp::Error::Rakp4Status(status).into(),
                            ));
                        }
                        Ok(Some(Rakp4Outcome::Established)) => break,
                        Err(e) => return Err(LoginStep::Fail(e.into())),
                    }
                }
                Recv::Event(_) | Recv::Nothing => continue,
                Recv::Elapsed => {
                    self.grow_timeout()?;
                    return Err(LoginStep::Restart);
                }
            }
        }

        self.state.session_id = self.state.pending_session_id;
        self.state.sequence = 1;
        self.state.context = Context::Established;
        self.keys = Some(verified.keys);
        self.req_priv_level().await
    }

    fn grow_timeout(&mut self) -> Result<(), LoginStep> {
        self.timeout += Duration::from_secs(1);
        if self.timeout > self.maxtimeout {
            Err(LoginStep::Fail(IpmiError::Timeout))
        } else {
            Ok(())
        }
    }

    async fn req_priv_level(&mut self) -> Result<(), LoginStep> {
        self.logged = true;
        self.logout_expiry = None;
        let mut rsp = self
            .issue_command(0x06, 0x3b, &[self.privlevel], &CommandOpts::default())
            .await?;
        if rsp.code != 0 {
            if (rsp.code == 0x80 || rsp.code == 0x81) && self.privlevel == 4 {
                // Some BMCs let admin through RAKP and then get skittish.
                self.privlevel = 3;
                rsp = self
                    .issue_command(0x06, 0x3b, &[self.privlevel], &CommandOpts::default())
                    .await?;
            }
            if rsp.code != 0 {
                self.logged = false;
                let text = completion_text_or_unknown(rsp.code);
                return Err(LoginStep::Fail(IpmiError::Login(format!(
                    "{text} while requesting privilege level {} for {}",
                    self.privlevel, self.cfg.userid
                ))));
            }
        }
        self.reset_idle_deadline();
        Ok(())
    }

    // ── Commands ───────────────────────────────────────────────────────────

    /// Issue an IPMI command and await its response.
    pub async fn raw_command(
        &mut self,
        netfn: u8,
        command: u8,
        data: &[u8],
    ) -> Result<Response, IpmiError> {
        self.raw_command_with(netfn, command, data, CommandOpts::default())
            .await
    }

    /// Issue an IPMI command with explicit options.
    pub async fn raw_command_with(
        &mut self,
        netfn: u8,
        command: u8,
        data: &[u8],
        opts: CommandOpts,
    ) -> Result<Response, IpmiError> {
        if !self.logged {
            if let Some(expiry) = self.logout_expiry {
                if Instant::now() > expiry {
                    self.mark_broken();
                }
            }
            return Err(IpmiError::NotConnected);
        }
        self.issue_command(netfn, command, data, &opts).await
    }

    async fn issue_command(
        &mut self,
        netfn: u8,
        command: u8,
        data: &[u8],
        opts: &CommandOpts,
    ) -> Result<Response, IpmiError> {
        if self.broken {
            return Err(IpmiError::NotConnected);
        }
        if let Some(d) = opts.delay_xmit {
            sleep(d).await;
        }
        if let Some(t) = opts.timeout {
            self.timeout = t;
        }
        let built = message::build_request(&mut self.state, netfn, command, data, opts.bridge, opts.rslun);
        let seqlun = built.entries[built.entries.len() - 1].1;
        let inner = built.payload;
        self.send_payload(&inner, PayloadType::Ipmi, opts.retry, false)
            .await?;

        loop {
            let wait = if opts.retry {
                self.timeout
            } else {
                Duration::from_secs(1)
            };
            match timeout(wait, self.rx.recv()).await {
                Ok(Some(datagram)) => match self.process_datagram(&datagram).await? {
                    Some(Event::Response(rsp)) => return Ok(rsp),
                    _ => continue,
                },
                Ok(None) => {
                    self.mark_broken();
                    return Err(IpmiError::NotConnected);
                }
                Err(_) => {
                    if !opts.retry {
                        // One-shot commands surrender quietly; the session
                        // stays usable.
                        self.last_payload = None;
                        return Err(IpmiError::Timeout);
                    }
                    self.timeout += Duration::from_secs(1);
                    if self.timeout > self.maxtimeout {
                        self.mark_broken();
                        return Err(IpmiError::Timeout);
                    }
                    // The request and its reply may have crossed on the
                    // wire; retire this triple before it breeds ambiguity.
                    self.state.mark_taboo(netfn, command, seqlun);
                    self.resend_last().await?;
                }
            }
        }
    }

    // ── Event loop ─────────────────────────────────────────────────────────

    /// Process inbound traffic and due keepalives for up to `wait`.
    ///
    /// Returns after the first burst of activity or when the time is up.
    /// This is the only place an idle session does work: SOL consoles and
    /// other pumps call it in a loop.
    pub async fn wait_for_rsp(&mut self, wait: Duration) -> Result<(), IpmiError> {
        let deadline = Instant::now() + wait;
        loop {
            if self.logged && Instant::now() >= self.idle_deadline {
                self.run_keepalives().await?;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let mut slice = deadline - now;
            if self.logged && self.idle_deadline > now {
                slice = slice.min(self.idle_deadline - now);
            }
            match timeout(slice, self.rx.recv()).await {
                Ok(Some(datagram)) => {
                    self.process_datagram(&datagram).await?;
                    while let Ok(more) = self.rx.try_recv() {
                        self.process_datagram(&more).await?;
                    }
                    return Ok(());
                }
                Ok(None) => {
                    self.mark_broken();
                    return Err(IpmiError::NotConnected);
                }
                Err(_) => continue,
            }
        }
    }

    async fn run_keepalives(&mut self) -> Result<(), IpmiError> {
        if !self.logged {
            return Ok(());
        }
        if !self.custom_keepalives.is_empty() {
            let kas: Vec<(KeepaliveId, KeepaliveRequest)> = self
                .custom_keepalives
                .iter()
                .map(|(id, req)| (*id, req.clone()))
                .collect();
            for (id, req) in kas {
                let rsp = self
                    .issue_command(req.netfn, req.command, &req.data, &CommandOpts::default())
                    .await?;
                self.keepalive_events.push((id, rsp));
            }
        } else if self.cfg.keepalive {
            let _ = self
                .issue_command(0x06, 0x01, &[], &CommandOpts::default())
                .await?;
        } else {
            log::info!("[bmclink] {} idle without keepalive, logging out", self.cfg.bmc);
            self.logout().await?;
        }
        self.reset_idle_deadline();
        Ok(())
    }

    fn reset_idle_deadline(&mut self) {
        let idle = if self.cfg.keepalive {
            Duration::from_secs_f64(MAX_IDLE) - jitter(4.9)
        } else {
            Duration::from_secs(25)
        };
        self.idle_deadline = Instant::now() + idle;
    }

    // ── Keepalive registry ─────────────────────────────────────────────────

    /// Register a command to be sent in place of the default keepalive.
    ///
    /// Responses surface through [`Session::take_keepalive_events`].
    pub fn register_keepalive(&mut self, request: KeepaliveRequest) -> KeepaliveId {
        self.next_keepalive_id += 1;
        let id = KeepaliveId(self.next_keepalive_id);
        self.custom_keepalives.insert(id, request);
        id
    }

    /// Remove a registered keepalive. Unknown ids are ignored.
    pub fn unregister_keepalive(&mut self, id: KeepaliveId) {
        self.custom_keepalives.remove(&id);
    }

    /// Drain responses collected from custom keepalives.
    pub fn take_keepalive_events(&mut self) -> Vec<(KeepaliveId, Response)> {
        std::mem::take(&mut self.keepalive_events)
    }

    // ── SOL plumbing ───────────────────────────────────────────────────────

    pub(crate) fn attach_sol(&mut self) {
        self.sol_attached = true;
        self.sol_inbox.clear();
    }

    /// Detach the console link; subsequent SOL payloads become no-ops.
    pub(crate) fn detach_sol(&mut self) {
        self.sol_attached = false;
        self.sol_inbox.clear();
    }

    pub(crate) fn take_sol_inbox(&mut self) -> Vec<Vec<u8>> {
        self.sol_inbox.drain(..).collect()
    }

    pub(crate) async fn send_sol_payload(
        &mut self,
        payload: &[u8],
        needs_keepalive: bool,
    ) -> Result<(), IpmiError> {
        if !self.logged {
            return Err(IpmiError::NotConnected);
        }
        self.send_payload(payload, PayloadType::Sol, false, needs_keepalive)
            .await
    }

    // ── Transmit path ──────────────────────────────────────────────────────

    async fn send_payload(
        &mut self,
        payload: &[u8],
        ptype: PayloadType,
        retry: bool,
        needs_keepalive: bool,
    ) -> Result<(), IpmiError> {
        if !payload.is_empty() && self.last_payload.is_some() {
            // One packet outgoing at a time; a simplistic BMC gets
            // confused otherwise, and retry stays trivial.
            self.pending_payloads
                .push_back((payload.to_vec(), ptype, retry));
            return Ok(());
        }
        if retry {
            self.last_payload = Some((payload.to_vec(), ptype));
        }
        self.transmit(payload, ptype).await?;
        if !needs_keepalive {
            self.reset_idle_deadline();
        }
        Ok(())
    }

    async fn resend_last(&mut self) -> Result<(), IpmiError> {
        let (payload, ptype) = match &self.last_payload {
            Some((p, t)) => (p.clone(), *t),
            None => return Ok(()),
        };
        self.transmit(&payload, ptype).await
    }

    async fn transmit(&mut self, payload: &[u8], ptype: PayloadType) -> Result<(), IpmiError> {
        let frame = match self.ipmi_version {
            IpmiVersion::V15 => {
                let sequence = self.state.next_xmit_sequence();
                let authcode = if self.state.authtype == 2 {
                    Some(
                        md5_authcode(&self.password, self.state.session_id, sequence, payload)
                            .map_err(|e| IpmiError::InvalidArgument(e.to_string()))?,
                    )
                } else {
                    None
                };
                packet::encode_v15(
                    self.state.authtype,
                    sequence,
                    self.state.session_id,
                    authcode.as_ref(),
                    payload,
                )
            }
            IpmiVersion::V20 => {
                let sequence = self.state.next_xmit_sequence();
                let prot = self.keys.as_ref().map(|k| Protection {
                    alg: k.alg(),
                    k1: k.k1(),
                    aes_key: k.aes_key(),
                });
                packet::encode_v20(
                    ptype,
                    self.state.session_id,
                    sequence,
                    payload,
                    prot.as_ref(),
                )
            }
        };
        self.socket.send_to(&frame, self.peer).await?;
        Ok(())
    }

    // ── Receive path ───────────────────────────────────────────────────────

    async fn recv_event(&mut self) -> Result<Recv, LoginStep> {
        match timeout(self.timeout, self.rx.recv()).await {
            Ok(Some(datagram)) => match self
                .process_datagram(&datagram)
                .await
                .map_err(LoginStep::Fail)?
            {
                Some(event) => Ok(Recv::Event(event)),
                None => Ok(Recv::Nothing),
            },
            Ok(None) => Err(LoginStep::Fail(IpmiError::NotConnected)),
            Err(_) => Ok(Recv::Elapsed),
        }
    }

    async fn process_datagram(&mut self, data: &[u8]) -> Result<Option<Event>, IpmiError> {
        let inbound = {
            let ctx = InboundCtx {
                localsid: self.state.localsid,
                keys: self.keys.as_ref().map(|k| Protection {
                    alg: k.alg(),
                    k1: k.k1(),
                    aes_key: k.aes_key(),
                }),
                v15_authtype: self.state.authtype,
                v15_session_id: self.state.session_id,
                password: &self.password,
                last_remote_sequence: self.state.remote_sequence,
            };
            match packet::decode(data, &ctx) {
                Some(inbound) => inbound,
                None => return Ok(None),
            }
        };
        match inbound {
            Inbound::Ipmi { sequence, payload } => {
                self.state.accept_remote_sequence(sequence);
                match message::dispatch(&mut self.state, &payload) {
                    Dispatch::Response(rsp) => {
                        self.timeout = Duration::from_secs_f64(INITIAL_TIMEOUT) + jitter(0.5);
                        self.flush_pending().await?;
                        Ok(Some(Event::Response(rsp)))
                    }
                    Dispatch::BridgeConfirmed | Dispatch::Unmatched => Ok(None),
                }
            }
            Inbound::Sol { sequence, payload } => {
                self.state.accept_remote_sequence(sequence);
                if payload.len() >= 2
                    && payload[1] & 0x0f != 0
                    && matches!(self.last_payload, Some((_, PayloadType::Sol)))
                {
                    // The remote acknowledged a retried SOL frame; stop the
                    // generic retry and let the SOL engine take over.
                    self.flush_pending().await?;
                }
                if self.sol_attached {
                    self.sol_inbox.push_back(payload);
                }
                Ok(None)
            }
            Inbound::Rakp { ptype, body } => Ok(Some(Event::Rakp(ptype, body))),
        }
    }

    async fn flush_pending(&mut self) -> Result<(), IpmiError> {
        self.last_payload = None;
        if let Some((payload, ptype, retry)) = self.pending_payloads.pop_front() {
            self.send_payload(&payload, ptype, retry, false).await?;
        }
        Ok(())
    }

    // ── Teardown ───────────────────────────────────────────────────────────

    fn mark_broken(&mut self) {
        self.last_payload = None;
        self.pending_payloads.clear();
        self.logged = false;
        self.broken = true;
    }

    /// Log out of the BMC. Safe to call repeatedly.
    pub async fn logout(&mut self) -> Result<(), IpmiError> {
        if !self.logged {
            return Ok(());
        }
        if self.sol_attached {
            let _ = self
                .issue_command(
                    0x06,
                    0x49,
                    &[1, 1, 0, 0, 0, 0],
                    &CommandOpts { retry: false, ..Default::default() },
                )
                .await;
        }
        let sid = self.state.session_id.to_le_bytes();
        let _ = self
            .issue_command(
                0x06,
                0x3c,
                &sid,
                &CommandOpts { retry: false, ..Default::default() },
            )
            .await;
        log::info!("[bmclink] {} logged out", self.cfg.bmc);
        self.last_payload = None;
        self.custom_keepalives.clear();
        self.logged = false;
        self.broken = true;
        Ok(())
    }
}
