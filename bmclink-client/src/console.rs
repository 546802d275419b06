//! Serial-over-LAN console on top of [`Session`].
//!
//! The console multiplexes an interactive byte stream with the IPMI
//! commands riding the same session. [`Console`] is the client side; the
//! minimal [`ServerConsole`] echoes the server role over an established
//! session.

use std::time::Duration;

use tokio::time::Instant;

use bmclink_proto::codes::completion_text;
use bmclink_proto::sol::{self, SolEngine, SolEvent};

use std::sync::Arc;

use crate::errors::IpmiError;
use crate::reactor::Reactor;
use crate::session::{CommandOpts, KeepaliveId, KeepaliveRequest, Session, SessionConfig};

/// SOL retransmit attempts before the link is declared lost.
const SOL_RETRIES: u32 = 5;

/// Something the console has for its owner.
#[derive(Clone, Debug, PartialEq)]
pub enum ConsoleEvent {
    /// Console output bytes, deduplicated and in order.
    Data(Vec<u8>),
    /// A condition worth relaying that does not end the session.
    Info(String),
    /// A terminal condition; the console is broken afterwards.
    Error(String),
}

/// Connection parameters for [`Console::connect`].
#[derive(Clone)]
pub struct ConsoleConfig {
    /// Underlying session parameters.
    pub session: SessionConfig,
    /// Forcibly deactivate a SOL session another client holds.
    pub force: bool,
}

impl ConsoleConfig {
    /// Console config with the usual defaults.
    pub fn new(
        bmc: impl Into<String>,
        userid: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            session: SessionConfig::new(bmc, userid, password),
            force: false,
        }
    }
}

#[derive(Debug)]
struct RetryState {
    retries_left: u32,
    deadline: Instant,
}

/// An interactive SOL console.
///
/// Writes go through [`Console::send_data`] / [`Console::send_break`];
/// output and conditions arrive at the `iohandler` callback while
/// [`Console::step`] (or [`Console::run`]) pumps the session.
pub struct Console {
    session: Session,
    handler: Box<dyn FnMut(ConsoleEvent) + Send>,
    engine: SolEngine,
    keepalive_id: Option<KeepaliveId>,
    retry: Option<RetryState>,
    broken: bool,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("session", &self.session)
            .field("engine", &self.engine)
            .field("keepalive_id", &self.keepalive_id)
            .field("retry", &self.retry)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Console {
    /// Log in, activate the SOL payload and wire up the console.
    pub async fn connect(
        cfg: ConsoleConfig,
        iohandler: impl FnMut(ConsoleEvent) + Send + 'static,
    ) -> Result<Self, IpmiError> {
        Self::connect_with(cfg, Reactor::shared(), iohandler).await
    }

    /// Like [`Console::connect`], on an explicit reactor.
    pub async fn connect_with(
        cfg: ConsoleConfig,
        reactor: Arc<Reactor>,
        iohandler: impl FnMut(ConsoleEvent) + Send + 'static,
    ) -> Result<Self, IpmiError> {
        let mut session = Session::connect_with(cfg.session, reactor).await?;
        let max_outbound = activate_sol(&mut session, cfg.force).await?;
        session.attach_sol();
        let keepalive_id = session.register_keepalive(KeepaliveRequest {
            netfn: 0x06,
            command: 0x4b,
            data: vec![1, 1],
        });
        log::info!(
            "[bmclink] SOL activated (max {max_outbound} chars per frame)"
        );
        Ok(Self {
            session,
            handler: Box::new(iohandler),
            engine: SolEngine::new(max_outbound),
            keepalive_id: Some(keepalive_id),
            retry: None,
            broken: false,
        })
    }

    /// Whether the console has failed terminally.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Queue console input for the remote serial port.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<(), IpmiError> {
        if self.broken {
            return Ok(());
        }
        self.engine.queue_data(data);
        self.pump_output().await
    }

    /// Queue a serial break.
    pub async fn send_break(&mut self) -> Result<(), IpmiError> {
        if self.broken {
            return Ok(());
        }
        self.engine.queue_break();
        self.pump_output().await
    }

    /// Pump the console once: process inbound traffic, keepalives and the
    /// retransmit timer. Call in a loop, or use [`Console::run`].
    pub async fn step(&mut self) -> Result<(), IpmiError> {
        if self.broken {
            return Err(IpmiError::NotConnected);
        }
        let mut wait = Duration::from_millis(500);
        if let Some(retry) = &self.retry {
            let now = Instant::now();
            if retry.deadline > now {
                wait = wait.min(retry.deadline - now);
            } else {
                wait = Duration::ZERO;
            }
        }
        if let Err(e) = self.session.wait_for_rsp(wait).await {
            let text = e.to_string();
            self.fail(text);
            return Err(e);
        }
        if !self.session.is_logged() {
            // Logged out underneath us, e.g. by an idle logout.
            self.fail("Session Disconnected");
            return Ok(());
        }
        for payload in self.session.take_sol_inbox() {
            self.handle_sol_payload(payload).await?;
            if self.broken {
                return Ok(());
            }
        }
        self.check_keepalive_events();
        self.check_retry_deadline().await?;
        Ok(())
    }

    /// Pump until the console breaks.
    pub async fn run(&mut self) -> Result<(), IpmiError> {
        while !self.broken {
            self.step().await?;
        }
        Ok(())
    }

    /// Deactivate the payload and detach from the session.
    pub async fn close(&mut self) {
        if let Some(id) = self.keepalive_id.take() {
            self.session.unregister_keepalive(id);
        }
        if !self.broken && self.engine.activated && self.session.is_logged() {
            let _ = self
                .session
                .raw_command_with(
                    0x06,
                    0x49,
                    &[1, 1, 0, 0, 0, 0],
                    CommandOpts { retry: false, ..Default::default() },
                )
                .await;
        }
        self.session.detach_sol();
        self.broken = true;
    }

    /// Give the session back, e.g. to issue commands after closing.
    pub fn into_session(self) -> Session {
        self.session
    }

    // ── Internals ──────────────────────────────────────────────────────────

    async fn handle_sol_payload(&mut self, payload: Vec<u8>) -> Result<(), IpmiError> {
        let actions = self.engine.handle_inbound(&payload);
        if !actions.deliver.is_empty() {
            self.emit(ConsoleEvent::Data(actions.deliver));
        }
        if let Some(ack) = actions.ack {
            if let Err(e) = self.session.send_sol_payload(&ack, false).await {
                // A dead session underneath ends the console.
                self.fail(e.to_string());
                return Ok(());
            }
        }
        for event in actions.events {
            match event {
                SolEvent::PoweredDown => {
                    self.emit(ConsoleEvent::Info("Remote system is powered down".into()));
                }
                SolEvent::Deactivated => {
                    self.fail("Remote IPMI console disconnected");
                    return Ok(());
                }
            }
        }
        if let Some(resend) = actions.resend {
            self.session
                .send_sol_payload(&resend.payload, resend.needs_keepalive)
                .await?;
        }
        if actions.ready_to_send {
            self.retry = None;
            self.pump_output().await?;
        }
        Ok(())
    }

    async fn pump_output(&mut self) -> Result<(), IpmiError> {
        if let Some(out) = self.engine.next_outbound() {
            self.session
                .send_sol_payload(&out.payload, out.needs_keepalive)
                .await?;
            self.retry = Some(RetryState {
                retries_left: SOL_RETRIES,
                deadline: Instant::now()
                    + Duration::from_secs_f64(5.5 - SOL_RETRIES as f64),
            });
        }
        Ok(())
    }

    async fn check_retry_deadline(&mut self) -> Result<(), IpmiError> {
        if !self.engine.awaiting_ack() {
            self.retry = None;
            return Ok(());
        }
        let retries_left = match &self.retry {
            Some(r) if Instant::now() >= r.deadline => r.retries_left,
            _ => return Ok(()),
        };
        if retries_left == 0 {
            self.fail("Connection lost");
            return Ok(());
        }
        if let Some(retry) = self.retry.as_mut() {
            retry.retries_left = retries_left - 1;
            let wait = 5.5 - retry.retries_left as f64;
            retry.deadline = Instant::now() + Duration::from_secs_f64(wait);
        }
        if let Some(out) = self.engine.retry_payload() {
            self.session
                .send_sol_payload(&out.payload, out.needs_keepalive)
                .await?;
        }
        Ok(())
    }

    fn check_keepalive_events(&mut self) {
        let events = self.session.take_keepalive_events();
        for (id, rsp) in events {
            if Some(id) != self.keepalive_id {
                continue;
            }
            if rsp.code != 0 || rsp.data.len() < 4 {
                self.fail("SOL deactivated");
                return;
            }
            let owner = u32::from_le_bytes(rsp.data[0..4].try_into().unwrap());
            if owner != self.session.session_id() {
                // The payload belongs to someone else now.
                self.fail("SOL deactivated");
                return;
            }
        }
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.broken = true;
        self.engine.activated = false;
        if let Some(id) = self.keepalive_id.take() {
            self.session.unregister_keepalive(id);
        }
        self.session.detach_sol();
        self.emit(ConsoleEvent::Error(message.into()));
    }

    fn emit(&mut self, event: ConsoleEvent) {
        (self.handler)(event);
    }
}

/// Activate the SOL payload, handling the in-use and named error codes.
async fn activate_sol(session: &mut Session, force: bool) -> Result<usize, IpmiError> {
    let mut retried = false;
    loop {
        // payload type 1, first instance, encrypt + authenticate.
        let rsp = session
            .raw_command(0x06, 0x48, &[1, 1, 0b1100_0000, 0, 0, 0])
            .await?;
        match rsp.code {
            0 => {
                let info = sol::parse_activation(&rsp.data).ok_or_else(|| {
                    IpmiError::Sol("Short activate payload response".into())
                })?;
                // Some BMCs disagree on the endianness of the port field;
                // accept either reading.
                let port = session.port();
                if info.port != port && info.port.swap_bytes() != port {
                    return Err(IpmiError::Unsupported(
                        "Non-standard SOL Port Number".into(),
                    ));
                }
                return Ok(info.max_outbound);
            }
            0x80 => {
                if force && !retried {
                    retried = true;
                    session.raw_command(0x06, 0x49, &[1, 1, 0, 0, 0, 0]).await?;
                    continue;
                }
                return Err(IpmiError::Sol("SOL Session active for another client".into()));
            }
            0x81 => return Err(IpmiError::Sol("SOL is disabled".into())),
            0x82 => {
                return Err(IpmiError::Sol("Maximum SOL session count reached".into()))
            }
            0x83 => {
                return Err(IpmiError::Sol(
                    "Cannot activate payload with encryption".into(),
                ))
            }
            0x84 => {
                return Err(IpmiError::Sol(
                    "Cannot activate payload without encryption".into(),
                ))
            }
            code => {
                return Err(match completion_text(code) {
                    Some(text) => IpmiError::Sol(text.into()),
                    None => IpmiError::Sol(format!(
                        "SOL encountered Unrecognized error code {code}"
                    )),
                })
            }
        }
    }
}

// ─── ServerConsole ───────────────────────────────────────────────────────────

/// The server role of the SOL conversation, good for echo peers and tests:
/// acks before delivery and reflects power/activation state in its ack
/// flags.
pub struct ServerConsole {
    session: Session,
    handler: Box<dyn FnMut(ConsoleEvent) + Send>,
    engine: SolEngine,
}

impl ServerConsole {
    /// Ride an established session in the server role.
    pub fn new(
        mut session: Session,
        iohandler: impl FnMut(ConsoleEvent) + Send + 'static,
    ) -> Self {
        session.attach_sol();
        Self {
            session,
            handler: Box::new(iohandler),
            engine: SolEngine::server(),
        }
    }

    /// Reflect host power state in subsequent acks.
    pub fn set_powered_on(&mut self, powered_on: bool) {
        self.engine.powered_on = powered_on;
    }

    /// Queue bytes for the remote console.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<(), IpmiError> {
        self.engine.queue_data(data);
        self.pump_output().await
    }

    /// Pump the server console once.
    pub async fn step(&mut self) -> Result<(), IpmiError> {
        self.session.wait_for_rsp(Duration::from_millis(500)).await?;
        for payload in self.session.take_sol_inbox() {
            let actions = self.engine.handle_inbound(&payload);
            // Server role acks first, then hands the bytes up.
            if let Some(ack) = actions.ack {
                self.session.send_sol_payload(&ack, false).await?;
            }
            if !actions.deliver.is_empty() {
                (self.handler)(ConsoleEvent::Data(actions.deliver));
            }
            if let Some(resend) = actions.resend {
                self.session
                    .send_sol_payload(&resend.payload, resend.needs_keepalive)
                    .await?;
            }
            if actions.ready_to_send {
                self.pump_output().await?;
            }
        }
        Ok(())
    }

    async fn pump_output(&mut self) -> Result<(), IpmiError> {
        if let Some(out) = self.engine.next_outbound() {
            self.session
                .send_sol_payload(&out.payload, out.needs_keepalive)
                .await?;
        }
        Ok(())
    }
}
