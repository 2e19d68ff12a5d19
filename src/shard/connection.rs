//! Shard connection state machine
//!
//! One `ShardConnection` owns one transport at a time, its heartbeat cycle
//! and its resume state. Every state is a `Step` variant and `transition`
//! is the only place that moves between them:
//!
//! ```text
//! Connect -> Handshake -> Identify | Resume -> Session -> Reconnect -> Connect ...
//!                                                    \-> Close (terminal)
//! ```
//!
//! Transport errors, stale heartbeats and resumable close codes loop back
//! through `Reconnect`; fatal close codes and an exhausted reconnect budget
//! end in `Close`. Cancellation is observed at every await point.

use crate::config::SessionPolicy;
use crate::error::GatewayError;
use crate::events::{DispatchEvent, Event, LifecycleEvent, ShardExit};
use crate::intents::Intents;
use crate::limiter::{IdentifyLimiter, IdentifyTicket};
use crate::metrics::GatewayMetrics;
use crate::protocol::{
    build_heartbeat, build_identify, build_resume, classify_close, CloseAction, GatewayFrame,
    GatewayPayload, ReadyPayload,
};
use crate::protocol::event_type::{READY, RESUMED};
use crate::shard::backoff::Backoff;
use crate::shard::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::shard::session::{SessionState, ShardSpec};
use crate::shard::state::{ShardState, ShardStatus};
use crate::shard::transport::{CloseInfo, Connector, Inbound, Transport};
use crate::token::{Token, TokenSource};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type Conn = Box<dyn Transport>;

/// Collaborators shared by every shard of one manager start
#[derive(Clone)]
pub struct ShardContext {
    /// Gateway endpoint used when there is no resume url
    pub endpoint: String,
    pub token: Arc<dyn TokenSource>,
    pub intents: Intents,
    pub limiter: Arc<IdentifyLimiter>,
    pub connector: Arc<dyn Connector>,
    pub policy: SessionPolicy,
    pub state: ShardState,
    pub metrics: GatewayMetrics,
}

/// Which handshake reply the session loop is still waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Ready,
    Resumed,
    Nothing,
}

impl Awaiting {
    fn stage(self) -> &'static str {
        match self {
            Awaiting::Ready => "READY",
            Awaiting::Resumed => "RESUMED",
            Awaiting::Nothing => "nothing",
        }
    }
}

enum Step {
    Connect,
    Handshake {
        conn: Conn,
        ticket: Option<IdentifyTicket>,
    },
    Identify {
        conn: Conn,
        heartbeat: Duration,
        ticket: IdentifyTicket,
    },
    Resume {
        conn: Conn,
        heartbeat: Duration,
    },
    Session {
        conn: Conn,
        heartbeat: Duration,
        awaiting: Awaiting,
    },
    /// `keep_session` decides whether the next handshake resumes
    Reconnect {
        keep_session: bool,
        reason: String,
    },
    Close(ShardExit),
}

/// Why no token came back for a handshake
enum FetchFailed {
    Stopped,
    Error(GatewayError),
}

/// What woke the session loop
enum Wake {
    Cancelled,
    HandshakeExpired,
    Tick,
    Inbound(Option<Result<Inbound, GatewayError>>),
}

/// One shard's gateway connection
pub struct ShardConnection {
    spec: ShardSpec,
    ctx: ShardContext,
    session: Option<SessionState>,
    /// Ticket held from the identify until the shard leaves `Identifying`
    identify_slot: Option<IdentifyTicket>,
    events: mpsc::UnboundedSender<Event>,
    backoff: Backoff,
    /// Consecutive connection cycles that failed to reach Ready
    attempts: u32,
}

impl ShardConnection {
    pub fn new(spec: ShardSpec, ctx: ShardContext, events: mpsc::UnboundedSender<Event>) -> Self {
        let backoff = Backoff::new(ctx.policy.backoff_base, ctx.policy.backoff_max);
        Self {
            spec,
            ctx,
            session: None,
            identify_slot: None,
            events,
            backoff,
            attempts: 0,
        }
    }

    pub fn spec(&self) -> ShardSpec {
        self.spec
    }

    /// Drive the shard until it is stopped or gives up.
    ///
    /// Dropping the connection at the end closes its event channel, which
    /// lets the shard's dispatcher drain and finish.
    pub async fn run(mut self, cancel: CancellationToken) -> ShardExit {
        info!(
            shard_id = self.spec.shard_id,
            total_shards = self.spec.total_shards,
            "Shard starting"
        );

        let mut step = Step::Connect;
        loop {
            step = match step {
                Step::Close(exit) => return self.close(exit),
                step => self.transition(step, &cancel).await,
            };
        }
    }

    async fn transition(&mut self, step: Step, cancel: &CancellationToken) -> Step {
        match step {
            Step::Connect => self.connect(cancel).await,
            Step::Handshake { conn, ticket } => self.handshake(conn, ticket, cancel).await,
            Step::Identify {
                conn,
                heartbeat,
                ticket,
            } => self.identify(conn, heartbeat, ticket, cancel).await,
            Step::Resume { conn, heartbeat } => self.resume(conn, heartbeat, cancel).await,
            Step::Session {
                conn,
                heartbeat,
                awaiting,
            } => self.session(conn, heartbeat, awaiting, cancel).await,
            Step::Reconnect {
                keep_session,
                reason,
            } => self.reconnect(keep_session, reason, cancel).await,
            Step::Close(exit) => Step::Close(exit),
        }
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> Step {
        self.set_status(ShardStatus::Connecting);

        // Without a session the identify follows Hello immediately, so the
        // ticket is taken before dialing.
        let ticket = if self.session.is_none() {
            match self.acquire_ticket(cancel).await {
                Ok(ticket) => Some(ticket),
                Err(step) => return step,
            }
        } else {
            None
        };

        let url = self
            .session
            .as_ref()
            .and_then(SessionState::resume_url)
            .unwrap_or(self.ctx.endpoint.as_str())
            .to_string();

        debug!(shard_id = self.spec.shard_id, url = %url, "Dialing gateway");

        let dial = timeout(self.ctx.policy.dial_timeout, self.ctx.connector.connect(&url));
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Step::Close(ShardExit::Stopped),
            result = dial => result,
        };

        match result {
            Ok(Ok(conn)) => Step::Handshake { conn, ticket },
            Ok(Err(e)) => self.recoverable(e, true),
            Err(_) => self.recoverable(GatewayError::Timeout { stage: "dial" }, true),
        }
    }

    async fn handshake(
        &mut self,
        mut conn: Conn,
        ticket: Option<IdentifyTicket>,
        cancel: &CancellationToken,
    ) -> Step {
        let deadline = Instant::now() + self.ctx.policy.handshake_timeout;

        loop {
            let inbound = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                _ = sleep_until(deadline) => Some(None),
                inbound = conn.recv() => Some(Some(inbound)),
            };

            let inbound = match inbound {
                None => {
                    conn.close().await;
                    return Step::Close(ShardExit::Stopped);
                }
                Some(None) => {
                    conn.close().await;
                    return self.recoverable(GatewayError::Timeout { stage: "hello" }, true);
                }
                Some(Some(inbound)) => inbound,
            };

            let text = match inbound {
                Some(Ok(Inbound::Text(text))) => text,
                Some(Ok(Inbound::Closed(info))) => return self.on_close(info),
                Some(Err(e)) => return self.recoverable(e, true),
                None => {
                    return self.recoverable(
                        GatewayError::Transport("stream ended before hello".to_string()),
                        true,
                    )
                }
            };

            match GatewayFrame::decode(&text) {
                Ok(GatewayFrame::Hello(hello)) => {
                    let heartbeat = Duration::from_millis(hello.heartbeat_interval.max(1));
                    debug!(
                        shard_id = self.spec.shard_id,
                        heartbeat_ms = hello.heartbeat_interval,
                        "Hello received"
                    );
                    return match ticket {
                        Some(ticket) if self.session.is_none() => Step::Identify {
                            conn,
                            heartbeat,
                            ticket,
                        },
                        _ => Step::Resume { conn, heartbeat },
                    };
                }
                Ok(frame) => {
                    debug!(shard_id = self.spec.shard_id, ?frame, "Ignoring frame before hello");
                }
                Err(e) => self.skip_malformed(&e),
            }
        }
    }

    async fn identify(
        &mut self,
        mut conn: Conn,
        heartbeat: Duration,
        ticket: IdentifyTicket,
        cancel: &CancellationToken,
    ) -> Step {
        // The slot is given back by the next status change
        self.identify_slot = Some(ticket);
        self.set_status(ShardStatus::Identifying);

        let token = match self.fetch_token(&mut conn, cancel).await {
            Ok(token) => token,
            Err(FetchFailed::Stopped) => return Step::Close(ShardExit::Stopped),
            Err(FetchFailed::Error(e)) => return self.recoverable(e, false),
        };

        let payload = build_identify(
            &token.authorization(),
            self.ctx.intents,
            self.spec.shard_id,
            self.spec.total_shards,
        );
        if let Err(step) = self.send(&mut conn, &payload).await {
            return step;
        }
        self.ctx.metrics.record_identify(self.spec.shard_id);

        info!(
            shard_id = self.spec.shard_id,
            intents = %self.ctx.intents,
            "Identify sent"
        );

        Step::Session {
            conn,
            heartbeat,
            awaiting: Awaiting::Ready,
        }
    }

    async fn resume(&mut self, mut conn: Conn, heartbeat: Duration, cancel: &CancellationToken) -> Step {
        let Some((session_id, seq)) = self
            .session
            .as_ref()
            .map(|s| (s.session_id().to_string(), s.last_sequence()))
        else {
            conn.close().await;
            return Step::Reconnect {
                keep_session: false,
                reason: "no session to resume".to_string(),
            };
        };

        self.set_status(ShardStatus::Resuming);

        let token = match self.fetch_token(&mut conn, cancel).await {
            Ok(token) => token,
            Err(FetchFailed::Stopped) => return Step::Close(ShardExit::Stopped),
            Err(FetchFailed::Error(e)) => return self.recoverable(e, true),
        };

        let payload = build_resume(&token.authorization(), &session_id, seq);
        if let Err(step) = self.send(&mut conn, &payload).await {
            return step;
        }
        self.ctx.metrics.record_resume(self.spec.shard_id);

        info!(
            shard_id = self.spec.shard_id,
            session_id = %session_id,
            seq,
            "Resume sent"
        );

        Step::Session {
            conn,
            heartbeat,
            awaiting: Awaiting::Resumed,
        }
    }

    async fn session(
        &mut self,
        mut conn: Conn,
        heartbeat: Duration,
        mut awaiting: Awaiting,
        cancel: &CancellationToken,
    ) -> Step {
        let shard_id = self.spec.shard_id;
        let mut monitor = HeartbeatMonitor::new(self.ctx.policy.heartbeat_miss_threshold);
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline =
            (awaiting != Awaiting::Nothing).then(|| Instant::now() + self.ctx.policy.handshake_timeout);

        loop {
            let handshake_expired = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = handshake_expired => Wake::HandshakeExpired,
                _ = ticker.tick() => Wake::Tick,
                inbound = conn.recv() => Wake::Inbound(inbound),
            };

            let inbound = match wake {
                Wake::Cancelled => {
                    conn.close().await;
                    return Step::Close(ShardExit::Stopped);
                }
                Wake::HandshakeExpired => {
                    conn.close().await;
                    return self.recoverable(
                        GatewayError::Timeout {
                            stage: awaiting.stage(),
                        },
                        true,
                    );
                }
                Wake::Tick => {
                    if monitor.on_tick() == HeartbeatAction::Stale {
                        warn!(
                            shard_id,
                            missed = monitor.missed(),
                            "Heartbeat acknowledgements missed, connection is stale"
                        );
                        conn.close().await;
                        return Step::Reconnect {
                            keep_session: true,
                            reason: "heartbeat acknowledgements missed".to_string(),
                        };
                    }
                    if let Err(step) = self.send_heartbeat(&mut conn, &mut monitor).await {
                        return step;
                    }
                    continue;
                }
                Wake::Inbound(inbound) => inbound,
            };

            let text = match inbound {
                Some(Ok(Inbound::Text(text))) => text,
                Some(Ok(Inbound::Closed(info))) => return self.on_close(info),
                Some(Err(e)) => return self.recoverable(e, true),
                None => {
                    return self.recoverable(
                        GatewayError::Transport("gateway stream ended".to_string()),
                        true,
                    )
                }
            };

            let frame = match GatewayFrame::decode(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    self.skip_malformed(&e);
                    continue;
                }
            };

            match frame {
                GatewayFrame::Dispatch {
                    sequence,
                    event_type,
                    event_id,
                    data,
                } => {
                    if self.on_dispatch(sequence, event_type, event_id, data, awaiting) {
                        awaiting = Awaiting::Nothing;
                        deadline = None;
                    }
                }
                GatewayFrame::Heartbeat => {
                    debug!(shard_id, "Server requested heartbeat");
                    if let Err(step) = self.send_heartbeat(&mut conn, &mut monitor).await {
                        return step;
                    }
                }
                GatewayFrame::HeartbeatAck => {
                    let latency = monitor.on_ack(Instant::now());
                    self.ctx.state.record_heartbeat(shard_id);
                    self.ctx.metrics.record_heartbeat(shard_id, latency);
                }
                GatewayFrame::Reconnect => {
                    info!(shard_id, "Server requested reconnect");
                    conn.close().await;
                    return Step::Reconnect {
                        keep_session: true,
                        reason: "server requested reconnect".to_string(),
                    };
                }
                GatewayFrame::InvalidSession { resumable } => {
                    warn!(
                        shard_id,
                        resumable,
                        awaiting = awaiting.stage(),
                        "Session invalidated by gateway"
                    );
                    self.record_error(&GatewayError::SessionInvalid { shard_id });

                    match (awaiting, resumable) {
                        // A refused resume also reconnects, so the next
                        // identify waits for its ticket off the socket.
                        (Awaiting::Ready, _) | (Awaiting::Resumed | Awaiting::Nothing, false) => {
                            conn.close().await;
                            return Step::Reconnect {
                                keep_session: false,
                                reason: "session invalidated".to_string(),
                            };
                        }
                        (_, true) => {
                            conn.close().await;
                            return Step::Reconnect {
                                keep_session: true,
                                reason: "session invalidated (resumable)".to_string(),
                            };
                        }
                    }
                }
                GatewayFrame::Hello(_) => {
                    debug!(shard_id, "Ignoring repeated hello");
                }
                GatewayFrame::Other { op } => {
                    debug!(shard_id, op, "Ignoring opcode");
                }
            }
        }
    }

    /// Handle one dispatch. Returns true when it completed the handshake.
    fn on_dispatch(
        &mut self,
        sequence: Option<u64>,
        event_type: String,
        event_id: Option<String>,
        data: Value,
        awaiting: Awaiting,
    ) -> bool {
        let shard_id = self.spec.shard_id;

        if event_type == READY {
            let ready: ReadyPayload = match serde_json::from_value(data.clone()) {
                Ok(ready) => ready,
                Err(e) => {
                    self.skip_malformed(&GatewayError::MalformedFrame(e));
                    return false;
                }
            };

            let session = SessionState::new(ready.session_id, sequence, ready.resume_gateway_url);
            let session_id = session.session_id().to_string();
            self.ctx
                .state
                .set_session(shard_id, Some(&session_id), Some(session.last_sequence()));
            self.session = Some(session);
            self.mark_ready();

            info!(shard_id, session_id = %session_id, "Shard ready");

            self.forward(sequence, event_type, event_id, data);
            self.emit(Event::Lifecycle(LifecycleEvent::Ready {
                shard_id,
                session_id,
            }));
            return true;
        }

        if event_type == RESUMED {
            let Some(session) = self.session.as_mut() else {
                warn!(shard_id, "RESUMED without a session, ignoring");
                return false;
            };
            let sequence = sequence.filter(|seq| session.advance(*seq));
            let session_id = session.session_id().to_string();
            let last_sequence = session.last_sequence();
            self.ctx
                .state
                .set_session(shard_id, Some(&session_id), Some(last_sequence));
            self.mark_ready();

            info!(
                shard_id,
                session_id = %session_id,
                seq = last_sequence,
                was_awaiting = awaiting == Awaiting::Resumed,
                "Session resumed"
            );

            self.forward(sequence, event_type, event_id, data);
            self.emit(Event::Lifecycle(LifecycleEvent::Resumed {
                shard_id,
                session_id,
                sequence: last_sequence,
            }));
            return true;
        }

        if let (Some(session), Some(seq)) = (self.session.as_mut(), sequence) {
            if !session.advance(seq) {
                debug!(
                    shard_id,
                    seq,
                    last = session.last_sequence(),
                    "Dropping replayed dispatch"
                );
                return false;
            }
        }

        self.forward(sequence, event_type, event_id, data);
        false
    }

    fn forward(&self, sequence: Option<u64>, event_type: String, event_id: Option<String>, data: Value) {
        let shard_id = self.spec.shard_id;
        self.ctx.state.record_event(shard_id, sequence);
        self.ctx.metrics.record_event(shard_id, &event_type);

        self.emit(Event::Dispatch(DispatchEvent {
            shard_id,
            sequence,
            event_type,
            event_id: event_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            data,
        }));
    }

    async fn reconnect(&mut self, keep_session: bool, reason: String, cancel: &CancellationToken) -> Step {
        let shard_id = self.spec.shard_id;

        if !keep_session {
            self.discard_session();
        }
        let resumable = self.session.is_some();

        self.set_status(ShardStatus::Disconnected);
        self.ctx.state.record_reconnect(shard_id);
        self.ctx.metrics.record_reconnect(shard_id, resumable);
        self.emit(Event::Lifecycle(LifecycleEvent::Disconnected {
            shard_id,
            resumable,
            reason: reason.clone(),
        }));

        self.attempts += 1;
        if self.attempts >= self.ctx.policy.max_reconnect_attempts {
            error!(
                shard_id,
                attempts = self.attempts,
                reason = %reason,
                "Shard reconnect budget exhausted"
            );
            return Step::Close(ShardExit::Failed {
                attempts: self.attempts,
                reason,
            });
        }

        let delay = self.backoff.next_delay();
        warn!(
            shard_id,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            resumable,
            reason = %reason,
            "Shard disconnected, reconnecting"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Close(ShardExit::Stopped),
            _ = sleep(delay) => Step::Connect,
        }
    }

    fn close(&mut self, exit: ShardExit) -> ShardExit {
        let shard_id = self.spec.shard_id;
        self.set_status(ShardStatus::Closing);

        let detail = match &exit {
            ShardExit::Stopped => exit.label().to_string(),
            ShardExit::FatalAuth { code, reason } => format!("fatal_auth ({code}): {reason}"),
            ShardExit::Failed { attempts, reason } => {
                format!("failed after {attempts} attempts: {reason}")
            }
        };
        self.ctx.state.set_exit(shard_id, Some(detail));

        if let Some(err) = exit.clone().into_error(shard_id) {
            self.record_error(&err);
        }
        info!(shard_id, exit = exit.label(), "Shard closed");

        self.emit(Event::Lifecycle(LifecycleEvent::Closed {
            shard_id,
            exit: exit.clone(),
        }));
        exit
    }

    fn on_close(&mut self, info: Option<CloseInfo>) -> Step {
        let shard_id = self.spec.shard_id;
        let Some(CloseInfo { code, reason }) = info else {
            return Step::Reconnect {
                keep_session: true,
                reason: "closed without close frame".to_string(),
            };
        };

        match classify_close(code) {
            CloseAction::Fatal => {
                error!(shard_id, code, reason = %reason, "Gateway rejected shard");
                Step::Close(ShardExit::FatalAuth { code, reason })
            }
            CloseAction::Reidentify => {
                info!(shard_id, code, reason = %reason, "Gateway closed session");
                Step::Reconnect {
                    keep_session: false,
                    reason: format!("closed with code {code}"),
                }
            }
            CloseAction::Resume => {
                info!(shard_id, code, reason = %reason, "Gateway closed connection");
                Step::Reconnect {
                    keep_session: true,
                    reason: format!("closed with code {code}"),
                }
            }
        }
    }

    /// Token for the next handshake payload; closes `conn` on failure
    async fn fetch_token(&self, conn: &mut Conn, cancel: &CancellationToken) -> Result<Token, FetchFailed> {
        let fetch = timeout(self.ctx.policy.handshake_timeout, self.ctx.token.token());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = fetch => Some(result),
        };

        let failed = match result {
            Some(Ok(Ok(token))) => return Ok(token),
            None => FetchFailed::Stopped,
            Some(Ok(Err(e))) => FetchFailed::Error(e),
            Some(Err(_)) => FetchFailed::Error(GatewayError::Timeout { stage: "token" }),
        };
        conn.close().await;
        Err(failed)
    }

    async fn acquire_ticket(&self, cancel: &CancellationToken) -> Result<IdentifyTicket, Step> {
        match self.ctx.limiter.acquire(self.spec.shard_id, cancel).await {
            Ok(ticket) => Ok(ticket),
            Err(GatewayError::Cancelled) => Err(Step::Close(ShardExit::Stopped)),
            Err(e) => Err(Step::Close(ShardExit::Failed {
                attempts: self.attempts,
                reason: e.to_string(),
            })),
        }
    }

    async fn send_heartbeat(&self, conn: &mut Conn, monitor: &mut HeartbeatMonitor) -> Result<(), Step> {
        let seq = self.session.as_ref().map(SessionState::last_sequence);
        self.send(conn, &build_heartbeat(seq)).await?;
        monitor.on_sent(Instant::now());
        Ok(())
    }

    async fn send(&self, conn: &mut Conn, payload: &GatewayPayload) -> Result<(), Step> {
        let text = payload.to_json().map_err(|e| self.recoverable(e, true))?;
        conn.send(text).await.map_err(|e| self.recoverable(e, true))
    }

    /// Count the error and turn it into a reconnect
    fn recoverable(&self, e: GatewayError, keep_session: bool) -> Step {
        self.record_error(&e);
        Step::Reconnect {
            keep_session,
            reason: e.to_string(),
        }
    }

    fn skip_malformed(&self, e: &GatewayError) {
        warn!(shard_id = self.spec.shard_id, error = %e, "Skipping malformed gateway frame");
        self.record_error(e);
    }

    fn record_error(&self, e: &GatewayError) {
        self.ctx
            .metrics
            .record_error(self.spec.shard_id, e.error_type_label());
    }

    fn discard_session(&mut self) {
        if let Some(session) = self.session.take() {
            info!(
                shard_id = self.spec.shard_id,
                session_id = %session.session_id(),
                "Session discarded, next handshake identifies"
            );
            self.ctx.state.set_session(self.spec.shard_id, None, None);
        }
    }

    fn mark_ready(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
        self.set_status(ShardStatus::Ready);
    }

    fn set_status(&mut self, status: ShardStatus) {
        if status != ShardStatus::Identifying {
            if let Some(ticket) = self.identify_slot.take() {
                ticket.release();
            }
        }
        self.ctx.state.set_status(self.spec.shard_id, status);
        self.ctx.metrics.set_shards_ready(self.ctx.state.ready_shards());
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!(shard_id = self.spec.shard_id, "Event receiver gone, dropping event");
        }
    }
}
