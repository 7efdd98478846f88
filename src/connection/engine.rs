//! Connection engine.
//!
//! One engine task exclusively owns the transport, the parser, both
//! command queues and all modal state. Submissions cross into it over a
//! bounded channel; replies leave through per-command completions and
//! the event bus. Every state transition happens on this task, so queue
//! invariants hold without locking.
//!
//! Lifecycle: disconnected → connecting → authenticating → ready-check
//! → ready, with reconnection (exponential backoff, 200 ms × 1.7) after
//! any loss. Modality (selected db, MONITOR, subscriptions) is
//! snapshotted when the transport drops and restored before user
//! commands resume.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, trace, warn};

use crate::command::{is_subscribe_family, Arg, Command, Completion, InternalOp};
use crate::config::{ClientOptions, Endpoint};
use crate::connection::transport::{self, ConnectionId, Reader, Writer};
use crate::error::RedlinkError;
use crate::events::{Event, EventBus};
use crate::pubsub::{
    classify, is_async_push, ControlKind, DispatchMode, PubSubPush, SubKind, SubscriptionSet,
};
use crate::queue::CommandQueue;
use crate::resp::parser::{self, ParserEvent, ReplyParser};
use crate::resp::types::Reply;
use crate::resp::writer::encode;
use crate::server_info::ServerInfo;

/// First reconnect delay.
const INITIAL_RETRY_DELAY_MS: u64 = 200;
/// Multiplier applied to the retry delay after each attempt.
const RETRY_BACKOFF: f64 = 1.7;
/// Wait before retrying AUTH against a server that answered LOADING.
const AUTH_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Outbound bytes queued but not yet accepted by the transport above
/// which submissions report backpressure.
const WRITE_BUF_SOFT_LIMIT: usize = 64 * 1024;

/// Read-mostly snapshot of the engine state, shared with client
/// handles.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub ready: bool,
    pub pub_sub_mode: bool,
    pub monitoring: bool,
    pub selected_db: Option<u32>,
    pub commands_sent: u64,
}

pub(crate) type SharedStatus = Arc<RwLock<ConnectionStatus>>;
pub(crate) type SharedServerInfo = Arc<RwLock<Option<ServerInfo>>>;

/// Discrete lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    ReadyCheck,
    Ready,
    RetryWait,
    Closing,
}

/// The single armed timer slot and what firing it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Unarmed,
    Retry,
    AuthRetry,
    ReadyCheck,
}

/// Modality captured at disconnect, restored once reconnected.
#[derive(Debug, Clone, Copy)]
struct ModalSnapshot {
    monitoring: bool,
    mode: DispatchMode,
    selected_db: Option<u32>,
}

/// Everything a client handle needs to talk to a spawned engine.
pub(crate) struct EngineHandles {
    pub sender: mpsc::Sender<Command>,
    pub events: EventBus,
    pub status: SharedStatus,
    pub server_info: SharedServerInfo,
}

/// Spawn an engine task for `endpoint` and return its handles.
pub(crate) fn spawn(endpoint: Endpoint, options: ClientOptions) -> EngineHandles {
    let (sender, requests) = mpsc::channel(1024);
    let events = EventBus::new(64);
    let status: SharedStatus = Arc::default();
    let server_info: SharedServerInfo = Arc::default();

    let handles = EngineHandles {
        sender,
        events: events.clone(),
        status: Arc::clone(&status),
        server_info: Arc::clone(&server_info),
    };

    tokio::spawn(async move {
        Engine::new(endpoint, options, requests, events, status, server_info)
            .run()
            .await;
    });

    handles
}

pub(crate) struct Engine {
    id: ConnectionId,
    endpoint: Endpoint,
    options: ClientOptions,

    requests: mpsc::Receiver<Command>,
    requests_open: bool,
    events: EventBus,
    status: SharedStatus,
    server_info: SharedServerInfo,

    state: ConnectionState,
    reader: Option<Reader>,
    writer: Option<Writer>,
    read_buf: BytesMut,
    parser: Box<dyn ReplyParser>,

    /// Encoded segments accepted from submissions but not yet written.
    out: VecDeque<Bytes>,
    out_bytes: usize,

    offline_queue: CommandQueue,
    pending: CommandQueue,
    /// Confirmations still owed to a subscribe-family command whose
    /// completion has already fired.
    sub_replies_left: usize,

    mode: DispatchMode,
    subscriptions: SubscriptionSet,
    monitoring: bool,
    closing: bool,
    connected: bool,
    ready: bool,
    selected_db: Option<u32>,
    auth_pass: Option<String>,
    old_state: Option<ModalSnapshot>,

    should_buffer: bool,
    commands_sent: u64,

    attempts: u32,
    retry_delay_ms: u64,
    retry_totaltime_ms: u64,
    /// Subscription confirmations awaited before announcing readiness
    /// after a reconnect.
    resub_outstanding: usize,
    end_emitted: bool,

    timer: Pin<Box<Sleep>>,
    timer_kind: TimerKind,
}

impl Engine {
    fn new(
        endpoint: Endpoint,
        options: ClientOptions,
        requests: mpsc::Receiver<Command>,
        events: EventBus,
        status: SharedStatus,
        server_info: SharedServerInfo,
    ) -> Self {
        let parser = parser::build(options.parser);
        let auth_pass = options.auth_pass.clone();
        let selected_db = options.db;
        Self {
            id: ConnectionId::next(),
            endpoint,
            options,
            requests,
            requests_open: true,
            events,
            status,
            server_info,
            state: ConnectionState::Disconnected,
            reader: None,
            writer: None,
            read_buf: BytesMut::with_capacity(16 * 1024),
            parser,
            out: VecDeque::new(),
            out_bytes: 0,
            offline_queue: CommandQueue::new(),
            pending: CommandQueue::new(),
            sub_replies_left: 0,
            mode: DispatchMode::Pipeline,
            subscriptions: SubscriptionSet::new(),
            monitoring: false,
            closing: false,
            connected: false,
            ready: false,
            selected_db,
            auth_pass,
            old_state: None,
            should_buffer: false,
            commands_sent: 0,
            attempts: 1,
            retry_delay_ms: INITIAL_RETRY_DELAY_MS,
            retry_totaltime_ms: 0,
            resub_outstanding: 0,
            end_emitted: false,
            timer: Box::pin(sleep(Duration::ZERO)),
            timer_kind: TimerKind::Unarmed,
        }
    }

    pub(crate) async fn run(mut self) {
        self.begin_connect().await;

        loop {
            // Graceful shutdown: pending writes flushed, nothing more
            // can arrive.
            if self.closing && self.connected && !self.requests_open && self.out.is_empty() {
                if let Some(mut writer) = self.writer.take() {
                    let _ = writer.shutdown().await;
                }
                self.connection_gone("end");
            }
            if self.finished() {
                debug!(id = %self.id, "engine stopped");
                break;
            }

            tokio::select! {
                biased;

                maybe = self.requests.recv(), if self.requests_open => match maybe {
                    Some(command) => {
                        self.send_command(command);
                    }
                    None => {
                        self.requests_open = false;
                        self.end();
                    }
                },

                _ = self.timer.as_mut(), if self.timer_kind != TimerKind::Unarmed => {
                    self.on_timer().await;
                }

                result = read_some(self.reader.as_mut(), &mut self.read_buf),
                    if self.reader.is_some() =>
                {
                    self.on_read(result);
                }

                result = write_some(self.writer.as_mut(), &mut self.out),
                    if self.writer.is_some() && !self.out.is_empty() =>
                {
                    self.on_write(result);
                }
            }
        }
    }

    fn finished(&self) -> bool {
        self.closing
            && !self.connected
            && self.pending.is_empty()
            && self.offline_queue.is_empty()
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    async fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
        self.id = ConnectionId::next();
        debug!(id = %self.id, endpoint = %self.endpoint.address(), attempt = self.attempts, "connecting");
        match transport::connect(&self.endpoint, &self.options).await {
            Ok((reader, writer)) => self.on_transport_connected(reader, writer),
            Err(err) => {
                self.emit_error(err);
                self.connection_gone("connect failed");
            }
        }
    }

    fn on_transport_connected(&mut self, reader: Reader, writer: Writer) {
        debug!(id = %self.id, "transport connected");
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.connected = true;
        self.ready = false;
        self.end_emitted = false;
        self.read_buf.clear();
        self.out.clear();
        self.out_bytes = 0;
        self.parser = parser::build(self.options.parser);
        self.update_status();

        if self.auth_pass.is_some() {
            self.state = ConnectionState::Authenticating;
            self.send_auth();
        } else {
            self.events.emit(Event::Connect);
            self.reset_retry();
            if self.options.no_ready_check {
                self.on_ready();
            } else {
                self.start_ready_check();
            }
        }
    }

    fn send_auth(&mut self) {
        let pass = self.auth_pass.clone().unwrap_or_default();
        self.send_command(Command::internal(
            "auth",
            vec![Arg::Text(pass)],
            InternalOp::Auth,
        ));
    }

    fn on_auth_ok(&mut self) {
        debug!(id = %self.id, "authenticated");
        self.events.emit(Event::Connect);
        self.reset_retry();
        if self.options.no_ready_check {
            self.on_ready();
        } else {
            self.start_ready_check();
        }
    }

    fn start_ready_check(&mut self) {
        self.state = ConnectionState::ReadyCheck;
        self.send_command(Command::internal("info", vec![], InternalOp::ReadyCheck));
    }

    fn on_info_reply(&mut self, reply: Reply) {
        let text = reply
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        let info = ServerInfo::parse(&text);
        let loading = info.is_loading();
        let eta = info.loading_eta_seconds();
        *self.server_info.write() = Some(info);

        if loading {
            let delay_ms = eta.unwrap_or(1).saturating_mul(1000).min(1000);
            debug!(id = %self.id, delay_ms, "server loading, postponing readiness");
            self.arm_timer(TimerKind::ReadyCheck, Duration::from_millis(delay_ms));
        } else {
            self.on_ready();
        }
    }

    fn on_ready(&mut self) {
        self.state = ConnectionState::Ready;
        self.ready = true;

        if let Some(snapshot) = self.old_state.take() {
            self.monitoring = snapshot.monitoring;
            self.mode = snapshot.mode;
            self.selected_db = snapshot.selected_db;
        }
        self.update_status();

        if let Some(db) = self.selected_db {
            // Straight to the wire, never through the offline queue.
            self.send_command(Command::internal(
                "select",
                vec![Arg::from(u64::from(db))],
                InternalOp::RestoreSelect,
            ));
        }

        if self.mode.is_pub_sub() && !self.subscriptions.is_empty() {
            let (channels, patterns) = self.subscriptions.split_targets();
            self.resub_outstanding = channels.len() + patterns.len();
            debug!(id = %self.id, count = self.resub_outstanding, "replaying subscriptions");
            if !channels.is_empty() {
                self.send_command(Command::internal(
                    "subscribe",
                    channels.into_iter().map(Arg::from).collect(),
                    InternalOp::Resubscribe,
                ));
            }
            if !patterns.is_empty() {
                self.send_command(Command::internal(
                    "psubscribe",
                    patterns.into_iter().map(Arg::from).collect(),
                    InternalOp::Resubscribe,
                ));
            }
            // Readiness is announced once every confirmation arrived.
            return;
        }

        if self.monitoring {
            self.send_command(Command::internal("monitor", vec![], InternalOp::RestoreMonitor));
        }

        self.finish_ready();
    }

    fn finish_ready(&mut self) {
        debug!(id = %self.id, offline = self.offline_queue.len(), "ready");
        let mut queued = Vec::new();
        self.offline_queue.flush_with(|command| queued.push(command));
        for command in queued {
            self.send_command(command);
        }
        self.events.emit(Event::Ready);
        if !self.should_buffer {
            self.events.emit(Event::Drain);
        }
        self.update_status();
    }

    fn reset_retry(&mut self) {
        self.retry_delay_ms = INITIAL_RETRY_DELAY_MS;
        self.retry_totaltime_ms = 0;
    }

    /// Transport lost: snapshot modality, drain queues, schedule the
    /// next attempt.
    fn connection_gone(&mut self, reason: &'static str) {
        if self.timer_kind == TimerKind::Retry {
            return;
        }
        debug!(id = %self.id, reason, state = ?self.state, "connection gone");

        self.connected = false;
        self.ready = false;
        self.reader = None;
        self.writer = None;
        self.out.clear();
        self.out_bytes = 0;
        self.sub_replies_left = 0;
        self.resub_outstanding = 0;
        self.timer_kind = TimerKind::Unarmed;
        self.state = ConnectionState::Disconnected;

        if self.old_state.is_none() {
            self.old_state = Some(ModalSnapshot {
                monitoring: self.monitoring,
                mode: self.mode,
                selected_db: self.selected_db,
            });
            self.monitoring = false;
            self.mode = DispatchMode::Pipeline;
            self.selected_db = None;
        }

        if !self.end_emitted {
            self.end_emitted = true;
            self.events.emit(Event::End);
        }

        self.flush_queues(RedlinkError::ConnectionGone { reason });
        self.update_status();

        if self.closing {
            self.state = ConnectionState::Closing;
            return;
        }

        if let Some(max) = self.options.max_attempts {
            if self.attempts >= max {
                self.give_up("max connection attempts reached");
                return;
            }
        }
        self.retry_totaltime_ms += self.retry_delay_ms;
        if self.retry_totaltime_ms >= self.options.connect_timeout.as_millis() as u64 {
            self.give_up("connect timeout exceeded");
            return;
        }

        self.attempts += 1;
        let delay = Duration::from_millis(self.retry_delay_ms);
        self.events.emit(Event::Reconnecting {
            delay,
            attempt: self.attempts,
        });
        debug!(id = %self.id, delay_ms = self.retry_delay_ms, attempt = self.attempts, "reconnect scheduled");
        self.arm_timer(TimerKind::Retry, delay);
        self.state = ConnectionState::RetryWait;
        self.retry_delay_ms = next_retry_delay(self.retry_delay_ms, self.options.retry_max_delay);
    }

    fn give_up(&mut self, cause: &'static str) {
        let err = RedlinkError::RetryExhausted {
            attempts: self.attempts,
            total_wait_ms: self.retry_totaltime_ms,
            cause,
        };
        warn!(id = %self.id, cause, "giving up");
        self.emit_error(err);
        self.closing = true;
        self.state = ConnectionState::Closing;
    }

    /// Explicit shutdown: stop retrying and close once writes flush.
    fn end(&mut self) {
        self.timer_kind = TimerKind::Unarmed;
        self.closing = true;
        if !self.connected {
            self.flush_queues(RedlinkError::Closed);
        }
    }

    fn flush_queues(&mut self, template: RedlinkError) {
        let reason = connection_error_reason(&template);
        let events = &self.events;
        let id = self.id;
        let mut flush = |command: Command| {
            let err = clone_connection_error(&template, reason);
            match command.completion {
                Completion::Internal(op) => {
                    debug!(id = %id, ?op, "internal command dropped at disconnect");
                }
                completion => {
                    if let Completion::Reply(tx) = completion {
                        let _ = tx.send(Err(err));
                    } else {
                        events.emit(Event::Error(Arc::new(err)));
                    }
                }
            }
        };
        self.pending.flush_with(&mut flush);
        self.offline_queue.flush_with(&mut flush);
    }

    async fn on_timer(&mut self) {
        let kind = std::mem::replace(&mut self.timer_kind, TimerKind::Unarmed);
        match kind {
            TimerKind::Unarmed => {}
            TimerKind::Retry => self.begin_connect().await,
            TimerKind::AuthRetry => self.send_auth(),
            TimerKind::ReadyCheck => self.start_ready_check(),
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, delay: Duration) {
        self.timer.as_mut().reset(Instant::now() + delay);
        self.timer_kind = kind;
    }

    // ── Submission ─────────────────────────────────────────────────

    /// The sole submission path. Returns `false` when the caller
    /// should stop writing until `drain`.
    fn send_command(&mut self, mut command: Command) -> bool {
        if self.closing && self.writer.is_none() {
            self.fail_command(command, RedlinkError::Closed);
            return false;
        }

        // Submission validation.
        if (command.name == "set" && command.args.len() < 2)
            || (command.name == "setex" && command.args.len() < 3)
        {
            let err = RedlinkError::InvalidArgument(format!(
                "{} requires a value",
                command.name
            ));
            self.fail_command(command, err);
            return false;
        }
        if command.name == "auth" {
            match command.args.first() {
                Some(arg) if !arg.is_empty() => {
                    self.auth_pass =
                        Some(String::from_utf8_lossy(arg.as_bytes()).into_owned());
                }
                _ => {
                    self.fail_command(
                        command,
                        RedlinkError::InvalidArgument("auth requires a password".into()),
                    );
                    return false;
                }
            }
        }

        // Readiness gate.
        let writable = self.connected && self.writer.is_some();
        if (!self.ready && !command.send_anyway) || !writable {
            if self.options.enable_offline_queue {
                trace!(id = %self.id, name = %command.name, "queueing offline");
                self.offline_queue.push(command);
                self.should_buffer = true;
                return false;
            }
            self.fail_command(command, RedlinkError::NotWritable);
            return false;
        }

        // Modal routing.
        if is_subscribe_family(&command.name) {
            self.on_subscribe_submit(&mut command);
        } else if command.name == "monitor" {
            self.monitoring = true;
        } else if command.name == "quit" {
            self.closing = true;
        } else if self.mode.is_pub_sub() {
            self.fail_command(command, RedlinkError::SubscriberMode);
            return false;
        }

        // Encode and hand to the transport writer.
        let encoded = encode(&command.name, &command.args);
        trace!(id = %self.id, name = %command.name, bytes = encoded.byte_len(), "write");
        self.out_bytes += encoded.byte_len();
        for chunk in encoded.into_chunks() {
            self.out.push_back(chunk);
        }
        self.pending.push(command);
        self.commands_sent += 1;
        self.update_status();

        if self.out_bytes > WRITE_BUF_SOFT_LIMIT
            || self.pending.len() >= self.options.command_queue_high_water
        {
            self.should_buffer = true;
        }
        !self.should_buffer
    }

    fn on_subscribe_submit(&mut self, command: &mut Command) {
        command.sub_command = true;
        self.mode = DispatchMode::PubSub;

        let kind = if command.name.starts_with('p') {
            SubKind::Pattern
        } else {
            SubKind::Channel
        };
        let unsubscribe = command.name.ends_with("unsubscribe");
        if unsubscribe && command.args.is_empty() {
            self.subscriptions.remove_all(kind);
        }
        for arg in &command.args {
            let target = String::from_utf8_lossy(arg.as_bytes());
            if unsubscribe {
                self.subscriptions.remove(kind, &target);
            } else {
                self.subscriptions.add(kind, &target);
            }
        }
    }

    fn fail_command(&mut self, command: Command, err: RedlinkError) {
        if let Some(err) = command.fail(err) {
            self.emit_error(err);
        }
    }

    fn emit_error(&mut self, err: RedlinkError) {
        warn!(id = %self.id, %err, "error");
        self.events.emit(Event::Error(Arc::new(err)));
    }

    // ── Transport callbacks ────────────────────────────────────────

    fn on_read(&mut self, result: io::Result<usize>) {
        match result {
            Err(err) => {
                self.emit_error(RedlinkError::Io(err));
                self.connection_gone("read error");
            }
            Ok(0) => self.connection_gone("close"),
            Ok(_) => {
                let chunk = self.read_buf.split();
                let mut parsed = Vec::new();
                if let Err(err) = self.parser.execute(&chunk, &mut parsed) {
                    self.emit_error(err);
                    self.connection_gone("protocol error");
                    return;
                }
                for event in parsed {
                    match event {
                        ParserEvent::Reply(reply) => self.dispatch_reply(reply),
                        ParserEvent::ErrorReply(message) => self.dispatch_error_reply(message),
                    }
                }
            }
        }
    }

    fn on_write(&mut self, result: io::Result<usize>) {
        match result {
            Err(err) => {
                self.emit_error(RedlinkError::Io(err));
                self.connection_gone("write error");
            }
            Ok(n) => {
                self.out_bytes = self.out_bytes.saturating_sub(n);
                if self.out.is_empty() {
                    self.maybe_drain();
                }
            }
        }
    }

    // ── Reply dispatch ─────────────────────────────────────────────

    fn dispatch_reply(&mut self, reply: Reply) {
        // MONITOR echoes every command as a timestamped status line.
        if self.monitoring {
            if let Reply::Simple(line) = &reply {
                if let Some((timestamp, args)) = parse_monitor_line(line) {
                    self.events.emit(Event::Monitor { timestamp, args });
                    return;
                }
            }
        }

        let head_is_sub =
            self.sub_replies_left > 0 || self.pending.head().is_some_and(|c| c.sub_command);
        if self.mode.is_pub_sub() || head_is_sub {
            // Async pushes never consume from the pending queue.
            if is_async_push(&reply) {
                match classify(&reply) {
                    Some(PubSubPush::Message { channel, payload }) => {
                        self.events.emit(Event::Message { channel, payload });
                    }
                    Some(PubSubPush::PMessage {
                        pattern,
                        channel,
                        payload,
                    }) => {
                        self.events.emit(Event::PMessage {
                            pattern,
                            channel,
                            payload,
                        });
                    }
                    _ => self.emit_error(RedlinkError::Protocol(
                        "malformed pub/sub push".into(),
                    )),
                }
                return;
            }

            if let Some(PubSubPush::Control {
                kind,
                target,
                count,
            }) = classify(&reply)
            {
                self.on_control_reply(kind, target, count);
                return;
            }

            if self.mode.is_pub_sub() && !self.closing {
                self.emit_error(RedlinkError::Protocol(format!(
                    "unexpected {} reply while subscribed",
                    reply.type_name()
                )));
                return;
            }
            // Closing: the QUIT acknowledgement pairs normally below.
        }

        self.pair_with_reply(reply);
    }

    fn dispatch_error_reply(&mut self, message: String) {
        match self.pending.shift() {
            Some(command) => {
                let err = RedlinkError::server(message, &command.name);
                match command.completion {
                    Completion::Internal(op) => self.on_internal_error(op, err),
                    Completion::Reply(tx) => {
                        let _ = tx.send(Err(err));
                    }
                    Completion::Discard => self.emit_error(err),
                }
                self.after_pop();
            }
            None => self.emit_error(RedlinkError::server_bare(message)),
        }
    }

    fn pair_with_reply(&mut self, reply: Reply) {
        let Some(command) = self.pending.shift() else {
            self.emit_error(RedlinkError::Protocol(format!(
                "{} reply with no pending command",
                reply.type_name()
            )));
            return;
        };

        // SELECT remembers the database across reconnects, whoever
        // issued it.
        if command.name == "select" {
            if matches!(&reply, Reply::Simple(s) if s == "OK") {
                if let Some(Arg::Text(db)) = command.args.first() {
                    self.selected_db = db.parse().ok();
                    self.update_status();
                }
            }
        }

        let had_blob_args = command.buffer_args();
        let Command {
            name, completion, ..
        } = command;

        match completion {
            Completion::Internal(op) => {
                self.after_pop();
                self.on_internal_reply(op, reply);
            }
            completion => {
                let value = postprocess(&self.options, &name, had_blob_args, reply);
                completion.resolve(Ok(value));
                self.after_pop();
            }
        }
    }

    fn on_internal_reply(&mut self, op: InternalOp, reply: Reply) {
        match op {
            InternalOp::Auth => self.on_auth_ok(),
            InternalOp::ReadyCheck => self.on_info_reply(reply),
            InternalOp::RestoreSelect | InternalOp::RestoreMonitor => {}
            // Resubscribe confirmations arrive as control replies.
            InternalOp::Resubscribe => {}
        }
    }

    fn on_internal_error(&mut self, op: InternalOp, err: RedlinkError) {
        match op {
            InternalOp::Auth if err.is_loading() => {
                debug!(id = %self.id, "server loading, retrying auth");
                self.arm_timer(TimerKind::AuthRetry, AUTH_RETRY_DELAY);
            }
            InternalOp::Auth if err.is_no_password_set() => {
                warn!(id = %self.id, "server has no password configured, continuing");
                self.on_auth_ok();
            }
            _ => self.emit_error(err),
        }
    }

    /// A subscribe-family confirmation: `(kind, target, remaining)`.
    fn on_control_reply(&mut self, kind: ControlKind, target: Option<String>, count: i64) {
        // The server's remaining-count is authoritative for modality.
        self.mode = if count == 0 {
            DispatchMode::Pipeline
        } else {
            DispatchMode::PubSub
        };
        self.update_status();

        let resub_done = if self.resub_outstanding > 0 {
            self.resub_outstanding -= 1;
            self.resub_outstanding == 0
        } else {
            false
        };

        if self.sub_replies_left > 0 {
            // Later confirmation for an already-answered command.
            self.sub_replies_left -= 1;
            if self.sub_replies_left == 0 {
                let _ = self.pending.shift();
                self.after_pop();
            }
        } else if self.pending.head().is_some_and(|c| c.sub_command) {
            let expected = self
                .pending
                .head()
                .map(|c| c.args.len().max(1))
                .unwrap_or(1);
            let completion = {
                let head = self.pending.head_mut().expect("head checked above");
                std::mem::replace(&mut head.completion, Completion::Discard)
            };
            // The callback fires on the first confirmation only, with
            // the confirmed target.
            if let Completion::Reply(tx) = completion {
                let _ = tx.send(Ok(Reply::Text(target.clone().unwrap_or_default())));
            }
            if expected <= 1 {
                let _ = self.pending.shift();
                self.after_pop();
            } else {
                self.sub_replies_left = expected - 1;
            }
        }
        // Otherwise: an unpaired confirmation (unsubscribe-all extras),
        // event delivery only.

        self.emit_control_event(kind, target, count);

        if resub_done {
            self.finish_ready();
        }
    }

    fn emit_control_event(&mut self, kind: ControlKind, target: Option<String>, count: i64) {
        let event = match kind {
            ControlKind::Subscribe => Event::Subscribe {
                channel: target.unwrap_or_default(),
                count,
            },
            ControlKind::Unsubscribe => Event::Unsubscribe {
                channel: target,
                count,
            },
            ControlKind::PSubscribe => Event::PSubscribe {
                pattern: target.unwrap_or_default(),
                count,
            },
            ControlKind::PUnsubscribe => Event::PUnsubscribe {
                pattern: target,
                count,
            },
        };
        self.events.emit(event);
    }

    /// Bookkeeping after removing the pending-queue head.
    fn after_pop(&mut self) {
        if self.pending.is_empty() && !self.mode.is_pub_sub() {
            self.events.emit(Event::Idle);
        }
        self.maybe_drain();
    }

    fn maybe_drain(&mut self) {
        if self.should_buffer
            && self.out_bytes == 0
            && self.pending.len() <= self.options.command_queue_low_water
        {
            self.should_buffer = false;
            self.events.emit(Event::Drain);
        }
    }

    fn update_status(&self) {
        let mut status = self.status.write();
        status.connected = self.connected;
        status.ready = self.ready;
        status.pub_sub_mode = self.mode.is_pub_sub();
        status.monitoring = self.monitoring;
        status.selected_db = self.selected_db;
        status.commands_sent = self.commands_sent;
    }
}

// ── Free helpers ───────────────────────────────────────────────────

async fn read_some(reader: Option<&mut Reader>, buf: &mut BytesMut) -> io::Result<usize> {
    let reader = reader.expect("read branch guarded on reader presence");
    if buf.capacity() - buf.len() < 4096 {
        buf.reserve(16 * 1024);
    }
    reader.read_buf(buf).await
}

async fn write_some(
    writer: Option<&mut Writer>,
    out: &mut VecDeque<Bytes>,
) -> io::Result<usize> {
    let writer = writer.expect("write branch guarded on writer presence");
    let front = out.front_mut().expect("write branch guarded on queued data");
    let n = writer.write_buf(front).await?;
    if n == 0 && front.has_remaining() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "transport accepted no bytes",
        ));
    }
    if !front.has_remaining() {
        out.pop_front();
    }
    if out.is_empty() {
        writer.flush().await?;
    }
    Ok(n)
}

/// `floor(delay × 1.7)`, capped when a maximum is configured.
fn next_retry_delay(current_ms: u64, cap: Option<Duration>) -> u64 {
    let mut next = (current_ms as f64 * RETRY_BACKOFF).floor() as u64;
    if let Some(cap) = cap {
        next = next.min(cap.as_millis() as u64);
    }
    next
}

fn connection_error_reason(template: &RedlinkError) -> &'static str {
    match template {
        RedlinkError::ConnectionGone { reason } => reason,
        _ => "closed",
    }
}

/// Queue flushes hand every record the same error; connection errors
/// are the only kind that fan out.
fn clone_connection_error(template: &RedlinkError, reason: &'static str) -> RedlinkError {
    match template {
        RedlinkError::Closed => RedlinkError::Closed,
        _ => RedlinkError::ConnectionGone { reason },
    }
}

/// Convert bulk payloads to strings, recursively through arrays.
fn to_text(reply: Reply) -> Reply {
    match reply {
        Reply::Bulk(bytes) => Reply::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Reply::Array(items) => Reply::Array(items.into_iter().map(to_text).collect()),
        other => other,
    }
}

/// Dispatch-time reply shaping: string conversion and the HGETALL
/// mapping.
fn postprocess(options: &ClientOptions, name: &str, had_blob_args: bool, reply: Reply) -> Reply {
    let keep_bytes =
        options.return_buffers || (options.detect_buffers && had_blob_args);
    let reply = if keep_bytes || name == "exec" {
        reply
    } else {
        to_text(reply)
    };

    if name == "hgetall" {
        hgetall_to_map(reply)
    } else {
        reply
    }
}

fn hgetall_to_map(reply: Reply) -> Reply {
    match reply {
        Reply::Array(items) => {
            if items.is_empty() {
                Reply::Nil
            } else if items.len() % 2 == 0 {
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
                    let key = field
                        .as_bytes()
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_default();
                    pairs.push((key, value));
                }
                Reply::Map(pairs)
            } else {
                Reply::Array(items)
            }
        }
        _ => Reply::Nil,
    }
}

/// Parse one MONITOR echo line: `<timestamp> "arg" "arg" …`.
fn parse_monitor_line(line: &str) -> Option<(String, Vec<String>)> {
    let (timestamp, rest) = line.split_once(' ')?;
    if timestamp.is_empty()
        || !timestamp
            .bytes()
            .all(|b| b.is_ascii_digit() || b == b'.')
    {
        return None;
    }
    let start = rest.find('"')?;
    let body = rest[start + 1..].strip_suffix('"')?;
    let args = body
        .split("\" \"")
        .map(|arg| arg.replace("\\\"", "\""))
        .collect();
    Some((timestamp.to_owned(), args))
}

// ── Tests ──────────────────────────────────────────────────────────
