//! The per-session event loop.
//!
//! One [`Driver`] task owns the socket, the codec and all three engines.
//! It waits on socket reads, caller commands, cancellations, the host key
//! verdict, operation deadlines and the keep-alive timer, then runs each
//! event to completion before flushing outbound bytes. Nothing here is
//! shared with other tasks apart from the command and cancel queues and the
//! state snapshot.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::{pending, Future};
use std::pin::Pin;

use tether_platform::{TetherError, TetherResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use super::config::SessionConfig;
use super::keepalive::{create_keepalive_message, Keepalive, KEEPALIVE_DATA_LEN};
use super::operation::Completer;
use super::{ConnectInfo, SessionInfo, SessionState};
use crate::ssh::auth::{AuthEngine, AuthGoal, AuthOutput, Credential};
use crate::ssh::channel::{
    ChannelHandle, ChannelOutput, Completed, Multiplexer, OpId, X11Channel,
};
use crate::ssh::connection::{
    ChannelOpen, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequestType, ChannelType,
};
use crate::ssh::kex::{KexEngine, KexOutput};
use crate::ssh::logging;
use crate::ssh::message::{disconnect_reason, Disconnect, Message};
use crate::ssh::transport::{Decoded, TransportCodec};
use crate::ssh::version::Version;

const READ_CHUNK: usize = 32 * 1024;

/// Op id used for channel closes the driver issues on its own.
const INTERNAL_OP: OpId = 0;

/// Caller request, sent from a [`super::Session`] handle to the driver.
#[derive(Debug)]
pub(crate) enum Command {
    Login {
        user: String,
        credentials: Vec<Credential>,
        done: Completer<()>,
        deadline: Option<Instant>,
    },
    AuthMethods {
        user: String,
        done: Completer<Vec<String>>,
        deadline: Option<Instant>,
    },
    OpenChannel {
        kind: ChannelType,
        done: Completer<ChannelHandle>,
        deadline: Option<Instant>,
    },
    Send {
        channel: u32,
        data_type: Option<u32>,
        data: Vec<u8>,
        done: Completer<usize>,
        deadline: Option<Instant>,
    },
    Request {
        channel: u32,
        request: ChannelRequestType,
        want_reply: bool,
        done: Completer<()>,
        deadline: Option<Instant>,
    },
    Eof {
        channel: u32,
        done: Completer<()>,
        deadline: Option<Instant>,
    },
    CloseChannel {
        channel: u32,
        done: Completer<()>,
        deadline: Option<Instant>,
    },
    Flush {
        channel: u32,
        done: Completer<()>,
        deadline: Option<Instant>,
    },
    Rekey {
        done: Completer<()>,
        deadline: Option<Instant>,
    },
    Disconnect {
        done: Completer<()>,
    },
}

impl Command {
    /// Completes the command's operation with `err` without running it.
    pub(crate) fn fail(self, err: TetherError) {
        match self {
            Command::Login { done, .. }
            | Command::Request { done, .. }
            | Command::Eof { done, .. }
            | Command::CloseChannel { done, .. }
            | Command::Flush { done, .. }
            | Command::Rekey { done, .. }
            | Command::Disconnect { done } => {
                done.complete(Err(err));
            }
            Command::AuthMethods { done, .. } => {
                done.complete(Err(err));
            }
            Command::OpenChannel { done, .. } => {
                done.complete(Err(err));
            }
            Command::Send { done, .. } => {
                done.complete(Err(err));
            }
        }
    }
}

/// State shared with the session handles.
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    pub(crate) state: SessionState,
    pub(crate) info: Option<SessionInfo>,
    pub(crate) last_error: Option<TetherError>,
    pub(crate) banner: Option<String>,
}

#[derive(Debug)]
enum Pending {
    Connect(Completer<ConnectInfo>),
    Login(Completer<()>),
    Methods(Completer<Vec<String>>),
    Open(Completer<ChannelHandle>, ChannelHandle),
    Sent(Completer<usize>),
    Unit(Completer<()>),
}

impl Pending {
    fn fail(self, err: TetherError) {
        match self {
            Pending::Connect(done) => {
                done.complete(Err(err));
            }
            Pending::Login(done) | Pending::Unit(done) => {
                done.complete(Err(err));
            }
            Pending::Methods(done) => {
                done.complete(Err(err));
            }
            Pending::Open(done, _) => {
                done.complete(Err(err));
            }
            Pending::Sent(done) => {
                done.complete(Err(err));
            }
        }
    }
}

#[derive(Debug)]
struct Entry {
    pending: Pending,
    deadline: Option<Instant>,
}

#[derive(Debug)]
struct AuthJob {
    op: OpId,
    user: String,
    goal: AuthGoal,
}

type Verdict = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Event loop for one session.
pub(crate) struct Driver<S> {
    id: u64,
    stream: S,
    config: SessionConfig,
    codec: TransportCodec,
    kex: Option<KexEngine>,
    auth: AuthEngine,
    mux: Multiplexer,
    commands: mpsc::UnboundedReceiver<Command>,
    cancels: mpsc::UnboundedReceiver<OpId>,
    snapshot: watch::Sender<Snapshot>,
    state: SessionState,

    server_version: Option<Version>,
    skipped_lines: usize,
    verdict: Option<Verdict>,
    keepalive: Keepalive,
    last_kex: Instant,

    pending: HashMap<OpId, Entry>,
    deadlines: BTreeSet<(Instant, OpId)>,
    connect_op: Option<OpId>,
    auth_queue: VecDeque<AuthJob>,
    active_auth: Option<OpId>,
    rekey_waiters: Vec<OpId>,
    disconnect_op: Option<OpId>,
    disconnecting: bool,

    /// Non-kex payloads held back while keys are being switched
    deferred: VecDeque<Vec<u8>>,
    /// Channel completions that wait for `deferred` to drain
    deferred_done: Vec<(OpId, TetherResult<Completed>)>,
    /// Channel completions delivered once the outbox is written
    staged: Vec<(OpId, TetherResult<Completed>)>,
    outbox: Vec<u8>,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        id: u64,
        stream: S,
        config: SessionConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        cancels: mpsc::UnboundedReceiver<OpId>,
        snapshot: watch::Sender<Snapshot>,
        connect: Completer<ConnectInfo>,
        deadline: Option<Instant>,
    ) -> Self {
        let codec = TransportCodec::with_limits(config.rekey.limits);
        let mux = Multiplexer::new(id, config.channel);
        let keepalive = Keepalive::new(config.keepalive);
        let connect_op = connect.id();

        let mut driver = Self {
            id,
            stream,
            config,
            codec,
            kex: None,
            auth: AuthEngine::new(id),
            mux,
            commands,
            cancels,
            snapshot,
            state: SessionState::Connecting,
            server_version: None,
            skipped_lines: 0,
            verdict: None,
            keepalive,
            last_kex: Instant::now(),
            pending: HashMap::new(),
            deadlines: BTreeSet::new(),
            connect_op: Some(connect_op),
            auth_queue: VecDeque::new(),
            active_auth: None,
            rekey_waiters: Vec::new(),
            disconnect_op: None,
            disconnecting: false,
            deferred: VecDeque::new(),
            deferred_done: Vec::new(),
            staged: Vec::new(),
            outbox: Vec::new(),
        };
        driver.track(connect_op, Pending::Connect(connect), deadline);
        driver
    }

    /// Runs the session until disconnect or a fatal error.
    pub(crate) async fn run(mut self) {
        debug!(session = self.id, "session task started");

        let greeting = self.config.version.to_wire_format();
        let started = async {
            self.stream.write_all(&greeting).await?;
            self.stream.flush().await?;
            Ok::<(), TetherError>(())
        }
        .await;

        match started {
            Ok(()) => self.event_loop().await,
            Err(err) => self.fail(err),
        }

        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            cmd.fail(TetherError::transport("session closed"));
        }
        if let Err(err) = self.stream.shutdown().await {
            debug!(session = self.id, error = %err, "transport shutdown failed");
        }
        debug!(session = self.id, "session task finished");
    }

    async fn event_loop(&mut self) {
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let wake = self.next_wakeup();
            let reading = self.verdict.is_none();
            let keepalive = self.kex.as_ref().is_some_and(KexEngine::is_established);

            let step = tokio::select! {
                read = self.stream.read(&mut chunk), if reading => self.on_read(read, &chunk),
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        debug!(session = self.id, "all session handles dropped");
                        self.begin_disconnect()
                    }
                },
                Some(op) = self.cancels.recv() => self.on_cancel(op),
                accepted = wait_verdict(&mut self.verdict), if self.verdict.is_some() => {
                    self.on_verdict(accepted)
                }
                _ = sleep_opt(wake) => self.on_timer(),
                _ = self.keepalive.tick(), if keepalive => {
                    trace!(session = self.id, "sending keep-alive");
                    self.send(create_keepalive_message(KEEPALIVE_DATA_LEN))
                }
            };

            let step = match step.and_then(|()| self.check_rekey()) {
                Ok(()) => self.flush().await,
                Err(err) => Err(err),
            };
            if let Err(err) = step {
                self.fail(err);
                return;
            }
            if self.disconnecting {
                self.finish_disconnect();
                return;
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let deadline = self.deadlines.first().map(|(at, _)| *at);
        let rekey = match (&self.kex, self.config.rekey.interval) {
            (Some(kex), Some(interval)) if kex.is_established() => Some(self.last_kex + interval),
            _ => None,
        };
        match (deadline, rekey) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn track(&mut self, op: OpId, pending: Pending, deadline: Option<Instant>) {
        if let Some(at) = deadline {
            self.deadlines.insert((at, op));
        }
        self.pending.insert(op, Entry { pending, deadline });
    }

    fn take(&mut self, op: OpId) -> Option<Pending> {
        let entry = self.pending.remove(&op)?;
        if let Some(at) = entry.deadline {
            self.deadlines.remove(&(at, op));
        }
        Some(entry.pending)
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(session = self.id, from = ?self.state, to = ?state, "session state");
        self.state = state;
        self.snapshot.send_modify(|snap| {
            snap.state = state;
            if let (SessionState::Authenticated, Some(info)) = (state, &mut snap.info) {
                info.authenticated = true;
            }
        });
    }

    fn publish_info(&mut self) {
        let (Some(kex), Some(version)) = (&self.kex, &self.server_version) else {
            return;
        };
        let (Some(algorithms), Some(host_key)) = (kex.algorithms(), kex.host_key_info()) else {
            return;
        };
        let info = SessionInfo {
            server_version: version.identification().to_string(),
            algorithms: algorithms.clone(),
            host_key_fingerprint: host_key.fingerprint.clone(),
            authenticated: self.auth.is_authenticated(),
        };
        self.snapshot.send_modify(|snap| snap.info = Some(info));
    }

    /// Encodes a payload now. Key exchange traffic always goes this way.
    fn send_now(&mut self, payload: &[u8]) -> TetherResult<()> {
        let wire = self.codec.encode(payload)?;
        self.outbox.extend_from_slice(&wire);
        Ok(())
    }

    /// Encodes a payload, or holds it back while a key exchange runs.
    fn send(&mut self, payload: Vec<u8>) -> TetherResult<()> {
        let ready = self.kex.as_ref().is_some_and(KexEngine::is_established)
            || payload.first().copied().is_some_and(Message::allowed_during_kex);
        if ready {
            self.send_now(&payload)
        } else {
            self.deferred.push_back(payload);
            Ok(())
        }
    }

    async fn flush(&mut self) -> TetherResult<()> {
        loop {
            if !self.outbox.is_empty() {
                self.stream.write_all(&self.outbox).await?;
                self.stream.flush().await?;
                self.outbox.clear();
            }
            if self.staged.is_empty() {
                return Ok(());
            }
            for (op, result) in std::mem::take(&mut self.staged) {
                self.complete_channel_op(op, result)?;
            }
        }
    }

    fn on_read(&mut self, read: std::io::Result<usize>, chunk: &[u8]) -> TetherResult<()> {
        let n = read?;
        if n == 0 {
            return Err(TetherError::transport("connection closed by peer"));
        }
        self.codec.feed(&chunk[..n]);
        self.process_inbound()
    }

    fn process_inbound(&mut self) -> TetherResult<()> {
        if self.server_version.is_none() {
            let taken = Version::take_from(self.codec.inbound_mut(), &mut self.skipped_lines)?;
            let Some(version) = taken else {
                return Ok(());
            };
            debug!(
                session = self.id,
                server = version.identification(),
                skipped = self.skipped_lines,
                "server identification received"
            );
            let mut kex = KexEngine::client(
                self.id,
                self.config.algorithms.clone(),
                self.config.version.identification(),
                version.identification(),
            );
            let out = kex.start()?;
            self.kex = Some(kex);
            self.server_version = Some(version);
            self.apply_kex(out)?;
        }

        while self.verdict.is_none() && !self.disconnecting {
            match self.codec.decode()? {
                Decoded::Packet(payload) => self.handle_packet(payload)?,
                Decoded::Incomplete => break,
            }
        }
        Ok(())
    }

    fn handle_packet(&mut self, payload: Vec<u8>) -> TetherResult<()> {
        let msg = Message::decode(&payload)?;
        match msg {
            Message::Disconnect(d) => {
                logging::log_peer_disconnect(self.id, d.reason_code, &d.description);
                Err(TetherError::transport(format!(
                    "peer disconnected (reason {}): {}",
                    d.reason_code, d.description
                )))
            }
            Message::Ignore(_) => Ok(()),
            Message::Debug(d) => {
                debug!(session = self.id, message = %d.message, "peer debug message");
                Ok(())
            }
            Message::Unimplemented(seq) => {
                debug!(session = self.id, sequence = seq, "peer did not implement a message");
                Ok(())
            }
            Message::Unknown(number) => {
                debug!(session = self.id, number, "unknown message number");
                let seq = self.codec.last_recv_sequence();
                self.send(Message::Unimplemented(seq).encode())
            }
            msg @ (Message::KexInit(_)
            | Message::KexDhInit(_)
            | Message::KexDhReply(_)
            | Message::NewKeys) => {
                let kex = self
                    .kex
                    .as_mut()
                    .ok_or_else(|| TetherError::protocol("kex message before identification"))?;
                let out = kex.handle(msg, &payload)?;
                self.apply_kex(out)
            }
            msg @ (Message::ServiceAccept(_)
            | Message::UserauthFailure(_)
            | Message::UserauthSuccess
            | Message::UserauthBanner(_)
            | Message::UserauthMethodSpecific(_)) => {
                let session_id = self.session_id()?;
                let out = self.auth.handle(msg, &session_id)?;
                if let Some(banner) = self.auth.banner() {
                    let banner = banner.to_string();
                    self.snapshot.send_modify(|snap| snap.banner = Some(banner));
                }
                self.apply_auth(out)?;
                self.start_next_auth()
            }
            Message::GlobalRequest(req) => {
                logging::log_refused_request(self.id, "global", &req.name);
                if req.want_reply {
                    self.send(Message::RequestFailure.encode())?;
                }
                Ok(())
            }
            Message::ChannelOpen(open) => self.on_channel_open(open),
            Message::ServiceRequest(_)
            | Message::UserauthRequest(_)
            | Message::RequestSuccess(_)
            | Message::RequestFailure => Err(TetherError::protocol(format!(
                "unexpected message {} from server",
                payload[0]
            ))),
            msg => {
                let out = self.mux.handle(msg)?;
                self.apply_channel(out)
            }
        }
    }

    /// Accepts X11 channels when a handler is configured, refuses the rest.
    fn on_channel_open(&mut self, open: ChannelOpen) -> TetherResult<()> {
        let x11 = match (open.channel_type(), &self.config.x11) {
            (ChannelType::Other { name, data }, Some(handler))
                if name == "x11" && self.auth.is_authenticated() =>
            {
                X11Channel::parse_originator(data)
                    .ok()
                    .map(|origin| (origin, handler.clone()))
            }
            _ => None,
        };
        let Some(((originator_address, originator_port), handler)) = x11 else {
            logging::log_refused_request(self.id, "channel open", open.channel_type().name());
            let failure = ChannelOpenFailure::new(
                open.sender_channel(),
                ChannelOpenFailureReason::AdministrativelyProhibited,
                "channel open refused",
            );
            return self.send(failure.to_bytes());
        };

        let (channel, out) = self.mux.accept(&open);
        debug!(
            session = self.id,
            channel = channel.id(),
            originator = %originator_address,
            port = originator_port,
            "accepted X11 channel"
        );
        self.apply_channel(out)?;
        handler.accept(X11Channel {
            channel,
            originator_address,
            originator_port,
        });
        Ok(())
    }

    fn session_id(&self) -> TetherResult<Vec<u8>> {
        self.kex
            .as_ref()
            .filter(|kex| kex.completed_exchanges() > 0)
            .and_then(KexEngine::session_id)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| TetherError::protocol("userauth message before key exchange"))
    }

    fn apply_kex(&mut self, out: Vec<KexOutput>) -> TetherResult<()> {
        for output in out {
            match output {
                KexOutput::Send(payload) => self.send_now(&payload)?,
                KexOutput::VerifyHostKey(info) => {
                    let verifier = self.config.verifier.clone();
                    self.verdict = Some(Box::pin(async move { verifier.verify(&info).await }));
                }
                KexOutput::InstallOutbound(keys) => self.codec.install_outbound(&keys)?,
                KexOutput::InstallInbound(keys) => self.codec.install_inbound(&keys)?,
                KexOutput::Established => self.on_established()?,
            }
        }
        Ok(())
    }

    fn on_verdict(&mut self, accepted: bool) -> TetherResult<()> {
        self.verdict = None;
        let kex = self
            .kex
            .as_mut()
            .ok_or_else(|| TetherError::protocol("host key verdict without key exchange"))?;
        let out = kex.host_key_verdict(accepted)?;
        self.apply_kex(out)?;
        self.process_inbound()
    }

    fn on_established(&mut self) -> TetherResult<()> {
        self.last_kex = Instant::now();
        self.publish_info();

        if self.state == SessionState::Connecting {
            self.set_state(SessionState::Established);
            let info = self.connect_info()?;
            if let Some(op) = self.connect_op.take() {
                if let Some(Pending::Connect(done)) = self.take(op) {
                    done.complete(Ok(info));
                }
            }
        }

        while let Some(payload) = self.deferred.pop_front() {
            self.send_now(&payload)?;
        }
        self.staged.append(&mut self.deferred_done);

        for op in std::mem::take(&mut self.rekey_waiters) {
            if let Some(Pending::Unit(done)) = self.take(op) {
                done.complete(Ok(()));
            }
        }
        self.start_next_auth()
    }

    fn connect_info(&self) -> TetherResult<ConnectInfo> {
        let kex = self
            .kex
            .as_ref()
            .ok_or_else(|| TetherError::protocol("key exchange missing"))?;
        let server_version = self
            .server_version
            .as_ref()
            .map(|v| v.identification().to_string())
            .unwrap_or_default();
        let algorithms = kex
            .algorithms()
            .cloned()
            .ok_or_else(|| TetherError::protocol("algorithms not negotiated"))?;
        let host_key = kex
            .host_key_info()
            .cloned()
            .ok_or_else(|| TetherError::protocol("host key missing"))?;
        Ok(ConnectInfo {
            server_version,
            algorithms,
            host_key,
        })
    }

    fn check_rekey(&mut self) -> TetherResult<()> {
        let Some(kex) = &self.kex else {
            return Ok(());
        };
        if !kex.is_established() {
            return Ok(());
        }
        let by_time = self
            .config
            .rekey
            .interval
            .is_some_and(|interval| self.last_kex.elapsed() >= interval);
        if by_time || self.codec.needs_rekey() {
            debug!(session = self.id, by_time, "re-key threshold reached");
            self.start_rekey()?;
        }
        Ok(())
    }

    fn start_rekey(&mut self) -> TetherResult<()> {
        let kex = self
            .kex
            .as_mut()
            .ok_or_else(|| TetherError::protocol("re-key before key exchange"))?;
        let out = kex.start()?;
        self.apply_kex(out)
    }

    fn start_next_auth(&mut self) -> TetherResult<()> {
        while self.active_auth.is_none() && !self.auth.in_progress() {
            let Ok(session_id) = self.session_id() else {
                return Ok(());
            };
            let Some(job) = self.auth_queue.pop_front() else {
                return Ok(());
            };
            if !self.pending.contains_key(&job.op) {
                continue;
            }
            self.active_auth = Some(job.op);
            let out = self.auth.start(&job.user, job.goal, &session_id)?;
            self.apply_auth(out)?;
        }
        Ok(())
    }

    fn apply_auth(&mut self, out: Vec<AuthOutput>) -> TetherResult<()> {
        for output in out {
            match output {
                AuthOutput::Send(payload) => self.send(payload)?,
                AuthOutput::Authenticated => {
                    self.set_state(SessionState::Authenticated);
                    self.finish_auth(Ok(Vec::new()));
                }
                AuthOutput::Methods(methods) => self.finish_auth(Ok(methods)),
                AuthOutput::Failed(err) => self.finish_auth(Err(err)),
            }
        }
        Ok(())
    }

    fn finish_auth(&mut self, result: TetherResult<Vec<String>>) {
        let Some(op) = self.active_auth.take() else {
            return;
        };
        match self.take(op) {
            Some(Pending::Login(done)) => {
                done.complete(result.map(|_| ()));
            }
            Some(Pending::Methods(done)) => {
                done.complete(result);
            }
            Some(other) => other.fail(TetherError::protocol("auth result for another operation")),
            None => debug!(session = self.id, op, "auth finished after its operation ended"),
        }
    }

    fn apply_channel(&mut self, out: Vec<ChannelOutput>) -> TetherResult<()> {
        for output in out {
            match output {
                ChannelOutput::Send(payload) => self.send(payload)?,
                ChannelOutput::Complete(op, result) => {
                    if self.deferred.is_empty() {
                        self.staged.push((op, result));
                    } else {
                        self.deferred_done.push((op, result));
                    }
                }
            }
        }
        Ok(())
    }

    fn complete_channel_op(
        &mut self,
        op: OpId,
        result: TetherResult<Completed>,
    ) -> TetherResult<()> {
        match self.take(op) {
            Some(Pending::Open(done, handle)) => {
                done.complete(result.map(|_| handle));
            }
            Some(Pending::Sent(done)) => {
                done.complete(result.map(|completed| match completed {
                    Completed::Sent(n) => n,
                    _ => 0,
                }));
            }
            Some(Pending::Unit(done)) => {
                done.complete(result.map(|_| ()));
            }
            Some(other) => other.fail(TetherError::channel("channel result for another operation")),
            None => {
                if let Ok(Completed::Opened(id)) = result {
                    debug!(session = self.id, channel = id, "closing channel whose open expired");
                    let out = self.mux.close(INTERNAL_OP, id);
                    self.apply_channel(out)?;
                }
            }
        }
        Ok(())
    }

    fn require_authenticated(&self) -> TetherResult<()> {
        if self.auth.is_authenticated() {
            Ok(())
        } else {
            Err(TetherError::channel("session is not authenticated"))
        }
    }

    fn on_command(&mut self, cmd: Command) -> TetherResult<()> {
        if self.disconnecting {
            cmd.fail(TetherError::transport("session is disconnecting"));
            return Ok(());
        }
        let channel_op = matches!(
            cmd,
            Command::OpenChannel { .. }
                | Command::Send { .. }
                | Command::Request { .. }
                | Command::Eof { .. }
                | Command::CloseChannel { .. }
                | Command::Flush { .. }
        );
        if channel_op {
            if let Err(err) = self.require_authenticated() {
                cmd.fail(err);
                return Ok(());
            }
        }

        match cmd {
            Command::Login {
                user,
                credentials,
                done,
                deadline,
            } => {
                let op = done.id();
                self.track(op, Pending::Login(done), deadline);
                self.auth_queue.push_back(AuthJob {
                    op,
                    user,
                    goal: AuthGoal::Login(credentials),
                });
                self.start_next_auth()
            }
            Command::AuthMethods {
                user,
                done,
                deadline,
            } => {
                let op = done.id();
                self.track(op, Pending::Methods(done), deadline);
                self.auth_queue.push_back(AuthJob {
                    op,
                    user,
                    goal: AuthGoal::ListMethods,
                });
                self.start_next_auth()
            }
            Command::OpenChannel {
                kind,
                done,
                deadline,
            } => {
                let op = done.id();
                let (handle, out) = self.mux.open(op, kind);
                self.track(op, Pending::Open(done, handle), deadline);
                self.apply_channel(out)
            }
            Command::Send {
                channel,
                data_type,
                data,
                done,
                deadline,
            } => {
                let op = done.id();
                self.track(op, Pending::Sent(done), deadline);
                let out = self.mux.send(op, channel, data_type, data);
                self.apply_channel(out)
            }
            Command::Request {
                channel,
                request,
                want_reply,
                done,
                deadline,
            } => {
                let op = done.id();
                self.track(op, Pending::Unit(done), deadline);
                let out = self.mux.request(op, channel, request, want_reply);
                self.apply_channel(out)
            }
            Command::Eof {
                channel,
                done,
                deadline,
            } => {
                let op = done.id();
                self.track(op, Pending::Unit(done), deadline);
                let out = self.mux.eof(op, channel);
                self.apply_channel(out)
            }
            Command::CloseChannel {
                channel,
                done,
                deadline,
            } => {
                let op = done.id();
                self.track(op, Pending::Unit(done), deadline);
                let out = self.mux.close(op, channel);
                self.apply_channel(out)
            }
            Command::Flush {
                channel,
                done,
                deadline,
            } => {
                let op = done.id();
                self.track(op, Pending::Unit(done), deadline);
                let out = self.mux.flush(op, channel);
                self.apply_channel(out)
            }
            Command::Rekey { done, deadline } => {
                let op = done.id();
                self.track(op, Pending::Unit(done), deadline);
                self.rekey_waiters.push(op);
                if self.kex.as_ref().is_some_and(KexEngine::is_established) {
                    self.start_rekey()?;
                }
                Ok(())
            }
            Command::Disconnect { done } => {
                let op = done.id();
                self.track(op, Pending::Unit(done), None);
                self.disconnect_op = Some(op);
                self.begin_disconnect()
            }
        }
    }

    fn on_timer(&mut self) -> TetherResult<()> {
        let now = Instant::now();
        while let Some(&(at, op)) = self.deadlines.first() {
            if at > now {
                break;
            }
            if Some(op) == self.connect_op {
                return Err(TetherError::timeout("connect timed out"));
            }
            self.deadlines.remove(&(at, op));
            self.rekey_waiters.retain(|waiter| *waiter != op);
            if let Some(pending) = self.take(op) {
                debug!(session = self.id, op, "operation timed out");
                pending.fail(TetherError::timeout(format!("operation {} timed out", op)));
            }
            self.abandon_auth(op)?;
        }
        Ok(())
    }

    fn on_cancel(&mut self, op: OpId) -> TetherResult<()> {
        self.rekey_waiters.retain(|waiter| *waiter != op);
        if let Some(pending) = self.take(op) {
            debug!(session = self.id, op, "operation cancelled");
            pending.fail(TetherError::cancelled());
        }
        self.abandon_auth(op)
    }

    /// Stops the auth run `op` was waiting for, then starts the next login.
    fn abandon_auth(&mut self, op: OpId) -> TetherResult<()> {
        if self.active_auth != Some(op) {
            return Ok(());
        }
        self.active_auth = None;
        self.auth.abort();
        self.start_next_auth()
    }

    fn begin_disconnect(&mut self) -> TetherResult<()> {
        if self.disconnecting {
            return Ok(());
        }
        self.disconnecting = true;
        let msg = Message::Disconnect(Disconnect::new(
            disconnect_reason::BY_APPLICATION,
            "disconnected by application",
        ));
        self.send_now(&msg.encode())
    }

    fn finish_disconnect(&mut self) {
        debug!(session = self.id, "session disconnected by application");
        let done = self.disconnect_op.take().and_then(|op| self.take(op));
        let err = TetherError::transport("session disconnected");
        self.close_all(err.clone(), err);
        if let Some(Pending::Unit(done)) = done {
            done.complete(Ok(()));
        }
    }

    fn fail(&mut self, err: TetherError) {
        logging::log_session_error(self.id, &err);
        self.snapshot
            .send_modify(|snap| snap.last_error = Some(err.clone()));
        let others = TetherError::transport(format!("session closed: {}", err));
        self.close_all(err, others);
    }

    /// Flushes every pending operation exactly once, then closes every
    /// channel handle.
    fn close_all(&mut self, connect_err: TetherError, others: TetherError) {
        let connect_op = self.connect_op.take();
        for (op, entry) in self.pending.drain() {
            if Some(op) == connect_op {
                entry.pending.fail(connect_err.clone());
            } else {
                entry.pending.fail(others.clone());
            }
        }
        self.deadlines.clear();
        self.auth_queue.clear();
        self.active_auth = None;
        self.rekey_waiters.clear();
        self.deferred.clear();
        self.deferred_done.clear();
        self.staged.clear();
        self.outbox.clear();
        self.verdict = None;

        // Operations are already failed above; only the Closed events matter.
        let _ = self.mux.fail_all(&others);
        self.set_state(SessionState::Closed);
    }
}

async fn wait_verdict(verdict: &mut Option<Verdict>) -> bool {
    match verdict {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}
