//! Scripted in-process SSH server used by the session integration tests.
//!
//! The server speaks the real protocol over one half of a
//! [`tokio::io::duplex`] pipe, using the crate's own transport codec and
//! server-role key exchange. It knows just enough of the userauth and
//! connection layers to drive a client session:
//!
//! - `none`, `password`, `publickey` and `keyboard-interactive` logins
//! - `exec` replies with output, stderr, an exit status, EOF and CLOSE
//! - `shell` echoes channel data back
//! - windows are never adjusted unless a test injects an adjust
//! - a password listed as stalled is answered only when the next userauth
//!   message arrives
//!
//! Tests inject raw payloads through [`TestServer::send`] and observe what
//! the server saw through [`TestServer::wait_for`].

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tether_platform::{TetherError, TetherResult};
use tether_proto::ssh::auth::{
    signature_data, AuthMethod, InfoRequest, Prompt, UserauthBanner, UserauthFailure,
    UserauthRequest,
};
use tether_proto::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure,
    ChannelOpenConfirmation, ChannelRequest, ChannelRequestType, ChannelSuccess,
    EXTENDED_DATA_STDERR,
};
use tether_proto::ssh::encoding::Reader;
use tether_proto::ssh::hostkey::{fingerprint, Ed25519HostKey, HostKey, HostKeyInfo, PublicKey};
use tether_proto::ssh::kex::{AlgorithmPreferences, KexEngine, KexOutput};
use tether_proto::ssh::message::Message;
use tether_proto::ssh::session::{ConnectInfo, Session, SessionConfig};
use tether_proto::ssh::transport::{Decoded, TransportCodec};
use tether_proto::ssh::version::Version;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

/// Identification line the server sends, without CR LF.
pub const SERVER_VERSION: &str = "SSH-2.0-TestServer_1.0";

/// Server channel ids are the client's id plus this offset.
const CHANNEL_OFFSET: u32 = 100;

/// What the server accepts and how it sizes channels.
#[derive(Clone)]
pub struct ServerOptions {
    pub algorithms: AlgorithmPreferences,
    /// Methods listed in USERAUTH_FAILURE
    pub methods: Vec<String>,
    pub password: Option<String>,
    /// Accepted user public key blob
    pub user_key: Option<Vec<u8>>,
    /// Accepted keyboard-interactive answer
    pub kbd_answer: Option<String>,
    pub banner: Option<String>,
    pub none_succeeds: bool,
    /// Password whose rejection is held back
    pub stalled_password: Option<String>,
    /// Window the server grants on each confirmed channel
    pub window: u32,
    pub max_packet: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            algorithms: AlgorithmPreferences::default(),
            methods: vec!["publickey".to_string(), "password".to_string()],
            password: Some("secret".to_string()),
            user_key: None,
            kbd_answer: None,
            banner: None,
            none_succeeds: false,
            stalled_password: None,
            window: 1 << 20,
            max_packet: 32 * 1024,
        }
    }
}

/// Everything the server observed, in receipt order where it matters.
#[derive(Debug, Clone, Default)]
pub struct ServerLog {
    pub client_version: Option<String>,
    /// Completed key exchanges
    pub exchanges: u32,
    /// Method name of every USERAUTH_REQUEST
    pub auth_attempts: Vec<String>,
    /// Channel request names
    pub requests: Vec<String>,
    /// Channel data, all channels
    pub received: Vec<u8>,
    pub stderr: Vec<u8>,
    pub eofs: u32,
    pub closes: u32,
    pub ignores: u32,
    pub unimplemented: Vec<u32>,
    pub request_failures: u32,
    pub open_failures: u32,
    /// Client channel ids from OPEN_CONFIRMATION
    pub confirmed_opens: Vec<u32>,
    /// Reason code of a received DISCONNECT
    pub disconnect: Option<u32>,
    /// The connection ended
    pub hangup: bool,
}

enum Action {
    Send(Vec<u8>),
    SendCorrupted(Vec<u8>),
}

/// Handle to a running scripted server.
pub struct TestServer {
    pub host_key: Arc<Ed25519HostKey>,
    actions: mpsc::UnboundedSender<Action>,
    log: watch::Receiver<ServerLog>,
}

impl TestServer {
    /// Spawns a server and returns the client half of the pipe.
    pub fn start(options: ServerOptions) -> (TestServer, DuplexStream) {
        let (client, server) = duplex(1 << 20);
        let host_key = Arc::new(Ed25519HostKey::generate());
        let (actions, actions_rx) = mpsc::unbounded_channel();
        let (log_tx, log) = watch::channel(ServerLog::default());

        let connection = Connection {
            stream: server,
            options,
            host_key: Arc::clone(&host_key),
            actions: actions_rx,
            actions_open: true,
            log: log_tx,
            codec: TransportCodec::new(),
            kex: None,
            outbox: Vec::new(),
            held_reply: None,
            echo: HashSet::new(),
            closed_sent: HashSet::new(),
        };
        tokio::spawn(connection.run());

        (
            TestServer {
                host_key,
                actions,
                log,
            },
            client,
        )
    }

    /// `SHA256:` fingerprint of the server host key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.host_key.public_key_bytes())
    }

    /// Sends a raw payload to the client.
    pub fn send(&self, payload: Vec<u8>) {
        let _ = self.actions.send(Action::Send(payload));
    }

    /// Sends a payload whose last wire byte (inside the MAC or tag) is
    /// flipped.
    pub fn send_corrupted(&self, payload: Vec<u8>) {
        let _ = self.actions.send(Action::SendCorrupted(payload));
    }

    /// Current log.
    pub fn log(&self) -> ServerLog {
        self.log.borrow().clone()
    }

    /// Waits until `condition` holds for the log, panicking after ten
    /// seconds or if the server stops first.
    pub async fn wait_for(
        &self,
        what: &str,
        mut condition: impl FnMut(&ServerLog) -> bool,
    ) -> ServerLog {
        let mut log = self.log.clone();
        let waited = tokio::time::timeout(Duration::from_secs(10), log.wait_for(|l| condition(l)))
            .await
            .map(|seen| seen.map(|current| ServerLog::clone(&current)));
        let out = match waited {
            Ok(Ok(current)) => current,
            Ok(Err(_)) => panic!("server stopped before {}: {:?}", what, self.log()),
            Err(_) => panic!("timed out waiting for {}: {:?}", what, self.log()),
        };
        out
    }
}

/// Session configuration trusting any host key.
pub fn accept_all() -> SessionConfig {
    SessionConfig::builder()
        .host_key_verifier(|_: &HostKeyInfo| true)
        .build()
        .unwrap()
}

/// Starts a server and completes the connect operation against it.
pub async fn connected(
    options: ServerOptions,
    config: SessionConfig,
) -> (TestServer, Session, ConnectInfo) {
    let (server, stream) = TestServer::start(options);
    let (session, connecting) = Session::connect(stream, config);
    let info = tokio::time::timeout(Duration::from_secs(10), connecting)
        .await
        .expect("connect timed out")
        .expect("connect failed");
    (server, session, info)
}

/// Connects and logs in as `alice` with the default password.
pub async fn logged_in(options: ServerOptions, config: SessionConfig) -> (TestServer, Session) {
    let (server, session, _) = connected(options, config).await;
    session
        .login(
            "alice",
            vec![tether_proto::ssh::Credential::password("secret")],
        )
        .await
        .expect("login failed");
    (server, session)
}

struct Connection {
    stream: DuplexStream,
    options: ServerOptions,
    host_key: Arc<Ed25519HostKey>,
    actions: mpsc::UnboundedReceiver<Action>,
    actions_open: bool,
    log: watch::Sender<ServerLog>,
    codec: TransportCodec,
    kex: Option<KexEngine>,
    outbox: Vec<u8>,
    /// USERAUTH reply for a stalled password
    held_reply: Option<Vec<u8>>,
    /// Client channel ids in echo mode
    echo: HashSet<u32>,
    /// Client channel ids we already sent CLOSE for
    closed_sent: HashSet<u32>,
}

impl Connection {
    async fn run(mut self) {
        if let Err(e) = self.serve().await {
            tracing::debug!(error = %e, "test server stopped");
        }
        self.log.send_modify(|l| l.hangup = true);
    }

    async fn serve(&mut self) -> TetherResult<()> {
        self.stream
            .write_all(format!("{}\r\n", SERVER_VERSION).as_bytes())
            .await?;

        let mut buf = vec![0u8; 32 * 1024];
        let mut skipped = 0;
        let client_version = loop {
            if let Some(version) = Version::take_from(self.codec.inbound_mut(), &mut skipped)? {
                break version;
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            self.codec.feed(&buf[..n]);
        };
        let identification = client_version.identification().to_string();
        self.log
            .send_modify(|l| l.client_version = Some(identification.clone()));

        let host_key: Arc<dyn HostKey> = self.host_key.clone();
        let mut kex = KexEngine::server(
            0,
            self.options.algorithms.clone(),
            host_key,
            &identification,
            SERVER_VERSION,
        );
        let out = kex.start()?;
        self.kex = Some(kex);
        self.apply_kex(out)?;
        // Our KEXINIT goes out even when the client's makes us give up
        let processed = self.process();
        self.flush().await?;
        if !processed? {
            return Ok(());
        }

        loop {
            tokio::select! {
                read = self.stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    self.codec.feed(&buf[..n]);
                    let processed = self.process();
                    self.flush().await?;
                    if !processed? {
                        return Ok(());
                    }
                }
                action = self.actions.recv(), if self.actions_open => match action {
                    Some(Action::Send(payload)) => self.send(&payload)?,
                    Some(Action::SendCorrupted(payload)) => {
                        let mut wire = self.codec.encode(&payload)?;
                        if let Some(last) = wire.last_mut() {
                            *last ^= 0x01;
                        }
                        self.outbox.extend_from_slice(&wire);
                    }
                    None => self.actions_open = false,
                },
            }
            self.flush().await?;
        }
    }

    async fn flush(&mut self) -> TetherResult<()> {
        if !self.outbox.is_empty() {
            self.stream.write_all(&self.outbox).await?;
            self.outbox.clear();
        }
        Ok(())
    }

    fn send(&mut self, payload: &[u8]) -> TetherResult<()> {
        let wire = self.codec.encode(payload)?;
        self.outbox.extend_from_slice(&wire);
        Ok(())
    }

    /// Handles every complete packet. Returns false once the client
    /// disconnected.
    fn process(&mut self) -> TetherResult<bool> {
        loop {
            match self.codec.decode()? {
                Decoded::Packet(payload) => {
                    if !self.handle(payload)? {
                        return Ok(false);
                    }
                }
                Decoded::Incomplete => return Ok(true),
            }
        }
    }

    fn apply_kex(&mut self, outputs: Vec<KexOutput>) -> TetherResult<()> {
        for output in outputs {
            match output {
                KexOutput::Send(payload) => self.send(&payload)?,
                KexOutput::InstallOutbound(keys) => self.codec.install_outbound(&keys)?,
                KexOutput::InstallInbound(keys) => self.codec.install_inbound(&keys)?,
                KexOutput::Established => self.log.send_modify(|l| l.exchanges += 1),
                KexOutput::VerifyHostKey(_) => {}
            }
        }
        Ok(())
    }

    fn handle(&mut self, payload: Vec<u8>) -> TetherResult<bool> {
        let msg = Message::decode(&payload)?;
        match msg {
            Message::KexInit(_) | Message::KexDhInit(_) | Message::KexDhReply(_) | Message::NewKeys => {
                let kex = self
                    .kex
                    .as_mut()
                    .ok_or_else(|| TetherError::protocol("no key exchange"))?;
                let out = kex.handle(msg, &payload)?;
                self.apply_kex(out)?;
            }
            Message::Disconnect(d) => {
                self.log.send_modify(|l| l.disconnect = Some(d.reason_code));
                return Ok(false);
            }
            Message::Ignore(_) => self.log.send_modify(|l| l.ignores += 1),
            Message::Unimplemented(seq) => self.log.send_modify(|l| l.unimplemented.push(seq)),
            Message::RequestFailure => self.log.send_modify(|l| l.request_failures += 1),
            Message::ChannelOpenFailure(_) => self.log.send_modify(|l| l.open_failures += 1),
            Message::ChannelOpenConfirmation(confirm) => {
                let client = confirm.sender_channel();
                self.log.send_modify(|l| l.confirmed_opens.push(client));
            }
            Message::ServiceRequest(name) => {
                self.send(&Message::ServiceAccept(name).encode())?;
                if let Some(text) = self.options.banner.clone() {
                    self.send(&UserauthBanner::new(text).to_bytes())?;
                }
            }
            Message::UserauthRequest(request) => self.on_userauth(request)?,
            Message::UserauthMethodSpecific(raw) => self.on_info_response(&raw)?,
            Message::ChannelOpen(open) => {
                let client = open.sender_channel();
                let confirm = ChannelOpenConfirmation::new(
                    client,
                    client + CHANNEL_OFFSET,
                    self.options.window,
                    self.options.max_packet,
                );
                self.send(&confirm.to_bytes())?;
            }
            Message::ChannelRequest(request) => self.on_channel_request(request)?,
            Message::ChannelData(data) => {
                let client = data.recipient_channel().wrapping_sub(CHANNEL_OFFSET);
                let bytes = data.into_data();
                if self.echo.contains(&client) {
                    self.send(&ChannelData::new(client, bytes.clone()).to_bytes())?;
                }
                self.log.send_modify(|l| l.received.extend_from_slice(&bytes));
            }
            Message::ChannelExtendedData(data) => {
                self.log.send_modify(|l| l.stderr.extend_from_slice(data.data()))
            }
            Message::ChannelEof(_) => self.log.send_modify(|l| l.eofs += 1),
            Message::ChannelClose(close) => {
                let client = close.recipient_channel().wrapping_sub(CHANNEL_OFFSET);
                self.echo.remove(&client);
                if !self.closed_sent.remove(&client) {
                    self.send(&ChannelClose::new(client).to_bytes())?;
                }
                self.log.send_modify(|l| l.closes += 1);
            }
            _ => {}
        }
        Ok(true)
    }

    fn on_userauth(&mut self, request: UserauthRequest) -> TetherResult<()> {
        self.release_held()?;
        let method = request.method().clone();
        self.log
            .send_modify(|l| l.auth_attempts.push(method.name().to_string()));

        let accepted = match &method {
            AuthMethod::None => self.options.none_succeeds,
            AuthMethod::Password(password) => {
                if self.options.stalled_password.as_deref() == Some(password.as_str()) {
                    let failure = UserauthFailure::new(self.options.methods.clone(), false);
                    self.held_reply = Some(Message::UserauthFailure(failure).encode());
                    return Ok(());
                }
                self.options.password.as_deref() == Some(password.as_str())
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature: Some(signature),
            } => {
                let session_id = self
                    .kex
                    .as_ref()
                    .and_then(KexEngine::session_id)
                    .unwrap_or_default()
                    .to_vec();
                let data = signature_data(
                    &session_id,
                    request.user_name(),
                    request.service_name(),
                    algorithm,
                    public_key,
                );
                self.options.user_key.as_deref() == Some(public_key.as_slice())
                    && PublicKey::from_blob(public_key)
                        .and_then(|key| key.verify(algorithm, &data, signature))
                        .is_ok()
            }
            AuthMethod::PublicKey { .. } => false,
            AuthMethod::KeyboardInteractive { .. } => {
                let info = InfoRequest {
                    name: "test".to_string(),
                    instruction: String::new(),
                    prompts: vec![Prompt {
                        prompt: "Password: ".to_string(),
                        echo: false,
                    }],
                };
                return self.send(&info.to_bytes());
            }
        };
        self.auth_reply(accepted)
    }

    /// Sends a held USERAUTH reply ahead of anything newer.
    fn release_held(&mut self) -> TetherResult<()> {
        match self.held_reply.take() {
            Some(reply) => self.send(&reply),
            None => Ok(()),
        }
    }

    fn on_info_response(&mut self, raw: &[u8]) -> TetherResult<()> {
        self.release_held()?;
        if raw.first() != Some(&61) {
            return Err(TetherError::protocol("unexpected userauth message"));
        }
        let mut reader = Reader::new(&raw[1..]);
        let count = reader.read_u32()?;
        let mut answers = Vec::new();
        for _ in 0..count {
            answers.push(reader.read_string()?);
        }
        let accepted = answers.len() == 1
            && self.options.kbd_answer.as_deref() == Some(answers[0].as_str());
        self.auth_reply(accepted)
    }

    fn auth_reply(&mut self, accepted: bool) -> TetherResult<()> {
        let reply = if accepted {
            Message::UserauthSuccess
        } else {
            Message::UserauthFailure(UserauthFailure::new(self.options.methods.clone(), false))
        };
        self.send(&reply.encode())
    }

    fn on_channel_request(&mut self, request: ChannelRequest) -> TetherResult<()> {
        let client = request.recipient_channel().wrapping_sub(CHANNEL_OFFSET);
        let want_reply = request.want_reply();
        let name = request.request_type().name().to_string();
        self.log.send_modify(|l| l.requests.push(name.clone()));

        match request.into_request_type() {
            ChannelRequestType::Exec { command } => {
                self.reply(client, want_reply, true)?;
                let output = format!("ran: {}\n", command).into_bytes();
                self.send(&ChannelData::new(client, output).to_bytes())?;
                self.send(
                    &ChannelExtendedData::new(client, EXTENDED_DATA_STDERR, b"warning\n".to_vec())
                        .to_bytes(),
                )?;
                let status = ChannelRequestType::ExitStatus { exit_status: 0 };
                self.send(&ChannelRequest::new(client, status, false).to_bytes())?;
                self.send(&ChannelEof::new(client).to_bytes())?;
                self.send(&ChannelClose::new(client).to_bytes())?;
                self.closed_sent.insert(client);
                Ok(())
            }
            ChannelRequestType::Shell => {
                self.echo.insert(client);
                self.reply(client, want_reply, true)
            }
            ChannelRequestType::Subsystem { name } => {
                self.reply(client, want_reply, name != "forbidden")
            }
            _ => self.reply(client, want_reply, true),
        }
    }

    fn reply(&mut self, client: u32, want_reply: bool, success: bool) -> TetherResult<()> {
        if !want_reply {
            return Ok(());
        }
        if success {
            self.send(&ChannelSuccess::new(client).to_bytes())
        } else {
            self.send(&ChannelFailure::new(client).to_bytes())
        }
    }
}
