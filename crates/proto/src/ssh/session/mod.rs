//! SSH session coordinator.
//!
//! [`Session::connect`] spawns one task per connection that owns the
//! transport and runs every protocol engine. The returned [`Session`] is a
//! cheap, cloneable handle: each call queues a command for that task and
//! immediately returns an [`Operation`] that resolves exactly once.
//!
//! # Example
//!
//! ```rust,no_run
//! use tether_proto::ssh::auth::Credential;
//! use tether_proto::ssh::hostkey::PinnedFingerprints;
//! use tether_proto::ssh::session::{Session, SessionConfig};
//! use tether_proto::ssh::channel::ChannelEvent;
//!
//! # async fn example() -> tether_platform::TetherResult<()> {
//! let config = SessionConfig::builder()
//!     .host_key_verifier(PinnedFingerprints::new(["SHA256:uNiVztksCsDhcc0u9e8BujQXVUpKZIDTMczCvj3tD2s"]))
//!     .build()?;
//!
//! let (session, connected) = Session::connect_tcp("server.example:22", config).await?;
//! connected.await?;
//! session.login("deploy", vec![Credential::password("hunter2")]).await?;
//!
//! let mut channel = session.open_channel_session().await?;
//! session.exec(channel.id(), "uptime").await?;
//! while let Some(event) = channel.recv().await {
//!     if let ChannelEvent::Data(bytes) = event {
//!         print!("{}", String::from_utf8_lossy(&bytes));
//!     }
//! }
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod driver;
pub mod keepalive;
mod operation;

pub use config::{RekeyPolicy, SessionConfig, SessionConfigBuilder, Timeouts};
pub use keepalive::create_keepalive_message;
pub use operation::Operation;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_platform::{TetherError, TetherResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::ssh::auth::Credential;
use crate::ssh::channel::{ChannelHandle, OpId};
use crate::ssh::connection::{ChannelRequestType, ChannelType, EXTENDED_DATA_STDERR};
use crate::ssh::hostkey::HostKeyInfo;
use crate::ssh::kex::Algorithms;
use driver::{Command, Driver, Snapshot};
use operation::{operation, Completer};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// Identification and first key exchange in progress
    #[default]
    Connecting,
    /// Keys established, not yet logged in
    Established,
    /// Logged in
    Authenticated,
    /// Disconnected or failed
    Closed,
}

/// Result of a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    /// Server identification line
    pub server_version: String,
    /// Negotiated algorithms
    pub algorithms: Algorithms,
    /// Accepted server host key
    pub host_key: HostKeyInfo,
}

/// Facts about an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Server identification line
    pub server_version: String,
    /// Algorithms of the most recent key exchange
    pub algorithms: Algorithms,
    /// `SHA256:` fingerprint of the server host key
    pub host_key_fingerprint: String,
    /// True after a successful login
    pub authenticated: bool,
}

/// Handle to one SSH session.
///
/// Clones share the session. The session is disconnected once every
/// handle has been dropped.
#[derive(Debug, Clone)]
pub struct Session {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    cancels: mpsc::UnboundedSender<OpId>,
    snapshot: watch::Receiver<Snapshot>,
    next_op: Arc<AtomicU64>,
    timeouts: Timeouts,
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

impl Session {
    /// Starts a session over an already connected byte stream.
    ///
    /// The returned operation completes once the first key exchange is done
    /// and the host key was accepted.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn connect<S>(transport: S, config: SessionConfig) -> (Session, Operation<ConnectInfo>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (commands, rx) = mpsc::unbounded_channel();
        let (cancels, cancel_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(Snapshot::default());
        let next_op = Arc::new(AtomicU64::new(1));
        let timeouts = config.timeouts;

        let (connected, done) = operation(next_op.fetch_add(1, Ordering::Relaxed));
        let connected = connected.notify_cancel(cancels.clone());
        let driver = Driver::new(
            id,
            transport,
            config,
            rx,
            cancel_rx,
            snapshot_tx,
            done,
            deadline(timeouts.connect),
        );
        tokio::spawn(driver.run());

        let session = Session {
            id,
            commands,
            cancels,
            snapshot,
            next_op,
            timeouts,
        };
        (session, connected)
    }

    /// Opens a TCP connection within the connect timeout, then calls
    /// [`Session::connect`].
    ///
    /// # Errors
    ///
    /// `Timeout` if the TCP connect does not finish in time, `Transport`
    /// for socket errors.
    pub async fn connect_tcp<A: ToSocketAddrs>(
        addr: A,
        config: SessionConfig,
    ) -> TetherResult<(Session, Operation<ConnectInfo>)> {
        let connecting = TcpStream::connect(addr);
        let stream = match config.timeouts.connect {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| TetherError::timeout("TCP connect timed out"))??,
            None => connecting.await?,
        };
        stream.set_nodelay(true)?;
        Ok(Self::connect(stream, config))
    }

    /// Process-unique session number used in log records.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn submit<T>(&self, build: impl FnOnce(Completer<T>) -> Command) -> Operation<T> {
        let (op, done) = operation(self.next_op.fetch_add(1, Ordering::Relaxed));
        let op = op.notify_cancel(self.cancels.clone());
        if let Err(mpsc::error::SendError(cmd)) = self.commands.send(build(done)) {
            cmd.fail(TetherError::transport("session closed"));
        }
        op
    }

    /// Logs in as `user`, trying `credentials` against the methods the
    /// server allows.
    pub fn login(&self, user: &str, credentials: Vec<Credential>) -> Operation<()> {
        self.login_with_timeout(user, credentials, self.timeouts.login)
    }

    /// [`Session::login`] with an explicit deadline.
    pub fn login_with_timeout(
        &self,
        user: &str,
        credentials: Vec<Credential>,
        timeout: Option<Duration>,
    ) -> Operation<()> {
        let user = user.to_string();
        self.submit(|done| Command::Login {
            user,
            credentials,
            done,
            deadline: deadline(timeout),
        })
    }

    /// Asks the server which methods `user` may authenticate with. An
    /// empty list means no authentication was needed.
    pub fn auth_methods(&self, user: &str) -> Operation<Vec<String>> {
        let user = user.to_string();
        let timeout = self.timeouts.login;
        self.submit(|done| Command::AuthMethods {
            user,
            done,
            deadline: deadline(timeout),
        })
    }

    /// Opens a channel of the given type.
    pub fn open_channel(&self, kind: ChannelType) -> Operation<ChannelHandle> {
        self.open_channel_with_timeout(kind, self.timeouts.open_channel)
    }

    /// Opens a "session" channel.
    pub fn open_channel_session(&self) -> Operation<ChannelHandle> {
        self.open_channel(ChannelType::Session)
    }

    /// [`Session::open_channel`] with an explicit deadline.
    pub fn open_channel_with_timeout(
        &self,
        kind: ChannelType,
        timeout: Option<Duration>,
    ) -> Operation<ChannelHandle> {
        self.submit(|done| Command::OpenChannel {
            kind,
            done,
            deadline: deadline(timeout),
        })
    }

    /// Sends data. Completes with the byte count once every byte has been
    /// written to the transport.
    pub fn send(&self, channel: u32, data: impl Into<Vec<u8>>) -> Operation<usize> {
        self.send_with_timeout(channel, None, data.into(), self.timeouts.send)
    }

    /// Sends stderr extended data.
    pub fn send_stderr(&self, channel: u32, data: impl Into<Vec<u8>>) -> Operation<usize> {
        self.send_with_timeout(
            channel,
            Some(EXTENDED_DATA_STDERR),
            data.into(),
            self.timeouts.send,
        )
    }

    /// Sends data or extended data (`data_type`) with an explicit deadline.
    pub fn send_with_timeout(
        &self,
        channel: u32,
        data_type: Option<u32>,
        data: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Operation<usize> {
        self.submit(|done| Command::Send {
            channel,
            data_type,
            data,
            done,
            deadline: deadline(timeout),
        })
    }

    /// Sends a channel request and waits for the server's answer.
    pub fn request(&self, channel: u32, request: ChannelRequestType) -> Operation<()> {
        self.request_with_timeout(channel, request, true, self.timeouts.request)
    }

    /// Sends a channel request. Without `want_reply` the operation
    /// completes as soon as the request is written.
    pub fn request_with_timeout(
        &self,
        channel: u32,
        request: ChannelRequestType,
        want_reply: bool,
        timeout: Option<Duration>,
    ) -> Operation<()> {
        self.submit(|done| Command::Request {
            channel,
            request,
            want_reply,
            done,
            deadline: deadline(timeout),
        })
    }

    /// Runs a command on the channel.
    pub fn exec(&self, channel: u32, command: &str) -> Operation<()> {
        self.request(
            channel,
            ChannelRequestType::Exec {
                command: command.to_string(),
            },
        )
    }

    /// Starts the user's shell.
    pub fn shell(&self, channel: u32) -> Operation<()> {
        self.request(channel, ChannelRequestType::Shell)
    }

    /// Starts a subsystem such as "sftp".
    pub fn subsystem(&self, channel: u32, name: &str) -> Operation<()> {
        self.request(
            channel,
            ChannelRequestType::Subsystem {
                name: name.to_string(),
            },
        )
    }

    /// Requests a pseudo-terminal with no terminal modes.
    pub fn pty(&self, channel: u32, term: &str, width: u32, height: u32) -> Operation<()> {
        self.request(
            channel,
            ChannelRequestType::PtyReq {
                term: term.to_string(),
                width_chars: width,
                height_rows: height,
                width_pixels: 0,
                height_pixels: 0,
                // TTY_OP_END
                modes: vec![0],
            },
        )
    }

    /// Reports a terminal size change. No reply is requested.
    pub fn pty_size(&self, channel: u32, width: u32, height: u32) -> Operation<()> {
        self.request_with_timeout(
            channel,
            ChannelRequestType::WindowChange {
                width_chars: width,
                height_rows: height,
                width_pixels: 0,
                height_pixels: 0,
            },
            false,
            self.timeouts.request,
        )
    }

    /// Sets an environment variable for the command or shell.
    pub fn setenv(&self, channel: u32, name: &str, value: &str) -> Operation<()> {
        self.request(
            channel,
            ChannelRequestType::Env {
                name: name.to_string(),
                value: value.to_string(),
            },
        )
    }

    /// Requests X11 forwarding.
    pub fn x11_req(
        &self,
        channel: u32,
        single_connection: bool,
        auth_protocol: &str,
        auth_cookie: &str,
        screen_number: u32,
    ) -> Operation<()> {
        self.request(
            channel,
            ChannelRequestType::X11Req {
                single_connection,
                auth_protocol: auth_protocol.to_string(),
                auth_cookie: auth_cookie.to_string(),
                screen_number,
            },
        )
    }

    /// Sends EOF behind any queued data.
    pub fn eof(&self, channel: u32) -> Operation<()> {
        let timeout = self.timeouts.request;
        self.submit(|done| Command::Eof {
            channel,
            done,
            deadline: deadline(timeout),
        })
    }

    /// Completes once everything sent on the channel before this call has
    /// been written to the transport. Data still waiting for window space
    /// holds it back.
    pub fn flush(&self, channel: u32) -> Operation<()> {
        let timeout = self.timeouts.send;
        self.submit(|done| Command::Flush {
            channel,
            done,
            deadline: deadline(timeout),
        })
    }

    /// Closes a channel. Completes when the server's CLOSE arrives.
    pub fn close_channel(&self, channel: u32) -> Operation<()> {
        let timeout = self.timeouts.request;
        self.submit(|done| Command::CloseChannel {
            channel,
            done,
            deadline: deadline(timeout),
        })
    }

    /// Starts a key exchange. Completes when both directions use the new
    /// keys.
    pub fn rekey(&self) -> Operation<()> {
        let timeout = self.timeouts.request;
        self.submit(|done| Command::Rekey {
            done,
            deadline: deadline(timeout),
        })
    }

    /// Sends SSH_MSG_DISCONNECT and closes the transport. Every other
    /// pending operation fails with `Transport`.
    pub fn disconnect(&self) -> Operation<()> {
        self.submit(|done| Command::Disconnect { done })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    /// Negotiated facts, once the first key exchange is done.
    pub fn info(&self) -> Option<SessionInfo> {
        self.snapshot.borrow().info.clone()
    }

    /// The error that closed the session, if it failed.
    pub fn last_error(&self) -> Option<TetherError> {
        self.snapshot.borrow().last_error.clone()
    }

    /// Most recent authentication banner from the server.
    pub fn banner(&self) -> Option<String> {
        self.snapshot.borrow().banner.clone()
    }

    /// Waits until the session is closed.
    pub async fn closed(&self) {
        let mut snapshot = self.snapshot.clone();
        // An error means the session task is gone, which is closed as well
        let _ = snapshot
            .wait_for(|snap| snap.state == SessionState::Closed)
            .await;
    }
}
