//! SSH user authentication (RFC 4252, RFC 4256).
//!
//! Supported client methods:
//! - "password"
//! - "publickey" (signed request sent directly)
//! - "keyboard-interactive" (answered by a caller [`KeyboardInteractive`])
//! - "none" (used to learn the server's method list)
//!
//! [`AuthEngine`] is I/O free. The session driver feeds it userauth
//! messages and carries out the [`AuthOutput`] actions it returns.
//!
//! # Attempt Order
//!
//! Methods are tried in the order the server advertises them, each paired
//! with the first caller credential of that kind not yet tried. A
//! (method, credential) pair is attempted at most once per session, even
//! across separate logins.
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::auth::{AuthMethod, UserauthRequest};
//!
//! let request = UserauthRequest::new(
//!     "alice",
//!     "ssh-connection",
//!     AuthMethod::password("secret"),
//! );
//! assert_eq!(request.to_bytes()[0], 50);
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};
use tether_platform::{AuthFailureKind, TetherError, TetherResult};
use tracing::debug;
use zeroize::Zeroizing;

use super::encoding::{put_bool, put_bytes, put_name_list, put_str, Reader};
use super::hostkey::HostKey;
use super::logging;
use super::message::{Message, MessageType};

/// Service requested before authentication.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Service started after authentication.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// SSH authentication method carried in a request.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Query the method list.
    None,
    /// Password authentication.
    Password(Zeroizing<String>),
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature (if present)
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication (RFC 4256).
    KeyboardInteractive {
        /// Language tag
        language: String,
        /// Submethod hints
        submethods: String,
    },
}

impl AuthMethod {
    /// Wraps a password.
    pub fn password(password: impl Into<String>) -> Self {
        AuthMethod::Password(Zeroizing::new(password.into()))
    }

    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::None => f.write_str("None"),
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::PublicKey {
                algorithm,
                signature,
                ..
            } => f
                .debug_struct("PublicKey")
                .field("algorithm", algorithm)
                .field("signed", &signature.is_some())
                .finish(),
            AuthMethod::KeyboardInteractive { submethods, .. } => f
                .debug_struct("KeyboardInteractive")
                .field("submethods", submethods)
                .finish(),
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl UserauthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the request.
    ///
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        put_str(&mut buf, &self.user_name);
        put_str(&mut buf, &self.service_name);
        put_str(&mut buf, self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                // Not a password change
                put_bool(&mut buf, false);
                put_str(&mut buf, password);
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                put_bool(&mut buf, signature.is_some());
                put_str(&mut buf, algorithm);
                put_bytes(&mut buf, public_key);
                if let Some(sig) = signature {
                    put_bytes(&mut buf, sig);
                }
            }
            AuthMethod::KeyboardInteractive {
                language,
                submethods,
            } => {
                put_str(&mut buf, language);
                put_str(&mut buf, submethods);
            }
        }
        buf.to_vec()
    }

    /// Parses a request.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation for malformed data or an unknown method.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(MessageType::UserauthRequest as u8, "SSH_MSG_USERAUTH_REQUEST")?;
        let user_name = reader.read_string()?;
        let service_name = reader.read_string()?;
        let method_name = reader.read_string()?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let _changing = reader.read_bool()?;
                AuthMethod::Password(Zeroizing::new(reader.read_string()?))
            }
            "publickey" => {
                let has_signature = reader.read_bool()?;
                let algorithm = reader.read_string()?;
                let public_key = reader.read_bytes()?.to_vec();
                let signature = if has_signature {
                    Some(reader.read_bytes()?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => AuthMethod::KeyboardInteractive {
                language: reader.read_string()?,
                submethods: reader.read_string()?,
            },
            other => {
                return Err(TetherError::protocol(format!(
                    "unsupported authentication method '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthFailure {
    /// Authentications that can continue
    pub methods: Vec<String>,
    /// Partial success flag
    pub partial_success: bool,
}

impl UserauthFailure {
    /// Creates a failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods,
            partial_success,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        put_name_list(&mut buf, &self.methods);
        put_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(MessageType::UserauthFailure as u8, "SSH_MSG_USERAUTH_FAILURE")?;
        Ok(Self {
            methods: reader.read_name_list()?,
            partial_success: reader.read_bool()?,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthBanner {
    /// Banner text
    pub message: String,
    /// Language tag
    pub language: String,
}

impl UserauthBanner {
    /// Creates a banner.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            language: String::new(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        put_str(&mut buf, &self.message);
        put_str(&mut buf, &self.language);
        buf.to_vec()
    }

    /// Parses from bytes. A missing language tag is tolerated.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(MessageType::UserauthBanner as u8, "SSH_MSG_USERAUTH_BANNER")?;
        let message = reader.read_string()?;
        let language = if reader.remaining() > 0 {
            reader.read_string()?
        } else {
            String::new()
        };
        Ok(Self { message, language })
    }
}

/// One prompt of a keyboard-interactive info request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text
    pub prompt: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST message (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Dialogue name
    pub name: String,
    /// Instruction text
    pub instruction: String,
    /// Prompts, possibly empty
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Serializes to bytes (message number 60).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        put_str(&mut buf, &self.name);
        put_str(&mut buf, &self.instruction);
        put_str(&mut buf, "");
        buf.put_u32(self.prompts.len() as u32);
        for p in &self.prompts {
            put_str(&mut buf, &p.prompt);
            put_bool(&mut buf, p.echo);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(MessageType::UserauthPkOk as u8, "SSH_MSG_USERAUTH_INFO_REQUEST")?;
        let name = reader.read_string()?;
        let instruction = reader.read_string()?;
        let _language = reader.read_string()?;
        let count = reader.read_u32()? as usize;
        // Each prompt needs at least five bytes
        if count > reader.remaining() / 5 {
            return Err(TetherError::protocol(format!(
                "info request claims {} prompts",
                count
            )));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            prompts.push(Prompt {
                prompt: reader.read_string()?,
                echo: reader.read_bool()?,
            });
        }
        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// Builds SSH_MSG_USERAUTH_INFO_RESPONSE.
fn info_response(responses: &[Zeroizing<String>]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::UserauthInfoResponse as u8);
    buf.put_u32(responses.len() as u32);
    for r in responses {
        put_str(&mut buf, r);
    }
    buf.to_vec()
}

/// Data signed for publickey authentication (RFC 4252 Section 7).
pub fn signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_bytes(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    put_str(&mut buf, user_name);
    put_str(&mut buf, service_name);
    put_str(&mut buf, "publickey");
    put_bool(&mut buf, true);
    put_str(&mut buf, algorithm);
    put_bytes(&mut buf, public_key);
    buf.to_vec()
}

/// Answers keyboard-interactive prompts.
///
/// Returns one answer per prompt. Called on the session task, so it must
/// not block.
pub trait KeyboardInteractive: Send + Sync {
    /// Produces the answers for one info request.
    fn respond(&self, request: &InfoRequest) -> Vec<String>;
}

impl<F> KeyboardInteractive for F
where
    F: Fn(&InfoRequest) -> Vec<String> + Send + Sync,
{
    fn respond(&self, request: &InfoRequest) -> Vec<String> {
        self(request)
    }
}

/// Caller-supplied credential material.
#[derive(Clone)]
pub enum Credential {
    /// A password for the "password" method
    Password(Zeroizing<String>),
    /// A signing key for the "publickey" method
    PublicKey(Arc<dyn HostKey>),
    /// A responder for the "keyboard-interactive" method
    KeyboardInteractive {
        /// Answers the server's prompts
        responder: Arc<dyn KeyboardInteractive>,
        /// Process-unique number assigned at construction
        id: u64,
    },
}

static NEXT_RESPONDER_ID: AtomicU64 = AtomicU64::new(1);

impl Credential {
    /// Password credential.
    pub fn password(password: impl Into<String>) -> Self {
        Credential::Password(Zeroizing::new(password.into()))
    }

    /// Public key credential.
    pub fn public_key(key: Arc<dyn HostKey>) -> Self {
        Credential::PublicKey(key)
    }

    /// Keyboard-interactive credential. Every call yields a distinct
    /// credential; clones of it stay the same credential.
    pub fn keyboard_interactive(responder: impl KeyboardInteractive + 'static) -> Self {
        Credential::KeyboardInteractive {
            responder: Arc::new(responder),
            id: NEXT_RESPONDER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Method this credential serves.
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PublicKey(_) => "publickey",
            Credential::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }

    /// Stable digest identifying the credential within a session.
    fn id(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.method().as_bytes());
        hasher.update([0u8]);
        match self {
            Credential::Password(p) => hasher.update(p.as_bytes()),
            Credential::PublicKey(k) => hasher.update(k.public_key_bytes()),
            Credential::KeyboardInteractive { id, .. } => hasher.update(id.to_be_bytes()),
        }
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::PublicKey(k) => write!(f, "PublicKey({})", k.algorithm().name()),
            Credential::KeyboardInteractive { id, .. } => write!(f, "KeyboardInteractive(#{})", id),
        }
    }
}

/// What a login run is for.
#[derive(Debug)]
pub enum AuthGoal {
    /// Authenticate with these credentials.
    Login(Vec<Credential>),
    /// Only learn the server's method list.
    ListMethods,
}

/// Action requested by the engine.
#[derive(Debug)]
pub enum AuthOutput {
    /// Send this payload
    Send(Vec<u8>),
    /// Login finished with success
    Authenticated,
    /// Method listing finished
    Methods(Vec<String>),
    /// Login finished with an auth failure
    Failed(TetherError),
}

#[derive(Debug)]
struct Run {
    user: String,
    goal: AuthGoal,
    server_methods: Option<Vec<String>>,
    current: Option<&'static str>,
    current_credential: Option<usize>,
    last_failure: Option<AuthFailureKind>,
    attempts: usize,
}

/// Client authentication engine for one session.
#[derive(Debug)]
pub struct AuthEngine {
    session: u64,
    service_requested: bool,
    service_accepted: bool,
    authenticated: bool,
    attempted: HashSet<(&'static str, [u8; 32])>,
    banner: Option<String>,
    run: Option<Run>,
    /// Replies still owed to abandoned runs, discarded on arrival
    stale_replies: usize,
}

impl AuthEngine {
    /// Creates an engine with nothing attempted.
    pub fn new(session: u64) -> Self {
        Self {
            session,
            service_requested: false,
            service_accepted: false,
            authenticated: false,
            attempted: HashSet::new(),
            banner: None,
            run: None,
            stale_replies: 0,
        }
    }

    /// True after USERAUTH_SUCCESS.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// True while a login or method listing is running.
    pub fn in_progress(&self) -> bool {
        self.run.is_some()
    }

    /// Abandons the running login or method listing.
    ///
    /// The server still answers the request in flight; that answer is
    /// dropped when it arrives, and a later run proceeds normally. If the
    /// answer turns out to be USERAUTH_SUCCESS the session is
    /// authenticated anyway.
    pub fn abort(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        logging::log_auth_result(self.session, run.current.unwrap_or("none"), "abandoned");
        if self.service_accepted {
            self.stale_replies += 1;
        }
    }

    /// Most recent banner text from the server.
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    /// Starts a login or method listing for `user`.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if a run is already in progress.
    pub fn start(
        &mut self,
        user: &str,
        goal: AuthGoal,
        session_id: &[u8],
    ) -> TetherResult<Vec<AuthOutput>> {
        if self.run.is_some() {
            return Err(TetherError::protocol("authentication already in progress"));
        }
        if self.authenticated {
            return Ok(vec![match goal {
                AuthGoal::Login(_) => AuthOutput::Authenticated,
                AuthGoal::ListMethods => AuthOutput::Methods(Vec::new()),
            }]);
        }

        self.run = Some(Run {
            user: user.to_string(),
            goal,
            server_methods: None,
            current: None,
            current_credential: None,
            last_failure: None,
            attempts: 0,
        });

        if !self.service_requested {
            self.service_requested = true;
            return Ok(vec![AuthOutput::Send(
                Message::ServiceRequest(SERVICE_USERAUTH.to_string()).encode(),
            )]);
        }
        if !self.service_accepted {
            return Ok(Vec::new());
        }
        self.send_none()
    }

    fn send_none(&mut self) -> TetherResult<Vec<AuthOutput>> {
        let run = self
            .run
            .as_mut()
            .ok_or_else(|| TetherError::protocol("no authentication in progress"))?;
        logging::log_auth_attempt(self.session, &run.user, "none");
        let request = UserauthRequest::new(&run.user, SERVICE_CONNECTION, AuthMethod::None);
        Ok(vec![AuthOutput::Send(request.to_bytes())])
    }

    /// Handles a userauth-layer message (SERVICE_ACCEPT or 50-79).
    ///
    /// # Errors
    ///
    /// Protocol violations for messages that make no sense in the current
    /// state. Auth failures are reported as [`AuthOutput::Failed`], not as
    /// errors.
    pub fn handle(&mut self, msg: Message, session_id: &[u8]) -> TetherResult<Vec<AuthOutput>> {
        let reply = matches!(
            msg,
            Message::UserauthSuccess
                | Message::UserauthFailure(_)
                | Message::UserauthMethodSpecific(_)
        );
        if reply && self.stale_replies > 0 {
            return Ok(self.on_stale_reply(&msg));
        }

        match msg {
            Message::ServiceAccept(name) => {
                if name != SERVICE_USERAUTH || !self.service_requested {
                    return Err(TetherError::protocol(format!(
                        "unexpected SERVICE_ACCEPT for '{}'",
                        name
                    )));
                }
                self.service_accepted = true;
                if self.run.is_some() {
                    return self.send_none();
                }
                Ok(Vec::new())
            }
            Message::UserauthBanner(banner) => {
                self.banner = Some(banner.message);
                Ok(Vec::new())
            }
            Message::UserauthSuccess => self.on_success(),
            Message::UserauthFailure(failure) => self.on_failure(failure, session_id),
            Message::UserauthMethodSpecific(payload) => self.on_method_specific(&payload, session_id),
            _ => Err(TetherError::protocol("unexpected message in userauth layer")),
        }
    }

    fn on_stale_reply(&mut self, msg: &Message) -> Vec<AuthOutput> {
        self.stale_replies -= 1;
        if let Message::UserauthSuccess = msg {
            // Requests after success are ignored by the server
            self.stale_replies = 0;
            self.authenticated = true;
            logging::log_auth_result(self.session, "abandoned attempt", "success");
            return vec![match self.run.take().map(|run| run.goal) {
                Some(AuthGoal::ListMethods) => AuthOutput::Methods(Vec::new()),
                _ => AuthOutput::Authenticated,
            }];
        }
        debug!(session = self.session, "dropped reply to an abandoned auth request");
        Vec::new()
    }

    fn on_success(&mut self) -> TetherResult<Vec<AuthOutput>> {
        let run = self
            .run
            .take()
            .ok_or_else(|| TetherError::protocol("unexpected USERAUTH_SUCCESS"))?;
        self.authenticated = true;
        logging::log_auth_result(self.session, run.current.unwrap_or("none"), "success");
        Ok(vec![match run.goal {
            AuthGoal::Login(_) => AuthOutput::Authenticated,
            AuthGoal::ListMethods => AuthOutput::Methods(Vec::new()),
        }])
    }

    fn on_failure(
        &mut self,
        failure: UserauthFailure,
        session_id: &[u8],
    ) -> TetherResult<Vec<AuthOutput>> {
        let session = self.session;
        let run = self
            .run
            .as_mut()
            .ok_or_else(|| TetherError::protocol("unexpected USERAUTH_FAILURE"))?;

        match run.current.take() {
            None => {
                if let AuthGoal::ListMethods = run.goal {
                    self.run = None;
                    return Ok(vec![AuthOutput::Methods(failure.methods)]);
                }
            }
            Some(method) => {
                let kind = if failure.partial_success {
                    AuthFailureKind::PartialSuccess
                } else {
                    AuthFailureKind::BadCredential
                };
                logging::log_auth_result(session, method, kind_name(kind));
                run.last_failure = Some(kind);
            }
        }
        run.server_methods = Some(failure.methods);
        self.next_attempt(session_id)
    }

    fn on_method_specific(
        &mut self,
        payload: &[u8],
        session_id: &[u8],
    ) -> TetherResult<Vec<AuthOutput>> {
        let session = self.session;
        let run = self
            .run
            .as_mut()
            .ok_or_else(|| TetherError::protocol("unexpected userauth method message"))?;

        match (run.current, payload.first().copied()) {
            (Some("password"), Some(60)) => {
                // PASSWD_CHANGEREQ: expired password counts as a bad credential
                logging::log_auth_result(session, "password", "password change requested");
                run.current = None;
                run.last_failure = Some(AuthFailureKind::BadCredential);
                self.next_attempt(session_id)
            }
            (Some("keyboard-interactive"), Some(60)) => {
                let request = InfoRequest::from_bytes(payload)?;
                let responder = match run
                    .current_credential
                    .and_then(|i| credentials(&run.goal).get(i))
                {
                    Some(Credential::KeyboardInteractive { responder, .. }) => responder.clone(),
                    _ => return Err(TetherError::protocol("keyboard-interactive responder missing")),
                };
                let mut answers: Vec<Zeroizing<String>> = responder
                    .respond(&request)
                    .into_iter()
                    .map(Zeroizing::new)
                    .collect();
                answers.resize_with(request.prompts.len(), || Zeroizing::new(String::new()));
                Ok(vec![AuthOutput::Send(info_response(&answers))])
            }
            (Some("publickey"), Some(60)) => {
                // PK_OK only answers unsigned queries, which this engine never sends
                Ok(Vec::new())
            }
            (_, number) => Err(TetherError::protocol(format!(
                "unexpected userauth message {}",
                number.unwrap_or(0)
            ))),
        }
    }

    fn next_attempt(&mut self, session_id: &[u8]) -> TetherResult<Vec<AuthOutput>> {
        let session = self.session;
        let run = self
            .run
            .as_mut()
            .ok_or_else(|| TetherError::protocol("no authentication in progress"))?;
        let server_methods = run.server_methods.clone().unwrap_or_default();
        let creds = credentials(&run.goal);

        let mut overlap = false;
        let mut choice = None;
        'methods: for method in &server_methods {
            for (index, credential) in creds.iter().enumerate() {
                if credential.method() != method {
                    continue;
                }
                overlap = true;
                let key = (credential.method(), credential.id());
                if !self.attempted.contains(&key) {
                    choice = Some((index, key));
                    break 'methods;
                }
            }
        }

        let (index, key) = match choice {
            Some(c) => c,
            None => {
                let kind = match run.last_failure {
                    Some(kind) if run.attempts > 0 => kind,
                    _ if overlap || server_methods.is_empty() => AuthFailureKind::MethodsExhausted,
                    _ => AuthFailureKind::NoSuchMethod,
                };
                self.run = None;
                return Ok(vec![AuthOutput::Failed(TetherError::auth(
                    kind,
                    format!("server offers {:?}", server_methods),
                ))]);
            }
        };

        self.attempted.insert(key);
        let credential = &creds[index];
        let method = match credential {
            Credential::Password(p) => AuthMethod::Password(p.clone()),
            Credential::PublicKey(k) => {
                let algorithm = k.algorithm().name().to_string();
                let public_key = k.public_key_bytes();
                let data = signature_data(
                    session_id,
                    &run.user,
                    SERVICE_CONNECTION,
                    &algorithm,
                    &public_key,
                );
                AuthMethod::PublicKey {
                    signature: Some(k.sign(&data)?),
                    algorithm,
                    public_key,
                }
            }
            Credential::KeyboardInteractive { .. } => AuthMethod::KeyboardInteractive {
                language: String::new(),
                submethods: String::new(),
            },
        };

        logging::log_auth_attempt(session, &run.user, method.name());
        run.current = Some(credential.method());
        run.current_credential = Some(index);
        run.attempts += 1;
        let request = UserauthRequest::new(&run.user, SERVICE_CONNECTION, method);
        Ok(vec![AuthOutput::Send(request.to_bytes())])
    }
}

fn credentials(goal: &AuthGoal) -> &[Credential] {
    match goal {
        AuthGoal::Login(c) => c,
        AuthGoal::ListMethods => &[],
    }
}

fn kind_name(kind: AuthFailureKind) -> &'static str {
    match kind {
        AuthFailureKind::NoSuchMethod => "no such method",
        AuthFailureKind::BadCredential => "bad credential",
        AuthFailureKind::PartialSuccess => "partial success",
        AuthFailureKind::MethodsExhausted => "methods exhausted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::{Ed25519HostKey, PublicKey};
    use tether_platform::ErrorCode;

    const SID: &[u8] = b"session-id";

    fn failure(methods: &[&str], partial: bool) -> Message {
        Message::UserauthFailure(UserauthFailure::new(
            methods.iter().map(|s| s.to_string()).collect(),
            partial,
        ))
    }

    fn sent(out: &[AuthOutput]) -> Vec<UserauthRequest> {
        out.iter()
            .filter_map(|o| match o {
                AuthOutput::Send(p) if p[0] == 50 => UserauthRequest::from_bytes(p).ok(),
                _ => None,
            })
            .collect()
    }

    /// Engine with the service accepted and the "none" request answered.
    fn engine_at_methods(
        credentials: Vec<Credential>,
        methods: &[&str],
    ) -> (AuthEngine, Vec<AuthOutput>) {
        let mut engine = AuthEngine::new(1);
        let out = engine.start("alice", AuthGoal::Login(credentials), SID).unwrap();
        assert!(matches!(&out[..], [AuthOutput::Send(p)] if p[0] == 5));
        let out = engine
            .handle(Message::ServiceAccept(SERVICE_USERAUTH.into()), SID)
            .unwrap();
        assert_eq!(sent(&out)[0].method(), &AuthMethod::None);
        let out = engine.handle(failure(methods, false), SID).unwrap();
        (engine, out)
    }

    #[test]
    fn test_request_round_trip() {
        for method in [
            AuthMethod::None,
            AuthMethod::password("pw"),
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".into(),
                public_key: vec![1, 2, 3],
                signature: Some(vec![4, 5]),
            },
            AuthMethod::KeyboardInteractive {
                language: String::new(),
                submethods: "pam".into(),
            },
        ] {
            let req = UserauthRequest::new("bob", SERVICE_CONNECTION, method);
            assert_eq!(UserauthRequest::from_bytes(&req.to_bytes()).unwrap(), req);
        }
    }

    #[test]
    fn test_password_debug_redacted() {
        let debug = format!("{:?}", AuthMethod::password("hunter2"));
        assert!(!debug.contains("hunter2"));
        let debug = format!("{:?}", Credential::password("hunter2"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_failure_and_banner_parse() {
        let f = UserauthFailure::new(vec!["publickey".into(), "password".into()], true);
        assert_eq!(UserauthFailure::from_bytes(&f.to_bytes()).unwrap(), f);

        let b = UserauthBanner::new("Welcome");
        assert_eq!(UserauthBanner::from_bytes(&b.to_bytes()).unwrap(), b);
    }

    #[test]
    fn test_skips_method_without_credential() {
        let (mut engine, out) =
            engine_at_methods(vec![Credential::password("pw")], &["publickey", "password"]);
        let requests = sent(&out);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method().name(), "password");

        let out = engine.handle(Message::UserauthSuccess, SID).unwrap();
        assert!(matches!(out[..], [AuthOutput::Authenticated]));
        assert!(engine.is_authenticated());
        assert!(!engine.in_progress());
    }

    #[test]
    fn test_bad_password_fails_with_bad_credential() {
        let (mut engine, _) =
            engine_at_methods(vec![Credential::password("pw")], &["publickey", "password"]);
        let out = engine
            .handle(failure(&["publickey", "password"], false), SID)
            .unwrap();
        match &out[..] {
            [AuthOutput::Failed(err)] => assert_eq!(
                err.code(),
                ErrorCode::AuthFailure(AuthFailureKind::BadCredential)
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_no_overlap_is_no_such_method() {
        let (_, out) = engine_at_methods(vec![Credential::password("pw")], &["publickey"]);
        match &out[..] {
            [AuthOutput::Failed(err)] => assert_eq!(
                err.code(),
                ErrorCode::AuthFailure(AuthFailureKind::NoSuchMethod)
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_same_credential_never_retried() {
        let (mut engine, _) = engine_at_methods(vec![Credential::password("pw")], &["password"]);
        engine.handle(failure(&["password"], false), SID).unwrap();

        // Second login with the same password: no new request is sent
        let out = engine
            .start("alice", AuthGoal::Login(vec![Credential::password("pw")]), SID)
            .unwrap();
        assert_eq!(sent(&out)[0].method(), &AuthMethod::None);
        let out = engine.handle(failure(&["password"], false), SID).unwrap();
        assert!(sent(&out).is_empty());
        match &out[..] {
            [AuthOutput::Failed(err)] => assert_eq!(
                err.code(),
                ErrorCode::AuthFailure(AuthFailureKind::MethodsExhausted)
            ),
            other => panic!("unexpected {:?}", other),
        }

        // A different password is still allowed
        engine
            .start("alice", AuthGoal::Login(vec![Credential::password("pw2")]), SID)
            .unwrap();
        let out = engine.handle(failure(&["password"], false), SID).unwrap();
        assert_eq!(sent(&out).len(), 1);
    }

    #[test]
    fn test_partial_success_continues() {
        let key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate());
        let (mut engine, out) = engine_at_methods(
            vec![Credential::public_key(key.clone()), Credential::password("pw")],
            &["publickey"],
        );
        assert_eq!(sent(&out)[0].method().name(), "publickey");

        let out = engine.handle(failure(&["password"], true), SID).unwrap();
        assert_eq!(sent(&out)[0].method().name(), "password");

        let out = engine.handle(Message::UserauthSuccess, SID).unwrap();
        assert!(matches!(out[..], [AuthOutput::Authenticated]));
    }

    #[test]
    fn test_partial_success_with_nothing_left() {
        let (mut engine, _) = engine_at_methods(vec![Credential::password("pw")], &["password"]);
        let out = engine.handle(failure(&["publickey"], true), SID).unwrap();
        match &out[..] {
            [AuthOutput::Failed(err)] => assert_eq!(
                err.code(),
                ErrorCode::AuthFailure(AuthFailureKind::PartialSuccess)
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_publickey_signature_verifies() {
        let key = Arc::new(Ed25519HostKey::generate());
        let public = key.public_key();
        let (_, out) = engine_at_methods(vec![Credential::public_key(key)], &["publickey"]);
        let request = &sent(&out)[0];
        match request.method() {
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature: Some(sig),
            } => {
                let data = signature_data(SID, "alice", SERVICE_CONNECTION, algorithm, public_key);
                public.verify(algorithm, &data, sig).unwrap();
                assert_eq!(PublicKey::from_blob(public_key).unwrap(), public);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_keyboard_interactive_dialogue() {
        let responder = |req: &InfoRequest| -> Vec<String> {
            req.prompts.iter().map(|_| "123456".to_string()).collect()
        };
        let (mut engine, out) = engine_at_methods(
            vec![Credential::keyboard_interactive(responder)],
            &["keyboard-interactive"],
        );
        assert_eq!(sent(&out)[0].method().name(), "keyboard-interactive");

        let request = InfoRequest {
            name: "otp".into(),
            instruction: String::new(),
            prompts: vec![Prompt {
                prompt: "Code: ".into(),
                echo: false,
            }],
        };
        let out = engine
            .handle(Message::UserauthMethodSpecific(request.to_bytes()), SID)
            .unwrap();
        match &out[..] {
            [AuthOutput::Send(p)] => {
                assert_eq!(p[0], 61);
                let mut r = Reader::new(&p[1..]);
                assert_eq!(r.read_u32().unwrap(), 1);
                assert_eq!(r.read_string().unwrap(), "123456");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fresh_responders_each_get_an_attempt() {
        let mut engine = AuthEngine::new(1);
        engine.start("alice", AuthGoal::ListMethods, SID).unwrap();
        engine
            .handle(Message::ServiceAccept(SERVICE_USERAUTH.into()), SID)
            .unwrap();
        engine.handle(failure(&["keyboard-interactive"], false), SID).unwrap();

        // Each responder is dropped before the next one is built
        for round in 0..20 {
            let answer = format!("code-{}", round);
            let credential = Credential::keyboard_interactive(move |req: &InfoRequest| {
                req.prompts.iter().map(|_| answer.clone()).collect::<Vec<String>>()
            });
            engine
                .start("alice", AuthGoal::Login(vec![credential]), SID)
                .unwrap();
            let out = engine.handle(failure(&["keyboard-interactive"], false), SID).unwrap();
            assert_eq!(sent(&out).len(), 1, "round {}", round);
            let out = engine.handle(failure(&["keyboard-interactive"], false), SID).unwrap();
            assert!(matches!(out[..], [AuthOutput::Failed(_)]), "round {}", round);
        }
    }

    #[test]
    fn test_cloned_responder_is_same_credential() {
        let responder = |req: &InfoRequest| -> Vec<String> {
            req.prompts.iter().map(|_| "wrong".to_string()).collect()
        };
        let credential = Credential::keyboard_interactive(responder);
        let (mut engine, _) =
            engine_at_methods(vec![credential.clone()], &["keyboard-interactive"]);
        engine.handle(failure(&["keyboard-interactive"], false), SID).unwrap();

        engine
            .start("alice", AuthGoal::Login(vec![credential]), SID)
            .unwrap();
        let out = engine.handle(failure(&["keyboard-interactive"], false), SID).unwrap();
        assert!(sent(&out).is_empty());
        match &out[..] {
            [AuthOutput::Failed(err)] => assert_eq!(
                err.code(),
                ErrorCode::AuthFailure(AuthFailureKind::MethodsExhausted)
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_abort_drops_late_reply() {
        let (mut engine, out) = engine_at_methods(vec![Credential::password("slow")], &["password"]);
        assert_eq!(sent(&out).len(), 1);
        engine.abort();
        assert!(!engine.in_progress());

        let out = engine
            .start("alice", AuthGoal::Login(vec![Credential::password("pw")]), SID)
            .unwrap();
        assert_eq!(sent(&out)[0].method(), &AuthMethod::None);

        // Late answer to the abandoned password attempt
        let out = engine.handle(failure(&["password"], false), SID).unwrap();
        assert!(out.is_empty());
        assert!(engine.in_progress());

        // Answer to "none"
        let out = engine.handle(failure(&["password"], false), SID).unwrap();
        assert_eq!(sent(&out)[0].method(), &AuthMethod::password("pw"));
        let out = engine.handle(Message::UserauthSuccess, SID).unwrap();
        assert!(matches!(out[..], [AuthOutput::Authenticated]));
    }

    #[test]
    fn test_late_success_after_abort_authenticates() {
        let (mut engine, _) = engine_at_methods(vec![Credential::password("pw")], &["password"]);
        engine.abort();
        let out = engine.handle(Message::UserauthSuccess, SID).unwrap();
        assert!(matches!(out[..], [AuthOutput::Authenticated]));
        assert!(engine.is_authenticated());
        assert!(!engine.in_progress());
    }

    #[test]
    fn test_abort_before_service_accept_keeps_nothing_stale() {
        let mut engine = AuthEngine::new(1);
        engine
            .start("alice", AuthGoal::Login(vec![Credential::password("pw")]), SID)
            .unwrap();
        engine.abort();

        engine.start("alice", AuthGoal::ListMethods, SID).unwrap();
        let out = engine
            .handle(Message::ServiceAccept(SERVICE_USERAUTH.into()), SID)
            .unwrap();
        assert_eq!(sent(&out)[0].method(), &AuthMethod::None);
        let out = engine.handle(failure(&["password"], false), SID).unwrap();
        assert!(matches!(&out[..], [AuthOutput::Methods(m)] if m == &vec!["password".to_string()]));
    }

    #[test]
    fn test_password_change_request_is_bad_credential() {
        let (mut engine, _) = engine_at_methods(vec![Credential::password("old")], &["password"]);
        let mut changereq = BytesMut::new();
        changereq.put_u8(60);
        put_str(&mut changereq, "Password expired");
        put_str(&mut changereq, "");
        let out = engine
            .handle(Message::UserauthMethodSpecific(changereq.to_vec()), SID)
            .unwrap();
        match &out[..] {
            [AuthOutput::Failed(err)] => assert_eq!(
                err.code(),
                ErrorCode::AuthFailure(AuthFailureKind::BadCredential)
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_list_methods() {
        let mut engine = AuthEngine::new(1);
        engine.start("alice", AuthGoal::ListMethods, SID).unwrap();
        engine
            .handle(Message::ServiceAccept(SERVICE_USERAUTH.into()), SID)
            .unwrap();
        engine
            .handle(
                Message::UserauthBanner(UserauthBanner::new("Authorized use only")),
                SID,
            )
            .unwrap();
        let out = engine.handle(failure(&["publickey", "password"], false), SID).unwrap();
        match &out[..] {
            [AuthOutput::Methods(m)] => assert_eq!(m, &vec!["publickey".to_string(), "password".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.banner(), Some("Authorized use only"));
        assert!(!engine.is_authenticated());
    }

    #[test]
    fn test_unexpected_success_is_protocol_error() {
        let mut engine = AuthEngine::new(1);
        let err = engine.handle(Message::UserauthSuccess, SID).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }
}
