//! SSH key exchange (KEX) engine (RFC 4253 Section 7).
//!
//! # Key Exchange Flow
//!
//! ```text
//! Init -> AlgorithmNegotiation -> Exchange -> NewKeys -> Established
//!   ^                                                        |
//!   +----------------------- re-key -------------------------+
//! ```
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server supports)
//! 3. Key agreement (Curve25519 or DH group 14), host key signature check
//!    and the caller's trust decision
//! 4. Both sides send SSH_MSG_NEWKEYS; each direction switches keys when
//!    its NEWKEYS passes
//!
//! [`KexEngine`] performs no I/O. It consumes kex messages and returns
//! [`KexOutput`] actions for the session driver to carry out in order.
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::kex::{negotiate_algorithm, KexInit, AlgorithmPreferences};
//!
//! let kexinit = KexInit::from_preferences(&AlgorithmPreferences::default());
//! assert_eq!(kexinit.to_bytes()[0], 20);
//!
//! let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
//! let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
//! assert_eq!(negotiate_algorithm("cipher", &client, &server).unwrap(), "aes256-ctr");
//! ```

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use tether_platform::{TetherError, TetherResult};

use super::crypto::{CipherAlgorithm, DirectionKeys, MacAlgorithm};
use super::encoding::{put_bool, put_name_list, Reader};
use super::hostkey::{HostKey, HostKeyAlgorithm, HostKeyInfo, PublicKey};
use super::kex_dh::{
    derive_key, exchange_hash, ExchangeHashInput, KexDhInit, KexDhReply, KexMethod, KeyAgreement,
};
use super::logging;
use super::message::{Message, MessageType};

/// Algorithm lists offered in KEXINIT, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Server host key algorithms
    pub host_key: Vec<String>,
    /// Ciphers (both directions)
    pub cipher: Vec<String>,
    /// MACs (both directions, used with non-AEAD ciphers)
    pub mac: Vec<String>,
    /// Compression (both directions)
    pub compression: Vec<String>,
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        let list = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            kex: list(&[
                "curve25519-sha256",
                "curve25519-sha256@libssh.org",
                "diffie-hellman-group14-sha256",
            ]),
            host_key: list(&["ssh-ed25519", "rsa-sha2-512", "rsa-sha2-256"]),
            cipher: list(&[
                "chacha20-poly1305@openssh.com",
                "aes256-gcm@openssh.com",
                "aes128-gcm@openssh.com",
                "aes256-ctr",
                "aes128-ctr",
            ]),
            mac: list(&["hmac-sha2-256", "hmac-sha2-512"]),
            compression: list(&["none"]),
        }
    }
}

impl AlgorithmPreferences {
    /// Checks that every list is non-empty and names only supported
    /// algorithms.
    pub fn validate(&self) -> TetherResult<()> {
        fn check(category: &str, names: &[String], known: impl Fn(&str) -> bool) -> TetherResult<()> {
            if names.is_empty() {
                return Err(TetherError::config(format!("{} algorithm list is empty", category)));
            }
            if let Some(unknown) = names.iter().find(|n| !known(n)) {
                return Err(TetherError::config(format!(
                    "unsupported {} algorithm '{}'",
                    category, unknown
                )));
            }
            Ok(())
        }

        check("kex", &self.kex, |n| KexMethod::from_name(n).is_some())?;
        check("host key", &self.host_key, |n| {
            HostKeyAlgorithm::from_name(n).is_some()
        })?;
        check("cipher", &self.cipher, |n| {
            matches!(CipherAlgorithm::from_name(n), Some(c) if c != CipherAlgorithm::None)
        })?;
        check("mac", &self.mac, |n| MacAlgorithm::from_name(n).is_some())?;
        check("compression", &self.compression, |n| n == "none")?;
        Ok(())
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT with a fresh random cookie.
    pub fn from_preferences(prefs: &AlgorithmPreferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: prefs.kex.clone(),
            server_host_key_algorithms: prefs.host_key.clone(),
            encryption_algorithms_client_to_server: prefs.cipher.clone(),
            encryption_algorithms_server_to_client: prefs.cipher.clone(),
            mac_algorithms_client_to_server: prefs.mac.clone(),
            mac_algorithms_server_to_client: prefs.mac.clone(),
            compression_algorithms_client_to_server: prefs.compression.clone(),
            compression_algorithms_server_to_client: prefs.compression.clone(),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the client-to-server ciphers.
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the server-to-client ciphers.
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns whether a guessed kex packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Sets the guessed-packet flag.
    pub fn set_first_kex_packet_follows(&mut self, follows: bool) {
        self.first_kex_packet_follows = follows;
    }

    /// Serializes the KEXINIT message.
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie
    /// name-list    x 10
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);
        put_name_list(&mut buf, &self.kex_algorithms);
        put_name_list(&mut buf, &self.server_host_key_algorithms);
        put_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        put_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        put_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        put_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        put_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        put_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        put_name_list(&mut buf, &self.languages_client_to_server);
        put_name_list(&mut buf, &self.languages_server_to_client);
        put_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);
        buf.to_vec()
    }

    /// Parses a KEXINIT message.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut reader = Reader::new(data);
        reader.expect_message(MessageType::KexInit as u8, "SSH_MSG_KEXINIT")?;

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(reader.read_raw(16)?);

        let kex = Self {
            cookie,
            kex_algorithms: reader.read_name_list()?,
            server_host_key_algorithms: reader.read_name_list()?,
            encryption_algorithms_client_to_server: reader.read_name_list()?,
            encryption_algorithms_server_to_client: reader.read_name_list()?,
            mac_algorithms_client_to_server: reader.read_name_list()?,
            mac_algorithms_server_to_client: reader.read_name_list()?,
            compression_algorithms_client_to_server: reader.read_name_list()?,
            compression_algorithms_server_to_client: reader.read_name_list()?,
            languages_client_to_server: reader.read_name_list()?,
            languages_server_to_client: reader.read_name_list()?,
            first_kex_packet_follows: reader.read_bool()?,
        };
        // Reserved
        reader.read_u32()?;
        Ok(kex)
    }
}

/// Picks the first client preference the server also supports.
///
/// # Errors
///
/// Returns `NoCommonAlgorithm` naming the category if the lists are
/// disjoint.
pub fn negotiate_algorithm(
    category: &str,
    client_list: &[String],
    server_list: &[String],
) -> TetherResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| {
            TetherError::no_common_algorithm(format!(
                "no common {} algorithm: client={:?}, server={:?}",
                category, client_list, server_list
            ))
        })
}

/// The negotiated algorithm set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Algorithms {
    /// Key exchange method
    pub kex: KexMethod,
    /// Host key algorithm
    pub host_key: HostKeyAlgorithm,
    /// Client-to-server cipher
    pub cipher_c2s: CipherAlgorithm,
    /// Server-to-client cipher
    pub cipher_s2c: CipherAlgorithm,
    /// Client-to-server MAC (`None` with AEAD ciphers)
    pub mac_c2s: Option<MacAlgorithm>,
    /// Server-to-client MAC (`None` with AEAD ciphers)
    pub mac_s2c: Option<MacAlgorithm>,
    /// Client-to-server compression
    pub compression_c2s: String,
    /// Server-to-client compression
    pub compression_s2c: String,
}

fn unsupported(category: &str, name: &str) -> TetherError {
    TetherError::no_common_algorithm(format!("negotiated unsupported {} '{}'", category, name))
}

fn negotiate_mac(
    cipher: CipherAlgorithm,
    client: &[String],
    server: &[String],
) -> TetherResult<Option<MacAlgorithm>> {
    // AEAD ciphers carry their own tag; the MAC lists are not negotiated.
    if cipher.is_aead() {
        return Ok(None);
    }
    let name = negotiate_algorithm("mac", client, server)?;
    MacAlgorithm::from_name(&name)
        .map(Some)
        .ok_or_else(|| unsupported("mac", &name))
}

/// Negotiates every category. `client` is the client's KEXINIT whichever
/// side we are.
pub fn negotiate(client: &KexInit, server: &KexInit) -> TetherResult<Algorithms> {
    let kex_name = negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?;
    let kex = KexMethod::from_name(&kex_name).ok_or_else(|| unsupported("kex", &kex_name))?;

    let host_key_name = negotiate_algorithm(
        "host key",
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
    )?;
    let host_key = HostKeyAlgorithm::from_name(&host_key_name)
        .ok_or_else(|| unsupported("host key", &host_key_name))?;

    let cipher = |c: &[String], s: &[String]| -> TetherResult<CipherAlgorithm> {
        let name = negotiate_algorithm("cipher", c, s)?;
        match CipherAlgorithm::from_name(&name) {
            Some(CipherAlgorithm::None) | None => Err(unsupported("cipher", &name)),
            Some(cipher) => Ok(cipher),
        }
    };
    let cipher_c2s = cipher(
        &client.encryption_algorithms_client_to_server,
        &server.encryption_algorithms_client_to_server,
    )?;
    let cipher_s2c = cipher(
        &client.encryption_algorithms_server_to_client,
        &server.encryption_algorithms_server_to_client,
    )?;

    let mac_c2s = negotiate_mac(
        cipher_c2s,
        &client.mac_algorithms_client_to_server,
        &server.mac_algorithms_client_to_server,
    )?;
    let mac_s2c = negotiate_mac(
        cipher_s2c,
        &client.mac_algorithms_server_to_client,
        &server.mac_algorithms_server_to_client,
    )?;

    let compression_c2s = negotiate_algorithm(
        "compression",
        &client.compression_algorithms_client_to_server,
        &server.compression_algorithms_client_to_server,
    )?;
    let compression_s2c = negotiate_algorithm(
        "compression",
        &client.compression_algorithms_server_to_client,
        &server.compression_algorithms_server_to_client,
    )?;
    for name in [&compression_c2s, &compression_s2c] {
        if name != "none" {
            return Err(unsupported("compression", name));
        }
    }

    Ok(Algorithms {
        kex,
        host_key,
        cipher_c2s,
        cipher_s2c,
        mac_c2s,
        mac_s2c,
        compression_c2s,
        compression_s2c,
    })
}

/// Which side of the exchange this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connection initiator
    Client,
    /// Connection responder
    Server,
}

/// Key exchange state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexState {
    /// Nothing sent yet
    Init,
    /// Our KEXINIT is out, waiting for the peer's
    AlgorithmNegotiation,
    /// Key agreement in progress
    Exchange,
    /// NEWKEYS sent, waiting for the peer's
    NewKeys,
    /// Keys active in both directions
    Established,
}

impl KexState {
    fn name(&self) -> &'static str {
        match self {
            KexState::Init => "Init",
            KexState::AlgorithmNegotiation => "AlgorithmNegotiation",
            KexState::Exchange => "Exchange",
            KexState::NewKeys => "NewKeys",
            KexState::Established => "Established",
        }
    }
}

/// Action requested by the engine, to be carried out in order.
#[derive(Debug)]
pub enum KexOutput {
    /// Send this payload
    Send(Vec<u8>),
    /// Ask the caller's trust policy, then call
    /// [`KexEngine::host_key_verdict`]. No further inbound packets may be
    /// processed until then.
    VerifyHostKey(HostKeyInfo),
    /// Switch outbound protection; takes effect after the preceding sends
    InstallOutbound(DirectionKeys),
    /// Switch inbound protection before decoding the next packet
    InstallInbound(DirectionKeys),
    /// Both directions use the new keys
    Established,
}

/// Key exchange engine for one session.
pub struct KexEngine {
    role: Role,
    session: u64,
    state: KexState,
    preferences: AlgorithmPreferences,
    host_key: Option<Arc<dyn HostKey>>,
    client_version: String,
    server_version: String,
    session_id: Option<Vec<u8>>,
    local_kexinit: Option<Vec<u8>>,
    peer_kexinit: Option<Vec<u8>>,
    /// Parsed forms of the two KEXINIT payloads above
    local_init: Option<KexInit>,
    peer_init: Option<KexInit>,
    algorithms: Option<Algorithms>,
    agreement: Option<KeyAgreement>,
    ignore_next_kex_packet: bool,
    pending_outbound: Option<DirectionKeys>,
    pending_inbound: Option<DirectionKeys>,
    awaiting_verdict: bool,
    host_key_info: Option<HostKeyInfo>,
    completed: u32,
}

impl std::fmt::Debug for KexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexEngine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("algorithms", &self.algorithms)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

impl KexEngine {
    /// Creates a client-side engine. Versions are the identification lines
    /// without CR LF.
    pub fn client(
        session: u64,
        preferences: AlgorithmPreferences,
        client_version: &str,
        server_version: &str,
    ) -> Self {
        Self::new(Role::Client, session, preferences, None, client_version, server_version)
    }

    /// Creates a server-side engine signing with `host_key`.
    pub fn server(
        session: u64,
        mut preferences: AlgorithmPreferences,
        host_key: Arc<dyn HostKey>,
        client_version: &str,
        server_version: &str,
    ) -> Self {
        preferences.host_key = vec![host_key.algorithm().name().to_string()];
        Self::new(
            Role::Server,
            session,
            preferences,
            Some(host_key),
            client_version,
            server_version,
        )
    }

    fn new(
        role: Role,
        session: u64,
        preferences: AlgorithmPreferences,
        host_key: Option<Arc<dyn HostKey>>,
        client_version: &str,
        server_version: &str,
    ) -> Self {
        Self {
            role,
            session,
            state: KexState::Init,
            preferences,
            host_key,
            client_version: client_version.to_string(),
            server_version: server_version.to_string(),
            session_id: None,
            local_kexinit: None,
            peer_kexinit: None,
            local_init: None,
            peer_init: None,
            algorithms: None,
            agreement: None,
            ignore_next_kex_packet: false,
            pending_outbound: None,
            pending_inbound: None,
            awaiting_verdict: false,
            host_key_info: None,
            completed: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> KexState {
        self.state
    }

    /// True between the first KEXINIT and both NEWKEYS.
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, KexState::Init | KexState::Established)
            || self.peer_kexinit.is_some()
    }

    /// True once at least one exchange has completed and none is running.
    pub fn is_established(&self) -> bool {
        self.state == KexState::Established && self.peer_kexinit.is_none()
    }

    /// True while the caller's host key decision is outstanding.
    pub fn awaiting_verdict(&self) -> bool {
        self.awaiting_verdict
    }

    /// Session identifier (exchange hash of the first exchange).
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Algorithms of the most recent negotiation.
    pub fn algorithms(&self) -> Option<&Algorithms> {
        self.algorithms.as_ref()
    }

    /// Host key presented in the most recent exchange.
    pub fn host_key_info(&self) -> Option<&HostKeyInfo> {
        self.host_key_info.as_ref()
    }

    /// Number of completed exchanges.
    pub fn completed_exchanges(&self) -> u32 {
        self.completed
    }

    fn set_state(&mut self, next: KexState) {
        if self.state != next {
            logging::log_kex_transition(self.session, self.state.name(), next.name());
            self.state = next;
        }
    }

    /// Sends our KEXINIT if it is not already out. Used for the initial
    /// exchange and for re-keys.
    pub fn start(&mut self) -> TetherResult<Vec<KexOutput>> {
        if self.local_kexinit.is_some() {
            return Ok(Vec::new());
        }

        let init = KexInit::from_preferences(&self.preferences);
        let kexinit = init.to_bytes();
        self.local_kexinit = Some(kexinit.clone());
        self.local_init = Some(init);
        self.set_state(KexState::AlgorithmNegotiation);

        let mut out = vec![KexOutput::Send(kexinit)];
        if self.peer_kexinit.is_some() {
            out.extend(self.negotiate()?);
        }
        Ok(out)
    }

    /// Handles a key exchange message (numbers 20-49).
    ///
    /// `payload` is the raw packet payload; KEXINIT payloads are hashed
    /// verbatim.
    pub fn handle(&mut self, msg: Message, payload: &[u8]) -> TetherResult<Vec<KexOutput>> {
        if self.ignore_next_kex_packet && !matches!(msg, Message::KexInit(_) | Message::NewKeys) {
            self.ignore_next_kex_packet = false;
            return Ok(Vec::new());
        }

        match msg {
            Message::KexInit(peer) => self.on_kexinit(peer, payload),
            Message::KexDhInit(init) => self.on_dh_init(init),
            Message::KexDhReply(reply) => self.on_dh_reply(reply),
            Message::NewKeys => self.on_newkeys(),
            _ => Err(TetherError::protocol(format!(
                "unexpected message {} during key exchange",
                payload.first().copied().unwrap_or(0)
            ))),
        }
    }

    fn on_kexinit(&mut self, peer: KexInit, payload: &[u8]) -> TetherResult<Vec<KexOutput>> {
        if self.peer_kexinit.is_some() {
            return Err(TetherError::protocol("duplicate SSH_MSG_KEXINIT"));
        }
        self.peer_kexinit = Some(payload.to_vec());
        self.peer_init = Some(peer);

        let mut out = Vec::new();
        if self.local_kexinit.is_none() {
            out.extend(self.start()?);
            return Ok(out);
        }
        out.extend(self.negotiate()?);
        Ok(out)
    }

    fn kexinits(&self) -> TetherResult<(KexInit, KexInit)> {
        let local = self
            .local_init
            .clone()
            .ok_or_else(|| TetherError::protocol("local KEXINIT missing"))?;
        let peer = self
            .peer_init
            .clone()
            .ok_or_else(|| TetherError::protocol("peer KEXINIT missing"))?;
        Ok(match self.role {
            Role::Client => (local, peer),
            Role::Server => (peer, local),
        })
    }

    fn negotiate(&mut self) -> TetherResult<Vec<KexOutput>> {
        let (client, server) = self.kexinits()?;
        let algorithms = negotiate(&client, &server)?;

        logging::log_algorithms(
            self.session,
            algorithms.kex.name(),
            algorithms.host_key.name(),
            algorithms.cipher_c2s.name(),
            algorithms.cipher_s2c.name(),
        );

        let peer = match self.role {
            Role::Client => &server,
            Role::Server => &client,
        };
        if peer.first_kex_packet_follows() {
            let guessed_kex = peer.kex_algorithms().first().map(String::as_str);
            let guessed_host_key = peer.server_host_key_algorithms().first().map(String::as_str);
            self.ignore_next_kex_packet = guessed_kex != Some(algorithms.kex.name())
                || guessed_host_key != Some(algorithms.host_key.name());
        }

        let method = algorithms.kex;
        self.algorithms = Some(algorithms);
        self.set_state(KexState::Exchange);

        match self.role {
            Role::Client => {
                let agreement = KeyAgreement::new(method)?;
                let init = KexDhInit {
                    public: agreement.public_field(),
                };
                self.agreement = Some(agreement);
                Ok(vec![KexOutput::Send(init.to_bytes())])
            }
            Role::Server => Ok(Vec::new()),
        }
    }

    fn on_dh_reply(&mut self, reply: KexDhReply) -> TetherResult<Vec<KexOutput>> {
        if self.role != Role::Client || self.state != KexState::Exchange || self.awaiting_verdict {
            return Err(TetherError::protocol("unexpected SSH_MSG_KEXDH_REPLY"));
        }
        let agreement = self
            .agreement
            .take()
            .ok_or_else(|| TetherError::protocol("unexpected SSH_MSG_KEXDH_REPLY"))?;
        let host_key_alg = self
            .algorithms
            .as_ref()
            .map(|a| a.host_key)
            .ok_or_else(|| TetherError::protocol("algorithms not negotiated"))?;

        let client_public = agreement.public_field();
        let shared_secret = agreement.agree(&reply.public)?;
        let public_key = PublicKey::from_blob(&reply.host_key)?;

        let hash = {
            let local = self.local_kexinit.as_deref().unwrap_or_default();
            let peer = self.peer_kexinit.as_deref().unwrap_or_default();
            exchange_hash(&ExchangeHashInput {
                client_version: &self.client_version,
                server_version: &self.server_version,
                client_kexinit: local,
                server_kexinit: peer,
                host_key: &reply.host_key,
                client_public: &client_public,
                server_public: &reply.public,
                shared_secret: &shared_secret,
            })
        };

        public_key.verify(host_key_alg.name(), &hash, &reply.signature)?;

        self.derive_keys(&shared_secret, &hash)?;
        let info = HostKeyInfo::new(host_key_alg.name(), &reply.host_key);
        self.host_key_info = Some(info.clone());
        self.awaiting_verdict = true;
        Ok(vec![KexOutput::VerifyHostKey(info)])
    }

    /// Applies the caller's trust decision for the presented host key.
    ///
    /// # Errors
    ///
    /// Returns `HostKeyRejected` when `accepted` is false.
    pub fn host_key_verdict(&mut self, accepted: bool) -> TetherResult<Vec<KexOutput>> {
        if !self.awaiting_verdict {
            return Err(TetherError::protocol("no host key decision pending"));
        }
        self.awaiting_verdict = false;

        if let Some(info) = &self.host_key_info {
            logging::log_host_key(self.session, &info.algorithm, &info.fingerprint, accepted);
        }
        if !accepted {
            return Err(TetherError::host_key_rejected(
                "server host key rejected by trust policy",
            ));
        }
        self.send_newkeys()
    }

    fn on_dh_init(&mut self, init: KexDhInit) -> TetherResult<Vec<KexOutput>> {
        if self.role != Role::Server || self.state != KexState::Exchange {
            return Err(TetherError::protocol("unexpected SSH_MSG_KEXDH_INIT"));
        }
        let method = self
            .algorithms
            .as_ref()
            .map(|a| a.kex)
            .ok_or_else(|| TetherError::protocol("algorithms not negotiated"))?;
        let host_key = self
            .host_key
            .clone()
            .ok_or_else(|| TetherError::config("server role requires a host key"))?;

        let agreement = KeyAgreement::new(method)?;
        let server_public = agreement.public_field();
        let shared_secret = agreement.agree(&init.public)?;
        let host_key_blob = host_key.public_key_bytes();

        let hash = {
            let local = self.local_kexinit.as_deref().unwrap_or_default();
            let peer = self.peer_kexinit.as_deref().unwrap_or_default();
            exchange_hash(&ExchangeHashInput {
                client_version: &self.client_version,
                server_version: &self.server_version,
                client_kexinit: peer,
                server_kexinit: local,
                host_key: &host_key_blob,
                client_public: &init.public,
                server_public: &server_public,
                shared_secret: &shared_secret,
            })
        };
        let signature = host_key.sign(&hash)?;
        self.derive_keys(&shared_secret, &hash)?;

        let reply = KexDhReply {
            host_key: host_key_blob,
            public: server_public,
            signature,
        };
        let mut out = vec![KexOutput::Send(reply.to_bytes())];
        out.extend(self.send_newkeys()?);
        Ok(out)
    }

    fn send_newkeys(&mut self) -> TetherResult<Vec<KexOutput>> {
        let keys = self
            .pending_outbound
            .take()
            .ok_or_else(|| TetherError::protocol("outbound keys not derived"))?;
        self.set_state(KexState::NewKeys);
        Ok(vec![
            KexOutput::Send(vec![MessageType::NewKeys as u8]),
            KexOutput::InstallOutbound(keys),
        ])
    }

    fn on_newkeys(&mut self) -> TetherResult<Vec<KexOutput>> {
        if self.state != KexState::NewKeys {
            return Err(TetherError::protocol("unexpected SSH_MSG_NEWKEYS"));
        }
        let keys = self
            .pending_inbound
            .take()
            .ok_or_else(|| TetherError::protocol("inbound keys not derived"))?;

        self.local_kexinit = None;
        self.peer_kexinit = None;
        self.local_init = None;
        self.peer_init = None;
        self.ignore_next_kex_packet = false;
        self.completed += 1;
        self.set_state(KexState::Established);

        Ok(vec![KexOutput::InstallInbound(keys), KexOutput::Established])
    }

    fn derive_keys(&mut self, shared_secret: &[u8], hash: &[u8]) -> TetherResult<()> {
        let algorithms = self
            .algorithms
            .clone()
            .ok_or_else(|| TetherError::protocol("algorithms not negotiated"))?;
        let session_id = self.session_id.get_or_insert_with(|| hash.to_vec()).clone();

        let direction = |cipher: CipherAlgorithm, mac: Option<MacAlgorithm>, letters: [u8; 3]| {
            DirectionKeys {
                cipher,
                mac,
                iv: derive_key(shared_secret, hash, &session_id, letters[0], cipher.iv_size()),
                key: derive_key(shared_secret, hash, &session_id, letters[1], cipher.key_size()),
                mac_key: derive_key(
                    shared_secret,
                    hash,
                    &session_id,
                    letters[2],
                    mac.map_or(0, |m| m.key_size()),
                ),
            }
        };

        let c2s = direction(algorithms.cipher_c2s, algorithms.mac_c2s, *b"ACE");
        let s2c = direction(algorithms.cipher_s2c, algorithms.mac_s2c, *b"BDF");
        let (outbound, inbound) = match self.role {
            Role::Client => (c2s, s2c),
            Role::Server => (s2c, c2s),
        };
        self.pending_outbound = Some(outbound);
        self.pending_inbound = Some(inbound);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::Ed25519HostKey;
    use crate::ssh::transport::{Decoded, TransportCodec};
    use tether_platform::ErrorCode;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_kexinit_round_trip() {
        let original = KexInit::from_preferences(&AlgorithmPreferences::default());
        let parsed = KexInit::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(parsed, original);
        assert!(!parsed.first_kex_packet_follows());
    }

    #[test]
    fn test_kexinit_truncated() {
        let bytes = KexInit::from_preferences(&AlgorithmPreferences::default()).to_bytes();
        let err = KexInit::from_bytes(&bytes[..bytes.len() - 2]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_negotiate_client_preference_wins() {
        let client = names(&["aes256-ctr", "aes128-ctr"]);
        let server = names(&["aes128-ctr", "aes256-ctr"]);
        assert_eq!(
            negotiate_algorithm("cipher", &client, &server).unwrap(),
            "aes256-ctr"
        );
    }

    #[test]
    fn test_negotiate_no_match() {
        let err = negotiate_algorithm("kex", &names(&["a"]), &names(&["b"])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoCommonAlgorithm);
        assert!(err.message().contains("no common kex"));
    }

    #[test]
    fn test_negotiate_aead_skips_mac() {
        let client = KexInit::from_preferences(&AlgorithmPreferences::default());
        let mut server_prefs = AlgorithmPreferences::default();
        server_prefs.mac = names(&["hmac-sha2-512"]);
        server_prefs.cipher = names(&["aes128-gcm@openssh.com"]);
        let server = KexInit::from_preferences(&server_prefs);

        let algorithms = negotiate(&client, &server).unwrap();
        assert_eq!(algorithms.cipher_c2s, CipherAlgorithm::Aes128Gcm);
        assert_eq!(algorithms.mac_c2s, None);
    }

    #[test]
    fn test_negotiate_ctr_uses_mac() {
        let mut prefs = AlgorithmPreferences::default();
        prefs.cipher = names(&["aes256-ctr"]);
        prefs.mac = names(&["hmac-sha2-512"]);
        let algorithms = negotiate(
            &KexInit::from_preferences(&AlgorithmPreferences::default()),
            &KexInit::from_preferences(&prefs),
        )
        .unwrap();
        assert_eq!(algorithms.mac_s2c, Some(MacAlgorithm::HmacSha512));
    }

    #[test]
    fn test_negotiate_compression_mismatch() {
        let mut prefs = AlgorithmPreferences::default();
        prefs.compression = names(&["zlib@openssh.com"]);
        let err = negotiate(
            &KexInit::from_preferences(&AlgorithmPreferences::default()),
            &KexInit::from_preferences(&prefs),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoCommonAlgorithm);
    }

    #[test]
    fn test_preferences_validate() {
        assert!(AlgorithmPreferences::default().validate().is_ok());

        let mut prefs = AlgorithmPreferences::default();
        prefs.cipher.push("3des-cbc".to_string());
        assert_eq!(prefs.validate().unwrap_err().code(), ErrorCode::Config);

        let mut prefs = AlgorithmPreferences::default();
        prefs.kex.clear();
        assert_eq!(prefs.validate().unwrap_err().code(), ErrorCode::Config);
    }

    /// Runs both engines against each other through real codecs.
    fn run_exchange(
        client_prefs: AlgorithmPreferences,
        server_prefs: AlgorithmPreferences,
        accept: bool,
    ) -> TetherResult<(KexEngine, KexEngine, TransportCodec, TransportCodec)> {
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate());
        let mut client = KexEngine::client(1, client_prefs, "SSH-2.0-c", "SSH-2.0-s");
        let mut server = KexEngine::server(2, server_prefs, host_key, "SSH-2.0-c", "SSH-2.0-s");
        let mut c_codec = TransportCodec::new();
        let mut s_codec = TransportCodec::new();

        let mut to_server: Vec<KexOutput> = client.start()?;
        let mut to_client: Vec<KexOutput> = server.start()?;

        for _ in 0..10 {
            let mut next_to_client = Vec::new();
            for action in to_server.drain(..) {
                match action {
                    KexOutput::Send(p) => s_codec.feed(&c_codec.encode(&p)?),
                    KexOutput::InstallOutbound(k) => c_codec.install_outbound(&k)?,
                    KexOutput::InstallInbound(k) => c_codec.install_inbound(&k)?,
                    KexOutput::VerifyHostKey(_) => {
                        for a in client.host_key_verdict(accept)? {
                            match a {
                                KexOutput::Send(p) => s_codec.feed(&c_codec.encode(&p)?),
                                KexOutput::InstallOutbound(k) => c_codec.install_outbound(&k)?,
                                _ => {}
                            }
                        }
                    }
                    KexOutput::Established => {}
                }
            }
            while let Decoded::Packet(p) = s_codec.decode()? {
                for action in server.handle(Message::decode(&p)?, &p)? {
                    match action {
                        KexOutput::InstallInbound(k) => s_codec.install_inbound(&k)?,
                        other => next_to_client.push(other),
                    }
                }
            }
            for action in next_to_client.into_iter().chain(to_client.drain(..)) {
                match action {
                    KexOutput::Send(p) => c_codec.feed(&s_codec.encode(&p)?),
                    KexOutput::InstallOutbound(k) => s_codec.install_outbound(&k)?,
                    _ => {}
                }
            }
            while !client.awaiting_verdict() {
                match c_codec.decode()? {
                    Decoded::Packet(p) => {
                        for action in client.handle(Message::decode(&p)?, &p)? {
                            match action {
                                KexOutput::InstallInbound(k) => c_codec.install_inbound(&k)?,
                                other => to_server.push(other),
                            }
                        }
                    }
                    Decoded::Incomplete => break,
                }
            }
            if client.is_established() && server.is_established() {
                break;
            }
        }
        Ok((client, server, c_codec, s_codec))
    }

    #[test]
    fn test_full_exchange_every_kex_method() {
        for kex in [
            "curve25519-sha256",
            "curve25519-sha256@libssh.org",
            "diffie-hellman-group14-sha256",
        ] {
            let mut prefs = AlgorithmPreferences::default();
            prefs.kex = names(&[kex]);
            let (client, server, mut c, mut s) =
                run_exchange(AlgorithmPreferences::default(), prefs, true).unwrap();

            assert!(client.is_established(), "kex {}", kex);
            assert!(server.is_established(), "kex {}", kex);
            assert_eq!(client.session_id(), server.session_id());
            assert_eq!(client.algorithms().unwrap().kex.name(), kex);

            // Keys agree in both directions
            s.feed(&c.encode(b"\x02c2s").unwrap());
            assert_eq!(s.decode().unwrap(), Decoded::Packet(b"\x02c2s".to_vec()));
            c.feed(&s.encode(b"\x02s2c").unwrap());
            assert_eq!(c.decode().unwrap(), Decoded::Packet(b"\x02s2c".to_vec()));
        }
    }

    #[test]
    fn test_exchange_with_ctr_and_mac() {
        let mut prefs = AlgorithmPreferences::default();
        prefs.cipher = names(&["aes128-ctr"]);
        let (client, _, mut c, mut s) =
            run_exchange(AlgorithmPreferences::default(), prefs, true).unwrap();
        assert_eq!(
            client.algorithms().unwrap().mac_c2s,
            Some(MacAlgorithm::HmacSha256)
        );
        s.feed(&c.encode(b"\x5ehello").unwrap());
        assert_eq!(s.decode().unwrap(), Decoded::Packet(b"\x5ehello".to_vec()));
    }

    #[test]
    fn test_host_key_rejected() {
        let err = run_exchange(
            AlgorithmPreferences::default(),
            AlgorithmPreferences::default(),
            false,
        )
        .err()
        .unwrap();
        assert_eq!(err.code(), ErrorCode::HostKeyRejected);
    }

    #[test]
    fn test_no_common_algorithm() {
        let mut prefs = AlgorithmPreferences::default();
        prefs.cipher = names(&["aes128-ctr"]);
        let mut client_prefs = AlgorithmPreferences::default();
        client_prefs.cipher = names(&["chacha20-poly1305@openssh.com"]);
        let err = run_exchange(client_prefs, prefs, true).err().unwrap();
        assert_eq!(err.code(), ErrorCode::NoCommonAlgorithm);
    }

    #[test]
    fn test_rekey_keeps_session_id() {
        let (mut client, mut server, _, _) = run_exchange(
            AlgorithmPreferences::default(),
            AlgorithmPreferences::default(),
            true,
        )
        .unwrap();
        let first = client.session_id().unwrap().to_vec();

        let out = client.start().unwrap();
        assert!(matches!(out.as_slice(), [KexOutput::Send(p)] if p[0] == 20));
        assert!(client.in_progress());

        // The server answers a peer-initiated re-key with its own KEXINIT
        let kexinit = match &out[0] {
            KexOutput::Send(p) => p.clone(),
            _ => unreachable!(),
        };
        let reply = server
            .handle(Message::decode(&kexinit).unwrap(), &kexinit)
            .unwrap();
        assert!(matches!(reply.first(), Some(KexOutput::Send(p)) if p[0] == 20));
        assert_eq!(client.session_id().unwrap(), &first[..]);
    }

    #[test]
    fn test_wrong_guess_packet_ignored() {
        let mut client = KexEngine::client(1, AlgorithmPreferences::default(), "a", "b");
        client.start().unwrap();

        let mut server_prefs = AlgorithmPreferences::default();
        server_prefs.kex = names(&["diffie-hellman-group14-sha256", "curve25519-sha256"]);
        let mut server_init = KexInit::from_preferences(&server_prefs);
        server_init.set_first_kex_packet_follows(true);
        let payload = server_init.to_bytes();
        client
            .handle(Message::decode(&payload).unwrap(), &payload)
            .unwrap();
        assert_eq!(client.algorithms().unwrap().kex, KexMethod::Curve25519Sha256);

        // The guessed packet is dropped without error
        let guess = KexDhReply {
            host_key: vec![],
            public: vec![],
            signature: vec![],
        }
        .to_bytes();
        assert!(client
            .handle(Message::decode(&guess).unwrap(), &guess)
            .unwrap()
            .is_empty());
        assert_eq!(client.state(), KexState::Exchange);
    }

    #[test]
    fn test_negotiation_uses_decoded_kexinit() {
        let mut client = KexEngine::client(1, AlgorithmPreferences::default(), "a", "b");
        client.start().unwrap();

        let mut server_prefs = AlgorithmPreferences::default();
        server_prefs.cipher = names(&["aes256-gcm@openssh.com"]);
        let server_init = KexInit::from_preferences(&server_prefs);
        let payload = server_init.to_bytes();

        // Raw bytes only feed the exchange hash; they are not parsed again
        let out = client
            .handle(Message::KexInit(server_init), &payload[..payload.len() - 2])
            .unwrap();
        assert!(matches!(out.first(), Some(KexOutput::Send(p)) if p[0] == 30));
        assert_eq!(
            client.algorithms().unwrap().cipher_c2s,
            CipherAlgorithm::Aes256Gcm
        );
    }

    #[test]
    fn test_unexpected_newkeys() {
        let mut client = KexEngine::client(1, AlgorithmPreferences::default(), "a", "b");
        client.start().unwrap();
        let err = client.handle(Message::NewKeys, &[21]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }
}
