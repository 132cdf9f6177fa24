//! Structured logging for SSH sessions
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! Key material, passwords and signatures are never logged.
//!
//! # Log Levels
//!
//! - **TRACE**: Per-packet codec events
//! - **DEBUG**: Window adjustments, ignored peer messages
//! - **INFO**: Kex, auth and channel state transitions
//! - **WARN**: Discarded data, rejected peer requests
//! - **ERROR**: Fatal session errors
//!
//! # Example
//!
//! ```no_run
//! use tether_proto::ssh::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("tether_proto::ssh=debug")
//!     .init();
//!
//! logging::log_auth_attempt(1, "alice", "password");
//! ```

use tether_platform::TetherError;
use tracing::{debug, error, info, warn};

/// Log a key exchange state transition
pub fn log_kex_transition(session: u64, from: &str, to: &str) {
    info!(session, state_from = from, state_to = to, "kex state transition");
}

/// Log the negotiated algorithm set
pub fn log_algorithms(session: u64, kex: &str, host_key: &str, cipher_c2s: &str, cipher_s2c: &str) {
    info!(
        session,
        kex,
        host_key,
        cipher_c2s,
        cipher_s2c,
        "algorithms negotiated"
    );
}

/// Log the host key verdict
pub fn log_host_key(session: u64, algorithm: &str, fingerprint: &str, accepted: bool) {
    if accepted {
        info!(session, algorithm, fingerprint, "host key accepted");
    } else {
        warn!(session, algorithm, fingerprint, "host key rejected");
    }
}

/// Log an authentication attempt
pub fn log_auth_attempt(session: u64, user: &str, method: &str) {
    info!(session, user, method, "authentication attempt");
}

/// Log an authentication outcome
pub fn log_auth_result(session: u64, method: &str, outcome: &str) {
    info!(session, method, outcome, "authentication result");
}

/// Log a channel state transition
pub fn log_channel_transition(session: u64, channel: u32, from: &str, to: &str) {
    info!(
        session,
        channel,
        state_from = from,
        state_to = to,
        "channel state transition"
    );
}

/// Log a window adjustment sent to the peer
pub fn log_window_adjust(session: u64, channel: u32, bytes_to_add: u32, window: u32) {
    debug!(session, channel, bytes_to_add, window, "window adjust sent");
}

/// Log data discarded by the multiplexer
pub fn log_discarded_data(session: u64, channel: u32, bytes: usize, reason: &str) {
    warn!(session, channel, bytes, reason, "channel data discarded");
}

/// Log a peer request the engine refused
pub fn log_refused_request(session: u64, kind: &str, name: &str) {
    warn!(session, kind, name, "peer request refused");
}

/// Log a fatal session error
pub fn log_session_error(session: u64, err: &TetherError) {
    error!(
        session,
        code = err.code().as_i32(),
        error = %err,
        "session terminated"
    );
}

/// Log a DISCONNECT received from the peer
pub fn log_peer_disconnect(session: u64, reason_code: u32, description: &str) {
    info!(session, reason_code, description, "peer disconnected");
}
