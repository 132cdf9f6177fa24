//! SSH keep-alive.
//!
//! Sends SSH_MSG_IGNORE with random contents at a fixed interval so idle
//! connections are not dropped by middleboxes. The timer is polled by the
//! session task itself; no extra task is spawned.

use std::future::pending;
use std::time::Duration;

use bytes::BytesMut;
use rand::RngCore;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::ssh::encoding::put_bytes;
use crate::ssh::message::MessageType;

/// Random bytes carried by each keep-alive.
pub const KEEPALIVE_DATA_LEN: usize = 32;

/// Keep-alive timer.
#[derive(Debug)]
pub struct Keepalive {
    interval: Option<Interval>,
}

impl Keepalive {
    /// Creates a timer firing every `period`, or a disabled one.
    pub fn new(period: Option<Duration>) -> Self {
        let interval = period.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self { interval }
    }

    /// True when a period is configured.
    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Waits for the next tick. Never resolves when disabled.
    pub async fn tick(&mut self) {
        match &mut self.interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => pending::<()>().await,
        }
    }
}

/// Creates an SSH_MSG_IGNORE message with `data_len` random bytes.
///
/// ```text
/// byte    SSH_MSG_IGNORE (2)
/// string  data
/// ```
///
/// # Example
///
/// ```rust
/// use tether_proto::ssh::session::create_keepalive_message;
///
/// let msg = create_keepalive_message(32);
/// assert_eq!(msg[0], 2);
/// ```
pub fn create_keepalive_message(data_len: usize) -> Vec<u8> {
    let mut data = vec![0u8; data_len];
    rand::thread_rng().fill_bytes(&mut data);

    let mut msg = BytesMut::with_capacity(1 + 4 + data_len);
    msg.extend_from_slice(&[MessageType::Ignore as u8]);
    put_bytes(&mut msg, &data);
    msg.to_vec()
}
