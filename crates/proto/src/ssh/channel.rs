//! SSH channel multiplexing (RFC 4254 Section 5).
//!
//! [`Multiplexer`] owns every channel of one connection. It is I/O free:
//! caller operations and inbound connection-layer messages go in, payloads
//! to send and operation completions come out as [`ChannelOutput`] values.
//! Inbound data and channel notifications reach the caller through the
//! per-channel event stream held by a [`ChannelHandle`].
//!
//! # Flow Control
//!
//! Outbound data never exceeds the peer's remaining window or its maximum
//! packet size; anything that does not fit waits in the channel's send
//! queue until a WINDOW_ADJUST arrives. The local window is topped back up
//! as soon as it falls below the low-water mark.
//!
//! # Ordering
//!
//! Data, extended data, requests, EOF and CLOSE issued on one channel leave
//! in the order they were issued. Only data waits for window space, and
//! everything queued behind it waits too.
//!
//! # States
//!
//! ```text
//! Opening -> Open -> EofSent / EofReceived -> Closing -> Closed
//! ```

use std::collections::{BTreeMap, VecDeque};

use tether_platform::{TetherError, TetherResult};
use tokio::sync::mpsc;

use super::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest, ChannelRequestType, ChannelType,
    ChannelWindowAdjust,
};
use super::encoding::Reader;
use super::logging;
use super::message::Message;

/// Identifies a caller operation across the multiplexer boundary.
pub type OpId = u64;

/// Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelState {
    /// CHANNEL_OPEN sent, waiting for confirmation
    Opening,
    /// Open in both directions
    Open,
    /// We sent EOF
    EofSent,
    /// The peer sent EOF
    EofReceived,
    /// We sent CLOSE, waiting for the peer's
    Closing,
    /// Fully closed
    Closed,
}

impl ChannelState {
    fn name(&self) -> &'static str {
        match self {
            ChannelState::Opening => "Opening",
            ChannelState::Open => "Open",
            ChannelState::EofSent => "EofSent",
            ChannelState::EofReceived => "EofReceived",
            ChannelState::Closing => "Closing",
            ChannelState::Closed => "Closed",
        }
    }
}

/// Something that happened on a channel, delivered in receipt order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Regular data
    Data(Vec<u8>),
    /// Extended data (type 1 is stderr)
    ExtendedData {
        /// Data type code
        data_type: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// The peer will send no more data
    Eof,
    /// Remote command exit status
    ExitStatus(u32),
    /// Remote command killed by a signal
    ExitSignal {
        /// Signal name without the "SIG" prefix
        signal: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        message: String,
    },
    /// The channel is closed; no further events follow
    Closed,
}

/// Caller side of one channel.
#[derive(Debug)]
pub struct ChannelHandle {
    id: u32,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelHandle {
    /// Wraps an event receiver for channel `id`.
    pub fn new(id: u32, events: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self { id, events }
    }

    /// Local channel id, used with the session's channel operations.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Waits for the next event. Returns `None` once the channel has closed
    /// and every event has been read.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Returns the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.events.try_recv().ok()
    }
}

/// A channel the server opened for a forwarded X11 connection.
#[derive(Debug)]
pub struct X11Channel {
    /// The accepted channel; its id works with every session channel call
    pub channel: ChannelHandle,
    /// Address of the X client as seen by the server
    pub originator_address: String,
    /// Port of the X client as seen by the server
    pub originator_port: u32,
}

impl X11Channel {
    /// Reads the originator fields that follow an "x11" CHANNEL_OPEN.
    pub fn parse_originator(data: &[u8]) -> TetherResult<(String, u32)> {
        let mut reader = Reader::new(data);
        let address = reader.read_string()?;
        let port = reader.read_u32()?;
        Ok((address, port))
    }
}

/// Takes X11 channels opened by the server.
///
/// Called on the session task, so it must not block. Dropping the channel
/// handle only stops event delivery; close the channel through the session.
pub trait X11Handler: Send + Sync {
    /// Receives one newly accepted channel.
    fn accept(&self, channel: X11Channel);
}

impl<F> X11Handler for F
where
    F: Fn(X11Channel) + Send + Sync,
{
    fn accept(&self, channel: X11Channel) {
        self(channel)
    }
}

/// Window and packet parameters for channels this side opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Initial local window in bytes
    pub initial_window: u32,
    /// Maximum packet size we accept
    pub max_packet: u32,
    /// Window adjust is sent once the local window drops below this
    pub low_water: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            initial_window: 2 * 1024 * 1024,
            max_packet: 32 * 1024,
            low_water: 1024 * 1024,
        }
    }
}

/// Successful result of a channel operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completed {
    /// Channel confirmed open
    Opened(u32),
    /// All bytes of a send left the multiplexer
    Sent(usize),
    /// Request accepted, EOF sent, or channel closed
    Done,
}

/// Action requested by the multiplexer.
#[derive(Debug)]
pub enum ChannelOutput {
    /// Send this payload
    Send(Vec<u8>),
    /// Complete a caller operation
    Complete(OpId, TetherResult<Completed>),
}

#[derive(Debug)]
enum Outbound {
    Data {
        op: OpId,
        data_type: Option<u32>,
        data: Vec<u8>,
        offset: usize,
    },
    Request {
        op: OpId,
        request: ChannelRequestType,
        want_reply: bool,
    },
    Eof {
        op: OpId,
    },
    Close {
        op: Option<OpId>,
    },
    Flush {
        op: OpId,
    },
}

impl Outbound {
    fn op(&self) -> Option<OpId> {
        match self {
            Outbound::Data { op, .. }
            | Outbound::Request { op, .. }
            | Outbound::Eof { op }
            | Outbound::Flush { op } => Some(*op),
            Outbound::Close { op } => *op,
        }
    }
}

#[derive(Debug)]
struct Channel {
    local_id: u32,
    remote_id: u32,
    state: ChannelState,
    local_window: u32,
    remote_window: u32,
    remote_max_packet: u32,
    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    queue: VecDeque<Outbound>,
    replies: VecDeque<OpId>,
    open_op: Option<OpId>,
    close_ops: Vec<OpId>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Channel {
    fn new(local_id: u32, state: ChannelState, local_window: u32) -> (Self, ChannelHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Channel {
            local_id,
            remote_id: 0,
            state,
            local_window,
            remote_window: 0,
            remote_max_packet: 0,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            queue: VecDeque::new(),
            replies: VecDeque::new(),
            open_op: None,
            close_ops: Vec::new(),
            events: tx,
        };
        (channel, ChannelHandle::new(local_id, rx))
    }

    fn emit(&self, event: ChannelEvent) {
        // A dropped handle only means the caller stopped listening
        let _ = self.events.send(event);
    }
}

/// All channels of one connection.
#[derive(Debug)]
pub struct Multiplexer {
    session: u64,
    config: ChannelConfig,
    channels: BTreeMap<u32, Channel>,
    next_id: u32,
}

impl Multiplexer {
    /// Creates an empty multiplexer.
    pub fn new(session: u64, config: ChannelConfig) -> Self {
        Self {
            session,
            config,
            channels: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Number of channels not yet fully closed.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when no channel exists.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Current state of a channel, `None` once it is gone.
    pub fn state(&self, id: u32) -> Option<ChannelState> {
        self.channels.get(&id).map(|c| c.state)
    }

    /// Remaining peer window for a channel.
    pub fn remote_window(&self, id: u32) -> Option<u32> {
        self.channels.get(&id).map(|c| c.remote_window)
    }

    /// Remaining local window for a channel.
    pub fn local_window(&self, id: u32) -> Option<u32> {
        self.channels.get(&id).map(|c| c.local_window)
    }

    /// Bytes queued behind the peer's window.
    pub fn queued_bytes(&self, id: u32) -> usize {
        self.channels.get(&id).map_or(0, |c| {
            c.queue
                .iter()
                .map(|o| match o {
                    Outbound::Data { data, offset, .. } => data.len() - offset,
                    _ => 0,
                })
                .sum()
        })
    }

    fn allocate_id(&mut self) -> u32 {
        while self.channels.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn set_state(session: u64, channel: &mut Channel, next: ChannelState) {
        if channel.state != next {
            logging::log_channel_transition(
                session,
                channel.local_id,
                channel.state.name(),
                next.name(),
            );
            channel.state = next;
        }
    }

    /// Opens a channel. Completes with [`Completed::Opened`] on
    /// confirmation.
    pub fn open(&mut self, op: OpId, kind: ChannelType) -> (ChannelHandle, Vec<ChannelOutput>) {
        let id = self.allocate_id();
        let (mut channel, handle) =
            Channel::new(id, ChannelState::Opening, self.config.initial_window);
        channel.open_op = Some(op);
        self.channels.insert(id, channel);
        logging::log_channel_transition(self.session, id, "None", ChannelState::Opening.name());

        let open = ChannelOpen::new(kind, id, self.config.initial_window, self.config.max_packet);
        (handle, vec![ChannelOutput::Send(open.to_bytes())])
    }

    /// Accepts a channel the peer opened and confirms it. The channel
    /// starts out open.
    pub fn accept(&mut self, open: &ChannelOpen) -> (ChannelHandle, Vec<ChannelOutput>) {
        let id = self.allocate_id();
        let (mut channel, handle) =
            Channel::new(id, ChannelState::Open, self.config.initial_window);
        channel.remote_id = open.sender_channel();
        channel.remote_window = open.initial_window_size();
        channel.remote_max_packet = open.maximum_packet_size();
        self.channels.insert(id, channel);
        logging::log_channel_transition(self.session, id, "None", ChannelState::Open.name());

        let confirm = ChannelOpenConfirmation::new(
            open.sender_channel(),
            id,
            self.config.initial_window,
            self.config.max_packet,
        );
        (handle, vec![ChannelOutput::Send(confirm.to_bytes())])
    }

    fn enqueue(&mut self, id: u32, item: Outbound) -> Vec<ChannelOutput> {
        let op = item.op();
        let refusal = match self.channels.get(&id) {
            None => Some(format!("unknown channel {}", id)),
            Some(c) if c.close_sent || c.state == ChannelState::Closed => {
                Some(format!("channel {} is closing", id))
            }
            Some(c) if c.eof_sent && matches!(item, Outbound::Data { .. } | Outbound::Eof { .. }) => {
                Some(format!("channel {} already sent EOF", id))
            }
            Some(c) if c.queue.iter().any(|o| matches!(o, Outbound::Close { .. })) => {
                Some(format!("channel {} is closing", id))
            }
            Some(_) => None,
        };
        if let Some(reason) = refusal {
            return op
                .map(|op| vec![ChannelOutput::Complete(op, Err(TetherError::channel(reason)))])
                .unwrap_or_default();
        }

        if let Some(channel) = self.channels.get_mut(&id) {
            if let Outbound::Eof { .. } = item {
                // Later data on this channel is refused from now on
                channel.eof_sent = true;
            }
            channel.queue.push_back(item);
        }
        self.pump(id)
    }

    /// Queues data (`data_type` `None`) or extended data. Completes with
    /// [`Completed::Sent`] once every byte has been handed to the transport.
    pub fn send(
        &mut self,
        op: OpId,
        id: u32,
        data_type: Option<u32>,
        data: Vec<u8>,
    ) -> Vec<ChannelOutput> {
        self.enqueue(
            id,
            Outbound::Data {
                op,
                data_type,
                data,
                offset: 0,
            },
        )
    }

    /// Queues a channel request. With `want_reply` it completes on the
    /// peer's SUCCESS or FAILURE, otherwise as soon as it is sent.
    pub fn request(
        &mut self,
        op: OpId,
        id: u32,
        request: ChannelRequestType,
        want_reply: bool,
    ) -> Vec<ChannelOutput> {
        self.enqueue(
            id,
            Outbound::Request {
                op,
                request,
                want_reply,
            },
        )
    }

    /// Queues EOF behind any pending data.
    pub fn eof(&mut self, op: OpId, id: u32) -> Vec<ChannelOutput> {
        self.enqueue(id, Outbound::Eof { op })
    }

    /// Completes once everything queued on the channel before it has been
    /// handed to the transport, window permitting.
    pub fn flush(&mut self, op: OpId, id: u32) -> Vec<ChannelOutput> {
        self.enqueue(id, Outbound::Flush { op })
    }

    /// Queues CLOSE behind any pending data. Completes when the peer's
    /// CLOSE arrives.
    pub fn close(&mut self, op: OpId, id: u32) -> Vec<ChannelOutput> {
        if let Some(channel) = self.channels.get_mut(&id) {
            if channel.close_sent
                || channel.queue.iter().any(|o| matches!(o, Outbound::Close { .. }))
            {
                channel.close_ops.push(op);
                return Vec::new();
            }
        }
        self.enqueue(id, Outbound::Close { op: Some(op) })
    }

    /// Sends as much of a channel's queue as the peer's window allows.
    fn pump(&mut self, id: u32) -> Vec<ChannelOutput> {
        let session = self.session;
        let mut out = Vec::new();
        let Some(channel) = self.channels.get_mut(&id) else {
            return out;
        };
        if channel.state == ChannelState::Opening {
            return out;
        }

        while let Some(head) = channel.queue.front_mut() {
            match head {
                Outbound::Data {
                    op,
                    data_type,
                    data,
                    offset,
                } => {
                    let remaining = data.len() - *offset;
                    let chunk = remaining
                        .min(channel.remote_window as usize)
                        .min(channel.remote_max_packet as usize);
                    if chunk == 0 && remaining > 0 {
                        // Suspended until WINDOW_ADJUST
                        break;
                    }
                    if chunk > 0 {
                        let bytes = data[*offset..*offset + chunk].to_vec();
                        let payload = match data_type {
                            None => ChannelData::new(channel.remote_id, bytes).to_bytes(),
                            Some(code) => {
                                ChannelExtendedData::new(channel.remote_id, *code, bytes).to_bytes()
                            }
                        };
                        out.push(ChannelOutput::Send(payload));
                        channel.remote_window -= chunk as u32;
                        *offset += chunk;
                    }
                    if *offset == data.len() {
                        out.push(ChannelOutput::Complete(*op, Ok(Completed::Sent(data.len()))));
                        channel.queue.pop_front();
                    }
                }
                Outbound::Request { .. } => {
                    if let Some(Outbound::Request {
                        op,
                        request,
                        want_reply,
                    }) = channel.queue.pop_front()
                    {
                        let msg = ChannelRequest::new(channel.remote_id, request, want_reply);
                        out.push(ChannelOutput::Send(msg.to_bytes()));
                        if want_reply {
                            channel.replies.push_back(op);
                        } else {
                            out.push(ChannelOutput::Complete(op, Ok(Completed::Done)));
                        }
                    }
                }
                Outbound::Eof { op } => {
                    let op = *op;
                    channel.queue.pop_front();
                    out.push(ChannelOutput::Send(ChannelEof::new(channel.remote_id).to_bytes()));
                    out.push(ChannelOutput::Complete(op, Ok(Completed::Done)));
                    if channel.eof_received {
                        channel.queue.push_back(Outbound::Close { op: None });
                    } else {
                        Self::set_state(session, channel, ChannelState::EofSent);
                    }
                }
                Outbound::Flush { op } => {
                    let op = *op;
                    channel.queue.pop_front();
                    out.push(ChannelOutput::Complete(op, Ok(Completed::Done)));
                }
                Outbound::Close { op } => {
                    let op = *op;
                    channel.queue.pop_front();
                    out.push(ChannelOutput::Send(ChannelClose::new(channel.remote_id).to_bytes()));
                    channel.close_sent = true;
                    channel.close_ops.extend(op);
                    Self::set_state(session, channel, ChannelState::Closing);
                    // Nothing may follow CLOSE
                    for item in channel.queue.drain(..) {
                        if let Some(op) = item.op() {
                            out.push(ChannelOutput::Complete(
                                op,
                                Err(TetherError::channel(format!("channel {} closed", id))),
                            ));
                        }
                    }
                }
            }
        }
        out
    }

    fn channel_mut(&mut self, id: u32, what: &str) -> TetherResult<&mut Channel> {
        self.channels.get_mut(&id).ok_or_else(|| {
            TetherError::protocol(format!("{} for unknown channel {}", what, id))
        })
    }

    /// Handles an inbound connection-layer channel message.
    ///
    /// # Errors
    ///
    /// Protocol violations (fatal to the session) for unknown channel ids,
    /// window overruns and replies nobody asked for.
    pub fn handle(&mut self, msg: Message) -> TetherResult<Vec<ChannelOutput>> {
        let session = self.session;
        match msg {
            Message::ChannelOpenConfirmation(confirm) => {
                self.on_confirmation(confirm)
            }
            Message::ChannelOpenFailure(failure) => self.on_open_failure(failure),
            Message::ChannelWindowAdjust(adjust) => {
                let id = adjust.recipient_channel();
                let channel = self.channel_mut(id, "WINDOW_ADJUST")?;
                channel.remote_window = channel.remote_window.saturating_add(adjust.bytes_to_add());
                Ok(self.pump(id))
            }
            Message::ChannelData(data) => {
                let id = data.recipient_channel();
                self.on_data(id, None, data.into_data())
            }
            Message::ChannelExtendedData(data) => {
                let id = data.recipient_channel();
                let code = data.data_type_code();
                self.on_data(id, Some(code), data.into_data())
            }
            Message::ChannelEof(eof) => {
                let id = eof.recipient_channel();
                let channel = self.channel_mut(id, "EOF")?;
                if channel.eof_received {
                    return Ok(Vec::new());
                }
                channel.eof_received = true;
                channel.emit(ChannelEvent::Eof);
                if channel.eof_sent && !channel.close_sent {
                    channel.queue.push_back(Outbound::Close { op: None });
                    return Ok(self.pump(id));
                }
                if !channel.close_sent {
                    Self::set_state(session, channel, ChannelState::EofReceived);
                }
                Ok(Vec::new())
            }
            Message::ChannelClose(close) => self.on_close(close.recipient_channel()),
            Message::ChannelRequest(request) => {
                let id = request.recipient_channel();
                let want_reply = request.want_reply();
                let channel = self.channel_mut(id, "CHANNEL_REQUEST")?;
                match request.into_request_type() {
                    ChannelRequestType::ExitStatus { exit_status } => {
                        channel.emit(ChannelEvent::ExitStatus(exit_status));
                    }
                    ChannelRequestType::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                        ..
                    } => channel.emit(ChannelEvent::ExitSignal {
                        signal: signal_name,
                        core_dumped,
                        message: error_message,
                    }),
                    other => {
                        logging::log_refused_request(session, "channel", other.name());
                        if want_reply && !channel.close_sent {
                            return Ok(vec![ChannelOutput::Send(
                                ChannelFailure::new(channel.remote_id).to_bytes(),
                            )]);
                        }
                    }
                }
                Ok(Vec::new())
            }
            Message::ChannelSuccess(reply) => self.on_reply(reply.recipient_channel(), true),
            Message::ChannelFailure(reply) => self.on_reply(reply.recipient_channel(), false),
            _ => Err(TetherError::protocol("not a channel message")),
        }
    }

    fn on_confirmation(
        &mut self,
        confirm: ChannelOpenConfirmation,
    ) -> TetherResult<Vec<ChannelOutput>> {
        let session = self.session;
        let id = confirm.recipient_channel();
        let channel = self.channel_mut(id, "OPEN_CONFIRMATION")?;
        if channel.state != ChannelState::Opening {
            return Err(TetherError::protocol(format!(
                "OPEN_CONFIRMATION for channel {} which is not opening",
                id
            )));
        }
        channel.remote_id = confirm.sender_channel();
        channel.remote_window = confirm.initial_window_size();
        channel.remote_max_packet = confirm.maximum_packet_size();
        Self::set_state(session, channel, ChannelState::Open);

        let mut out = Vec::new();
        if let Some(op) = channel.open_op.take() {
            out.push(ChannelOutput::Complete(op, Ok(Completed::Opened(id))));
        }
        out.extend(self.pump(id));
        Ok(out)
    }

    fn on_open_failure(&mut self, failure: ChannelOpenFailure) -> TetherResult<Vec<ChannelOutput>> {
        let id = failure.recipient_channel();
        let channel = self.channel_mut(id, "OPEN_FAILURE")?;
        if channel.state != ChannelState::Opening {
            return Err(TetherError::protocol(format!(
                "OPEN_FAILURE for channel {} which is not opening",
                id
            )));
        }
        let err = TetherError::channel(format!(
            "open refused: {} ({})",
            failure.reason_code().as_str(),
            failure.description()
        ));
        let mut out = Vec::new();
        if let Some(channel) = self.channels.remove(&id) {
            logging::log_channel_transition(self.session, id, channel.state.name(), "Closed");
            if let Some(op) = channel.open_op {
                out.push(ChannelOutput::Complete(op, Err(err.clone())));
            }
            for op in channel.queue.iter().filter_map(Outbound::op) {
                out.push(ChannelOutput::Complete(op, Err(err.clone())));
            }
            channel.emit(ChannelEvent::Closed);
        }
        Ok(out)
    }

    fn on_data(
        &mut self,
        id: u32,
        data_type: Option<u32>,
        data: Vec<u8>,
    ) -> TetherResult<Vec<ChannelOutput>> {
        let session = self.session;
        let config = self.config;
        let channel = self.channel_mut(id, "CHANNEL_DATA")?;

        if channel.close_sent {
            logging::log_discarded_data(session, id, data.len(), "after local close");
            return Ok(Vec::new());
        }
        if channel.state == ChannelState::Opening {
            return Err(TetherError::protocol(format!(
                "data for channel {} before confirmation",
                id
            )));
        }
        if channel.eof_received {
            logging::log_discarded_data(session, id, data.len(), "after peer EOF");
            return Ok(Vec::new());
        }
        if data.len() > channel.local_window as usize {
            return Err(TetherError::protocol(format!(
                "channel {} peer sent {} bytes with {} window left",
                id,
                data.len(),
                channel.local_window
            )));
        }
        if data.len() > config.max_packet as usize {
            return Err(TetherError::protocol(format!(
                "channel {} packet of {} bytes exceeds maximum {}",
                id,
                data.len(),
                config.max_packet
            )));
        }

        channel.local_window -= data.len() as u32;
        match data_type {
            None => channel.emit(ChannelEvent::Data(data)),
            Some(code) => channel.emit(ChannelEvent::ExtendedData {
                data_type: code,
                data,
            }),
        }

        let mut out = Vec::new();
        if channel.local_window < config.low_water {
            let add = config.initial_window - channel.local_window;
            channel.local_window = config.initial_window;
            logging::log_window_adjust(session, id, add, channel.local_window);
            out.push(ChannelOutput::Send(
                ChannelWindowAdjust::new(channel.remote_id, add).to_bytes(),
            ));
        }
        Ok(out)
    }

    fn on_close(&mut self, id: u32) -> TetherResult<Vec<ChannelOutput>> {
        let channel = self
            .channels
            .remove(&id)
            .ok_or_else(|| TetherError::protocol(format!("CLOSE for unknown channel {}", id)))?;
        logging::log_channel_transition(self.session, id, channel.state.name(), "Closed");

        let closed = || TetherError::channel(format!("channel {} closed by peer", id));
        let mut out = Vec::new();
        if channel.state == ChannelState::Opening {
            // Without a confirmation there is no remote id to answer
            if let Some(op) = channel.open_op {
                out.push(ChannelOutput::Complete(op, Err(closed())));
            }
        } else if !channel.close_sent {
            out.push(ChannelOutput::Send(ChannelClose::new(channel.remote_id).to_bytes()));
        }
        for op in channel.queue.iter().filter_map(Outbound::op) {
            out.push(ChannelOutput::Complete(op, Err(closed())));
        }
        for op in channel.replies.iter().copied() {
            out.push(ChannelOutput::Complete(op, Err(closed())));
        }
        for op in channel.close_ops.iter().copied() {
            out.push(ChannelOutput::Complete(op, Ok(Completed::Done)));
        }
        channel.emit(ChannelEvent::Closed);
        Ok(out)
    }

    fn on_reply(&mut self, id: u32, success: bool) -> TetherResult<Vec<ChannelOutput>> {
        let channel = self.channel_mut(id, "request reply")?;
        let op = channel.replies.pop_front().ok_or_else(|| {
            TetherError::protocol(format!("unsolicited request reply on channel {}", id))
        })?;
        let result = if success {
            Ok(Completed::Done)
        } else {
            Err(TetherError::channel(format!(
                "request refused on channel {}",
                id
            )))
        };
        Ok(vec![ChannelOutput::Complete(op, result)])
    }

    /// Tears every channel down after a fatal session error. Every pending
    /// operation fails with `err`; every handle receives
    /// [`ChannelEvent::Closed`].
    pub fn fail_all(&mut self, err: &TetherError) -> Vec<ChannelOutput> {
        let mut out = Vec::new();
        for (_, channel) in std::mem::take(&mut self.channels) {
            let ops = channel
                .open_op
                .into_iter()
                .chain(channel.queue.iter().filter_map(Outbound::op))
                .chain(channel.replies.iter().copied())
                .chain(channel.close_ops.iter().copied());
            for op in ops {
                out.push(ChannelOutput::Complete(op, Err(err.clone())));
            }
            channel.emit(ChannelEvent::Closed);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::{ChannelOpenFailureReason, ChannelSuccess, EXTENDED_DATA_STDERR};
    use tether_platform::ErrorCode;

    const REMOTE: u32 = 77;

    fn config() -> ChannelConfig {
        ChannelConfig {
            initial_window: 1000,
            max_packet: 400,
            low_water: 500,
        }
    }

    fn sends(out: &[ChannelOutput]) -> Vec<Message> {
        out.iter()
            .filter_map(|o| match o {
                ChannelOutput::Send(p) => Message::decode(p).ok(),
                _ => None,
            })
            .collect()
    }

    fn completions(out: &[ChannelOutput]) -> Vec<(OpId, Result<Completed, ErrorCode>)> {
        out.iter()
            .filter_map(|o| match o {
                ChannelOutput::Complete(op, r) => {
                    Some((*op, r.clone().map_err(|e| e.code())))
                }
                _ => None,
            })
            .collect()
    }

    /// Opens channel 0 with the given peer window and packet size.
    fn open(window: u32, max_packet: u32) -> (Multiplexer, ChannelHandle) {
        let mut mux = Multiplexer::new(1, config());
        let (handle, out) = mux.open(1, ChannelType::Session);
        assert!(matches!(sends(&out)[..], [Message::ChannelOpen(_)]));
        let out = mux
            .handle(Message::ChannelOpenConfirmation(ChannelOpenConfirmation::new(
                handle.id(),
                REMOTE,
                window,
                max_packet,
            )))
            .unwrap();
        assert_eq!(completions(&out), vec![(1, Ok(Completed::Opened(0)))]);
        assert_eq!(mux.state(0), Some(ChannelState::Open));
        (mux, handle)
    }

    #[test]
    fn test_send_respects_window_and_packet_size() {
        let (mut mux, _h) = open(250, 100);
        let out = mux.send(2, 0, None, vec![7; 300]);

        let sizes: Vec<usize> = sends(&out)
            .iter()
            .map(|m| match m {
                Message::ChannelData(d) => d.data().len(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert!(completions(&out).is_empty());
        assert_eq!(mux.remote_window(0), Some(0));
        assert_eq!(mux.queued_bytes(0), 50);

        let out = mux
            .handle(Message::ChannelWindowAdjust(ChannelWindowAdjust::new(0, 1000)))
            .unwrap();
        assert_eq!(sends(&out).len(), 1);
        assert_eq!(completions(&out), vec![(2, Ok(Completed::Sent(300)))]);
    }

    #[test]
    fn test_order_preserved_behind_window() {
        let (mut mux, _h) = open(10, 100);
        let mut out = mux.send(2, 0, None, vec![1; 20]);
        out.extend(mux.request(3, 0, ChannelRequestType::Shell, false));
        out.extend(mux.eof(4, 0));
        // Only the first 10 bytes leave; the request and EOF wait
        assert_eq!(sends(&out).len(), 1);

        let out = mux
            .handle(Message::ChannelWindowAdjust(ChannelWindowAdjust::new(0, 100)))
            .unwrap();
        let kinds: Vec<&str> = sends(&out)
            .iter()
            .map(|m| match m {
                Message::ChannelData(_) => "data",
                Message::ChannelRequest(_) => "request",
                Message::ChannelEof(_) => "eof",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["data", "request", "eof"]);
        assert_eq!(mux.state(0), Some(ChannelState::EofSent));
    }

    #[test]
    fn test_queue_waits_for_confirmation() {
        let mut mux = Multiplexer::new(1, config());
        let (_h, _) = mux.open(1, ChannelType::Session);
        let out = mux.send(2, 0, None, b"early".to_vec());
        assert!(out.is_empty());

        let out = mux
            .handle(Message::ChannelOpenConfirmation(ChannelOpenConfirmation::new(
                0, REMOTE, 1000, 1000,
            )))
            .unwrap();
        assert_eq!(
            completions(&out),
            vec![(1, Ok(Completed::Opened(0))), (2, Ok(Completed::Sent(5)))]
        );
    }

    #[test]
    fn test_window_adjust_before_exhaustion() {
        let (mut mux, mut handle) = open(1000, 1000);
        let out = mux
            .handle(Message::ChannelData(ChannelData::new(0, vec![0; 400])))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(mux.local_window(0), Some(600));

        let out = mux
            .handle(Message::ChannelData(ChannelData::new(0, vec![0; 200])))
            .unwrap();
        match &sends(&out)[..] {
            [Message::ChannelWindowAdjust(adj)] => {
                assert_eq!(adj.recipient_channel(), REMOTE);
                assert_eq!(adj.bytes_to_add(), 600);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(mux.local_window(0), Some(1000));
        assert_eq!(handle.try_recv(), Some(ChannelEvent::Data(vec![0; 400])));
    }

    #[test]
    fn test_window_overrun_is_protocol_violation() {
        let (mut mux, _h) = open(1000, 1000);
        mux.handle(Message::ChannelData(ChannelData::new(0, vec![0; 400])))
            .unwrap();
        mux.handle(Message::ChannelData(ChannelData::new(0, vec![0; 400])))
            .unwrap();
        // Window was topped back up to 1000
        let err = mux
            .handle(Message::ChannelData(ChannelData::new(0, vec![0; 1001])))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_unknown_channel_is_fatal() {
        let mut mux = Multiplexer::new(1, config());
        let err = mux
            .handle(Message::ChannelData(ChannelData::new(9, b"x".to_vec())))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_data_after_local_close_discarded() {
        let (mut mux, mut handle) = open(1000, 1000);
        let out = mux.close(5, 0);
        assert!(matches!(sends(&out)[..], [Message::ChannelClose(_)]));
        assert_eq!(mux.state(0), Some(ChannelState::Closing));

        let out = mux
            .handle(Message::ChannelData(ChannelData::new(0, b"late".to_vec())))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(handle.try_recv(), None);

        let out = mux
            .handle(Message::ChannelClose(ChannelClose::new(0)))
            .unwrap();
        // No second CLOSE is sent
        assert!(sends(&out).is_empty());
        assert_eq!(completions(&out), vec![(5, Ok(Completed::Done))]);
        assert_eq!(handle.try_recv(), Some(ChannelEvent::Closed));
        assert_eq!(mux.state(0), None);
    }

    #[test]
    fn test_peer_close_is_answered() {
        let (mut mux, _h) = open(1000, 1000);
        let out = mux
            .handle(Message::ChannelClose(ChannelClose::new(0)))
            .unwrap();
        assert!(matches!(sends(&out)[..], [Message::ChannelClose(_)]));
        assert!(mux.is_empty());
    }

    #[test]
    fn test_both_eofs_close_channel() {
        let (mut mux, mut handle) = open(1000, 1000);
        mux.eof(2, 0);
        let out = mux.handle(Message::ChannelEof(ChannelEof::new(0))).unwrap();
        assert!(matches!(sends(&out)[..], [Message::ChannelClose(_)]));
        assert_eq!(handle.try_recv(), Some(ChannelEvent::Eof));
        assert_eq!(mux.state(0), Some(ChannelState::Closing));
    }

    #[test]
    fn test_send_after_eof_refused() {
        let (mut mux, _h) = open(1000, 1000);
        mux.eof(2, 0);
        let out = mux.send(3, 0, None, b"more".to_vec());
        assert_eq!(completions(&out), vec![(3, Err(ErrorCode::Channel))]);
    }

    #[test]
    fn test_request_replies_fifo() {
        let (mut mux, _h) = open(1000, 1000);
        mux.request(
            2,
            0,
            ChannelRequestType::Env {
                name: "LANG".into(),
                value: "C".into(),
            },
            true,
        );
        mux.request(
            3,
            0,
            ChannelRequestType::Exec {
                command: "ls".into(),
            },
            true,
        );

        let out = mux
            .handle(Message::ChannelFailure(ChannelFailure::new(0)))
            .unwrap();
        assert_eq!(completions(&out), vec![(2, Err(ErrorCode::Channel))]);
        let out = mux
            .handle(Message::ChannelSuccess(ChannelSuccess::new(0)))
            .unwrap();
        assert_eq!(completions(&out), vec![(3, Ok(Completed::Done))]);

        let err = mux
            .handle(Message::ChannelSuccess(ChannelSuccess::new(0)))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_exit_status_and_stderr_events() {
        let (mut mux, mut handle) = open(1000, 1000);
        mux.handle(Message::ChannelExtendedData(ChannelExtendedData::new(
            0,
            EXTENDED_DATA_STDERR,
            b"oops".to_vec(),
        )))
        .unwrap();
        mux.handle(Message::ChannelRequest(ChannelRequest::new(
            0,
            ChannelRequestType::ExitStatus { exit_status: 3 },
            false,
        )))
        .unwrap();

        assert_eq!(
            handle.try_recv(),
            Some(ChannelEvent::ExtendedData {
                data_type: 1,
                data: b"oops".to_vec()
            })
        );
        assert_eq!(handle.try_recv(), Some(ChannelEvent::ExitStatus(3)));
    }

    #[test]
    fn test_open_failure() {
        let mut mux = Multiplexer::new(1, config());
        let (mut handle, _) = mux.open(1, ChannelType::Session);
        let out = mux
            .handle(Message::ChannelOpenFailure(ChannelOpenFailure::new(
                0,
                ChannelOpenFailureReason::AdministrativelyProhibited,
                "no",
            )))
            .unwrap();
        assert_eq!(completions(&out), vec![(1, Err(ErrorCode::Channel))]);
        assert_eq!(handle.try_recv(), Some(ChannelEvent::Closed));
    }

    #[test]
    fn test_flush_waits_for_queued_data() {
        let (mut mux, _h) = open(10, 100);
        let mut out = mux.send(2, 0, None, vec![1; 30]);
        out.extend(mux.flush(3, 0));
        assert!(completions(&out).is_empty());

        let out = mux
            .handle(Message::ChannelWindowAdjust(ChannelWindowAdjust::new(0, 100)))
            .unwrap();
        assert_eq!(
            completions(&out),
            vec![(2, Ok(Completed::Sent(30))), (3, Ok(Completed::Done))]
        );

        // Nothing queued: completes at once, even after EOF
        mux.eof(4, 0);
        let out = mux.flush(5, 0);
        assert_eq!(completions(&out), vec![(5, Ok(Completed::Done))]);
    }

    #[test]
    fn test_accept_peer_opened_channel() {
        let mut mux = Multiplexer::new(1, config());
        let x11 = ChannelType::Other {
            name: "x11".into(),
            data: Vec::new(),
        };
        let (mut handle, out) = mux.accept(&ChannelOpen::new(x11, 42, 500, 200));
        match &sends(&out)[..] {
            [Message::ChannelOpenConfirmation(c)] => {
                assert_eq!(c.recipient_channel(), 42);
                assert_eq!(c.sender_channel(), handle.id());
                assert_eq!(c.initial_window_size(), 1000);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(mux.state(handle.id()), Some(ChannelState::Open));
        assert_eq!(mux.remote_window(handle.id()), Some(500));

        let out = mux.send(2, handle.id(), None, vec![9; 300]);
        let sizes: Vec<usize> = sends(&out)
            .iter()
            .map(|m| match m {
                Message::ChannelData(d) => {
                    assert_eq!(d.recipient_channel(), 42);
                    d.data().len()
                }
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![200, 100]);

        mux.handle(Message::ChannelData(ChannelData::new(handle.id(), b"xauth".to_vec())))
            .unwrap();
        assert_eq!(handle.try_recv(), Some(ChannelEvent::Data(b"xauth".to_vec())));
    }

    #[test]
    fn test_x11_originator_parse() {
        let mut data = bytes::BytesMut::new();
        crate::ssh::encoding::put_str(&mut data, "10.0.0.5");
        data.extend_from_slice(&6010u32.to_be_bytes());
        let (address, port) = X11Channel::parse_originator(&data).unwrap();
        assert_eq!(address, "10.0.0.5");
        assert_eq!(port, 6010);
        assert!(X11Channel::parse_originator(&data[..6]).is_err());
    }

    #[test]
    fn test_peer_close_while_opening_fails_open() {
        let mut mux = Multiplexer::new(1, config());
        let (mut handle, _) = mux.open(1, ChannelType::Session);
        mux.send(2, 0, None, b"early".to_vec());

        let out = mux
            .handle(Message::ChannelClose(ChannelClose::new(0)))
            .unwrap();
        // No remote id yet, so no CLOSE goes back
        assert!(sends(&out).is_empty());
        assert_eq!(
            completions(&out),
            vec![(1, Err(ErrorCode::Channel)), (2, Err(ErrorCode::Channel))]
        );
        assert_eq!(handle.try_recv(), Some(ChannelEvent::Closed));
        assert!(mux.is_empty());
    }

    #[test]
    fn test_data_after_peer_eof_discarded() {
        let (mut mux, mut handle) = open(1000, 1000);
        mux.handle(Message::ChannelEof(ChannelEof::new(0))).unwrap();
        assert_eq!(handle.try_recv(), Some(ChannelEvent::Eof));

        let out = mux
            .handle(Message::ChannelData(ChannelData::new(0, b"late".to_vec())))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(handle.try_recv(), None);
        assert_eq!(mux.local_window(0), Some(1000));
    }

    #[test]
    fn test_fail_all() {
        let (mut mux, mut handle) = open(0, 1000);
        mux.send(2, 0, None, b"stuck".to_vec());
        let out = mux.fail_all(&TetherError::transport("connection lost"));
        assert_eq!(completions(&out), vec![(2, Err(ErrorCode::Transport))]);
        assert_eq!(handle.try_recv(), Some(ChannelEvent::Closed));
        assert!(mux.is_empty());
    }
}
