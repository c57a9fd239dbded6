//! Channel State Machine
//!
//! A channel is one physical connection plus its negotiated parameters and
//! lifecycle state: `Inactive -> Initializing -> Active`, with `Closed`
//! reachable from any state. Connect returns immediately; the handshake is
//! driven by repeated `continue_init` calls from the dispatch loop, and all
//! reads and writes are non-blocking. Any error other than the
//! would-block/ping events is fatal to the channel it occurred on.

use crate::buffer::BufferPool;
use crate::endpoint::Endpoint;
use crate::frame::{fragment_payload, Frame, FrameKind};
use crate::frame::Reassembler;
use crate::handshake::{negotiate, ConnectAck, ConnectRequest, HandshakeLimits};
use crate::socket::Socket;
use crate::{Result, TransportError};
use bytes::{Bytes, BytesMut};
use codec::WireFormat;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Options for an outbound connect attempt
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub protocol_major: u8,
    pub protocol_minor: u8,
    /// Ping timeout requested from the peer
    pub ping_timeout: Duration,
    /// Largest payload chunk this side wants per frame
    pub max_fragment_size: u32,
    pub wire_format: WireFormat,
    /// Bound on the TCP/TLS connect itself
    pub connect_timeout: Duration,
    /// Bound on the whole init (connect + handshake); a candidate stuck in
    /// `Initializing` past this is abandoned rather than leaked
    pub init_timeout: Duration,
    /// Outbound buffer pool size per channel
    pub max_write_buffers: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            protocol_major: 1,
            protocol_minor: 1,
            ping_timeout: Duration::from_secs(30),
            max_fragment_size: 6144,
            wire_format: WireFormat::Binary,
            connect_timeout: Duration::from_secs(10),
            init_timeout: Duration::from_secs(10),
            max_write_buffers: 32,
        }
    }
}

/// Channel lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Inactive,
    Initializing,
    Active,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelState::Inactive => "INACTIVE",
            ChannelState::Initializing => "INITIALIZING",
            ChannelState::Active => "ACTIVE",
            ChannelState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Which side of the connection this channel is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Outbound connect (consumer-style)
    Client,
    /// Accepted connection (provider-style)
    Server,
}

/// Progress report from `continue_init`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitProgress {
    /// Handshake still in flight; call again when the socket is ready
    InProgress,
    /// Handshake complete; negotiated parameters are available
    Active,
    /// The socket identity changed mid-handshake (tunneled transports);
    /// the caller must re-register the descriptor
    FdChange,
}

/// One logical inbound event from `read`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// A complete application payload
    Message(Bytes),
    /// Peer keep-alive; not an error
    Ping,
    /// Nothing buffered; wait for readiness
    WouldBlock,
    /// Reserved for tunneled transports
    FdChange,
}

/// Outcome of `write`/`flush`/`send_ping`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Everything queued has reached the socket
    Complete,
    /// Bytes still queued; call `flush` again. May be 0 when only the
    /// socket-level flush is outstanding.
    BytesPending(usize),
}

/// Write priority bands, drained high to low on flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

/// Parameters agreed during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub major: u8,
    pub minor: u8,
    pub ping_timeout: Duration,
    pub max_fragment_size: u32,
    pub wire_format: WireFormat,
}

impl From<ConnectAck> for Negotiated {
    fn from(ack: ConnectAck) -> Self {
        Self {
            major: ack.major,
            minor: ack.minor,
            ping_timeout: Duration::from_secs(ack.ping_timeout_secs as u64),
            max_fragment_size: ack.max_fragment_size,
            wire_format: ack.wire_format,
        }
    }
}

enum ChannelIo {
    /// TCP/TLS connect still in flight
    Connecting(Pin<Box<dyn Future<Output = Result<Socket>> + Send>>),
    Ready(Socket),
    Closed,
}

struct PendingWrite {
    buf: BytesMut,
    offset: usize,
}

fn pending_bytes(queues: &[VecDeque<PendingWrite>; 3]) -> usize {
    queues
        .iter()
        .flat_map(|q| q.iter())
        .map(|w| w.buf.len() - w.offset)
        .sum()
}

/// One physical connection and its state machine
pub struct Channel {
    endpoint: Endpoint,
    role: ChannelRole,
    state: ChannelState,
    io: ChannelIo,
    opts: ConnectOptions,
    /// Negotiation limits applied when this side accepts (server role)
    limits: HandshakeLimits,
    read_buf: BytesMut,
    reassembler: Reassembler,
    queues: [VecDeque<PendingWrite>; 3],
    pool: BufferPool,
    negotiated: Option<Negotiated>,
    created_at: Instant,
    init_deadline: Instant,
    request_sent: bool,
    next_frag_id: u16,
    connect_error: Option<TransportError>,
}

impl Channel {
    /// Begin a non-blocking connect to `endpoint`
    ///
    /// Returns immediately in `Initializing`; fails fast on a malformed
    /// endpoint. The caller drives the handshake with `continue_init`.
    pub fn connect(endpoint: &Endpoint, opts: &ConnectOptions) -> Result<Channel> {
        endpoint.validate()?;
        if opts.max_fragment_size == 0 {
            return Err(TransportError::configuration(
                "max_fragment_size must be non-zero",
                Some("max_fragment_size"),
            ));
        }
        // Fragment bodies carry up to 6 bytes of fragment header inside one
        // u16-length frame
        let frag_limit = (crate::frame::MAX_FRAME_LEN - crate::frame::FRAME_HEADER_LEN - 6) as u32;
        if opts.max_fragment_size > frag_limit {
            return Err(TransportError::configuration(
                format!("max_fragment_size above wire limit {}", frag_limit),
                Some("max_fragment_size"),
            ));
        }

        let now = Instant::now();
        let connect = Socket::connect(endpoint.clone(), opts.connect_timeout);

        debug!(endpoint = %endpoint.name, "Channel connect started");
        Ok(Self {
            endpoint: endpoint.clone(),
            role: ChannelRole::Client,
            state: ChannelState::Initializing,
            io: ChannelIo::Connecting(Box::pin(connect)),
            limits: HandshakeLimits::default(),
            read_buf: BytesMut::with_capacity(16 * 1024),
            reassembler: Reassembler::new(),
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            pool: BufferPool::new(opts.max_write_buffers, opts.max_fragment_size as usize + 64),
            negotiated: None,
            created_at: now,
            init_deadline: now + opts.init_timeout,
            request_sent: false,
            next_frag_id: 0,
            connect_error: None,
            opts: opts.clone(),
        })
    }

    /// Wrap an accepted connection (provider side)
    pub(crate) fn accepted(
        socket: Socket,
        endpoint: Endpoint,
        opts: &ConnectOptions,
        limits: HandshakeLimits,
    ) -> Channel {
        let now = Instant::now();
        Self {
            endpoint,
            role: ChannelRole::Server,
            state: ChannelState::Initializing,
            io: ChannelIo::Ready(socket),
            limits,
            read_buf: BytesMut::with_capacity(16 * 1024),
            reassembler: Reassembler::new(),
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            pool: BufferPool::new(opts.max_write_buffers, opts.max_fragment_size as usize + 64),
            negotiated: None,
            created_at: now,
            init_deadline: now + opts.init_timeout,
            request_sent: false,
            next_frag_id: 0,
            connect_error: None,
            opts: opts.clone(),
        }
    }

    /// A detached handle already in `Closed`
    ///
    /// Performs no I/O. Stands in while a live channel is moved between
    /// owners, e.g. when a session swaps its current-channel variant.
    pub fn closed(endpoint: Endpoint) -> Channel {
        let now = Instant::now();
        Self {
            endpoint,
            role: ChannelRole::Client,
            state: ChannelState::Closed,
            io: ChannelIo::Closed,
            limits: HandshakeLimits::default(),
            read_buf: BytesMut::new(),
            reassembler: Reassembler::new(),
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            pool: BufferPool::new(0, 0),
            negotiated: None,
            created_at: now,
            init_deadline: now,
            request_sent: false,
            next_frag_id: 0,
            connect_error: None,
            opts: ConnectOptions::default(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Negotiated parameters; available once `Active`
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Park until this channel's I/O can make progress
    ///
    /// Drives an in-flight connect to completion with a real waker, or waits
    /// for socket readability. Pends forever on a closed channel, which makes
    /// it safe to use as a `select!` branch.
    pub async fn wait_io(&mut self) {
        let connect_result = match &mut self.io {
            ChannelIo::Connecting(fut) => Some(fut.as_mut().await),
            ChannelIo::Ready(socket) => {
                let _ = socket.readable().await;
                None
            }
            ChannelIo::Closed => {
                futures::future::pending::<()>().await;
                None
            }
        };

        if let Some(result) = connect_result {
            match result {
                Ok(socket) => self.io = ChannelIo::Ready(socket),
                Err(e) => {
                    self.io = ChannelIo::Closed;
                    self.connect_error = Some(e);
                }
            }
        }
    }

    /// Drive the transport handshake one step
    ///
    /// Must be called while `Initializing`. Returns `Active` once negotiated
    /// parameters are in place; the channel is fatal (caller closes it) on
    /// any error, including the bounded init timeout.
    pub fn continue_init(&mut self) -> Result<InitProgress> {
        if self.state != ChannelState::Initializing {
            return Err(TransportError::channel_state(
                "continue_init called outside handshake",
                self.state.to_string(),
            ));
        }

        if let Some(err) = self.connect_error.take() {
            return Err(err);
        }

        if Instant::now() >= self.init_deadline {
            return Err(TransportError::timeout(
                format!("channel init to {}", self.endpoint.name),
                self.opts.init_timeout.as_millis() as u64,
            ));
        }

        // Poll an in-flight connect without blocking
        if let ChannelIo::Connecting(fut) = &mut self.io {
            let waker = futures::task::noop_waker();
            let mut cx = Context::from_waker(&waker);
            match fut.as_mut().poll(&mut cx) {
                Poll::Pending => return Ok(InitProgress::InProgress),
                Poll::Ready(Err(e)) => {
                    self.io = ChannelIo::Closed;
                    return Err(e);
                }
                Poll::Ready(Ok(socket)) => {
                    self.io = ChannelIo::Ready(socket);
                }
            }
        }

        match self.role {
            ChannelRole::Client => self.continue_init_client(),
            ChannelRole::Server => self.continue_init_server(),
        }
    }

    fn continue_init_client(&mut self) -> Result<InitProgress> {
        if !self.request_sent {
            let request = ConnectRequest {
                major: self.opts.protocol_major,
                minor: self.opts.protocol_minor,
                ping_timeout_secs: self.opts.ping_timeout.as_secs().min(u16::MAX as u64) as u16,
                max_fragment_size: self.opts.max_fragment_size,
                wire_format: self.opts.wire_format,
            };
            let frame = Frame::new(FrameKind::ConnectRequest, request.encode());
            self.queue_frame(frame, Priority::High)?;
            self.flush()?;
            self.request_sent = true;
            debug!(endpoint = %self.endpoint.name, "Connect request sent");
        } else {
            // Keep pushing a partially written request out
            self.flush()?;
        }

        loop {
            match self.next_frame()? {
                None => return Ok(InitProgress::InProgress),
                Some(frame) => match frame.kind {
                    FrameKind::ConnectAck => {
                        let ack = ConnectAck::decode(frame.body)?;
                        let negotiated = Negotiated::from(ack);
                        info!(
                            endpoint = %self.endpoint.name,
                            version = format!("{}.{}", negotiated.major, negotiated.minor),
                            ping_timeout_secs = negotiated.ping_timeout.as_secs(),
                            fragment_size = negotiated.max_fragment_size,
                            "Channel active"
                        );
                        self.negotiated = Some(negotiated);
                        self.state = ChannelState::Active;
                        return Ok(InitProgress::Active);
                    }
                    FrameKind::ConnectNak => {
                        let reason = String::from_utf8_lossy(&frame.body).to_string();
                        return Err(TransportError::connection(
                            format!("Handshake rejected: {}", reason),
                            self.peer_addr(),
                        ));
                    }
                    FrameKind::Ping => continue,
                    other => {
                        return Err(TransportError::protocol(format!(
                            "Unexpected {:?} frame during handshake",
                            other
                        )))
                    }
                },
            }
        }
    }

    fn continue_init_server(&mut self) -> Result<InitProgress> {
        self.flush()?;

        loop {
            match self.next_frame()? {
                None => return Ok(InitProgress::InProgress),
                Some(frame) => match frame.kind {
                    FrameKind::ConnectRequest => {
                        let request = ConnectRequest::decode(frame.body)?;
                        match negotiate(&self.limits, &request) {
                            Ok(ack) => {
                                let frame = Frame::new(FrameKind::ConnectAck, ack.encode());
                                self.queue_frame(frame, Priority::High)?;
                                self.flush()?;
                                self.negotiated = Some(Negotiated::from(ack));
                                self.state = ChannelState::Active;
                                info!(peer = %self.endpoint.name, "Accepted channel active");
                                return Ok(InitProgress::Active);
                            }
                            Err(reason) => {
                                warn!(peer = %self.endpoint.name, %reason, "Rejecting connect");
                                let frame = Frame::new(
                                    FrameKind::ConnectNak,
                                    Bytes::from(reason.clone().into_bytes()),
                                );
                                self.queue_frame(frame, Priority::High)?;
                                self.flush()?;
                                return Err(TransportError::connection(
                                    format!("Connect rejected: {}", reason),
                                    self.peer_addr(),
                                ));
                            }
                        }
                    }
                    FrameKind::Ping => continue,
                    other => {
                        return Err(TransportError::protocol(format!(
                            "Unexpected {:?} frame during handshake",
                            other
                        )))
                    }
                },
            }
        }
    }

    /// Read at most one logical message
    ///
    /// `WouldBlock` and `Ping` are not errors; anything else negative is
    /// fatal to this channel. Callers loop while buffered input remains.
    pub fn read(&mut self) -> Result<ReadEvent> {
        if self.state != ChannelState::Active {
            return Err(TransportError::channel_state(
                "read on a channel that is not active",
                self.state.to_string(),
            ));
        }

        loop {
            match self.next_frame()? {
                None => return Ok(ReadEvent::WouldBlock),
                Some(frame) => match frame.kind {
                    FrameKind::Ping => return Ok(ReadEvent::Ping),
                    FrameKind::Data => {
                        if let Some(payload) = self.reassembler.accept(frame)? {
                            return Ok(ReadEvent::Message(payload));
                        }
                        // Mid-reassembly fragment; keep draining
                    }
                    other => {
                        return Err(TransportError::protocol(format!(
                            "Unexpected {:?} frame on active channel",
                            other
                        )))
                    }
                },
            }
        }
    }

    /// Queue a payload for send; never blocks
    ///
    /// Payloads above the negotiated fragment size are split into fragment
    /// frames. A `BytesPending` outcome means `flush` must be called until it
    /// reports `Complete`.
    pub fn write(&mut self, payload: Bytes, priority: Priority) -> Result<WriteOutcome> {
        if self.state != ChannelState::Active {
            return Err(TransportError::channel_state(
                "write on a channel that is not active",
                self.state.to_string(),
            ));
        }

        let max_chunk = self
            .negotiated
            .as_ref()
            .map(|n| n.max_fragment_size as usize)
            .unwrap_or(self.opts.max_fragment_size as usize);

        let frames = fragment_payload(&payload, max_chunk, &mut self.next_frag_id)?;
        if frames.len() > self.pool.available() {
            return Err(TransportError::resource_exhausted(
                "buffer_pool",
                format!(
                    "{} buffers needed, {} available; flush and retry",
                    frames.len(),
                    self.pool.available()
                ),
            ));
        }

        for frame in frames {
            self.queue_frame(frame, priority)?;
        }
        self.flush()
    }

    /// Send a zero-payload keep-alive; internally attempts a flush
    pub fn send_ping(&mut self) -> Result<WriteOutcome> {
        if self.state != ChannelState::Active {
            return Err(TransportError::channel_state(
                "ping on a channel that is not active",
                self.state.to_string(),
            ));
        }
        self.queue_frame(Frame::ping(), Priority::High)?;
        self.flush()
    }

    /// Push queued bytes to the socket; never blocks
    pub fn flush(&mut self) -> Result<WriteOutcome> {
        let socket = match &mut self.io {
            ChannelIo::Ready(socket) => socket,
            ChannelIo::Closed => {
                return Err(TransportError::channel_state(
                    "flush on a closed channel",
                    ChannelState::Closed.to_string(),
                ))
            }
            // Connect still in flight; nothing to push yet
            ChannelIo::Connecting(_) => {
                return Ok(WriteOutcome::BytesPending(pending_bytes(&self.queues)))
            }
        };

        let mut blocked = false;
        'queues: for i in 0..self.queues.len() {
            while let Some(front) = self.queues[i].front_mut() {
                match socket.try_write(&front.buf[front.offset..]) {
                    Ok(n) => {
                        front.offset += n;
                        if front.offset == front.buf.len() {
                            if let Some(done) = self.queues[i].pop_front() {
                                self.pool.release(done.buf);
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        blocked = true;
                        break 'queues;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if blocked {
            return Ok(WriteOutcome::BytesPending(pending_bytes(&self.queues)));
        }

        match socket.try_flush() {
            Ok(()) => Ok(WriteOutcome::Complete),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteOutcome::BytesPending(0)),
            Err(e) => Err(e.into()),
        }
    }

    /// Release all resources; idempotent, safe in any state
    pub fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        debug!(endpoint = %self.endpoint.name, state = %self.state, "Closing channel");

        self.state = ChannelState::Closed;
        self.io = ChannelIo::Closed;
        for queue in self.queues.iter_mut() {
            while let Some(pending) = queue.pop_front() {
                self.pool.release(pending.buf);
            }
        }
        self.reassembler.clear();
        self.read_buf.clear();
    }

    /// Peer address, if the socket is up
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.io {
            ChannelIo::Ready(socket) => socket.peer_addr().ok(),
            _ => None,
        }
    }

    /// Decode the next complete frame, pulling from the socket as needed
    ///
    /// `Ok(None)` means the socket would block; a clean peer close is a
    /// connection error (fatal to this channel).
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.read_buf)? {
                return Ok(Some(frame));
            }

            let socket = match &mut self.io {
                ChannelIo::Ready(socket) => socket,
                _ => return Ok(None),
            };
            match socket.try_read_buf(&mut self.read_buf) {
                Ok(0) => {
                    return Err(TransportError::connection(
                        "Peer closed the connection",
                        socket.peer_addr().ok(),
                    ))
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn queue_frame(&mut self, frame: Frame, priority: Priority) -> Result<()> {
        let mut buf = self.pool.acquire()?;
        if let Err(e) = frame.encode_into(&mut buf) {
            self.pool.release(buf);
            return Err(e);
        }
        self.queues[priority as usize].push_back(PendingWrite { buf, offset: 0 });
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejects_malformed_endpoint() {
        let opts = ConnectOptions::default();
        let bad = Endpoint::new("bad", "", 14002);
        assert!(Channel::connect(&bad, &opts).is_err());
    }

    #[test]
    fn test_connect_enters_initializing() {
        let opts = ConnectOptions::default();
        let endpoint = Endpoint::new("Channel_10", "127.0.0.1", 14002);
        let channel = Channel::connect(&endpoint, &opts);
        // No runtime here; the connect future is simply pending
        let channel = channel.unwrap();
        assert_eq!(channel.state(), ChannelState::Initializing);
        assert_eq!(channel.role(), ChannelRole::Client);
        assert!(channel.negotiated().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let opts = ConnectOptions::default();
        let endpoint = Endpoint::new("Channel_10", "127.0.0.1", 14002);
        let mut channel = Channel::connect(&endpoint, &opts).unwrap();

        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        channel.close();
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn test_read_and_write_require_active() {
        let opts = ConnectOptions::default();
        let endpoint = Endpoint::new("Channel_10", "127.0.0.1", 14002);
        let mut channel = Channel::connect(&endpoint, &opts).unwrap();

        assert!(channel.read().is_err());
        assert!(channel
            .write(Bytes::from_static(b"px"), Priority::Medium)
            .is_err());
        assert!(channel.send_ping().is_err());
    }

    #[test]
    fn test_continue_init_outside_handshake_is_state_error() {
        let opts = ConnectOptions::default();
        let endpoint = Endpoint::new("Channel_10", "127.0.0.1", 14002);
        let mut channel = Channel::connect(&endpoint, &opts).unwrap();
        channel.close();

        match channel.continue_init() {
            Err(TransportError::ChannelState { .. }) => {}
            other => panic!("expected ChannelState error, got {:?}", other),
        }
    }
}
