//! Per-connection state machine.
//!
//! Every connection is driven by exactly one task that owns the transport,
//! the frame codec, the reassembly buffer and both deflate pipelines.
//! Application code interacts with the connection only through a
//! [`ConnectionHandle`], which carries a bounded command channel into the
//! task and a shared view of the lifecycle state. This keeps all protocol
//! state single-threaded while `send` and `close` stay callable from
//! anywhere.
//!
//! Lifecycle: `Handshaking → Open → Closing → Closed`. The `on_close`
//! callback fires exactly once per connection, after every other callback,
//! regardless of how the connection ends.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::timeout,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    codec::{Codec, Role},
    compression::{negotiated_pipelines, parse_offer, DeflateExtension, Deflator, Inflator},
    frame::{Frame, Message, OpCode},
    handshake,
    options::Options,
    Request, Result, WsError,
};

/// Capacity of the command channel behind [`ConnectionHandle::send`]. A full
/// queue makes `send` return `false` instead of blocking.
const SEND_QUEUE: usize = 64;

/// How long a closing endpoint waits for the peer's close frame before
/// shutting the transport down.
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Pause between echoing a peer's close frame and dropping the transport,
/// so the echo reaches the peer before the FIN.
const CLOSE_SETTLE: Duration = Duration::from_millis(20);

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The Upgrade exchange is still in flight.
    Handshaking,
    /// Messages flow in both directions.
    Open,
    /// A close frame was sent or received; draining.
    Closing,
    /// The transport is gone.
    Closed,
}

/// State shared between the connection task and its handles.
pub(crate) struct Shared {
    state: AtomicU8,
    request: OnceLock<Request>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Handshaking as u8),
            request: OnceLock::new(),
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnectionState::Handshaking,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Commands a handle can enqueue for the connection task.
pub(crate) enum Command {
    Send(Message),
    Close,
}

/// A cheap, cloneable reference to a live connection.
///
/// Handles never own protocol state; dropping every handle of a connection
/// closes it gracefully.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Numeric identifier of the connection, unique within its endpoint.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// `true` while the Upgrade exchange has not completed.
    pub fn is_handshake(&self) -> bool {
        self.shared.state() == ConnectionState::Handshaking
    }

    /// The Upgrade request of a server-side connection, available from the
    /// `on_request` callback onward. `None` on client-side connections.
    pub fn request(&self) -> Option<&Request> {
        self.shared.request.get()
    }

    /// Queues a message for transmission.
    ///
    /// Returns `false` without queueing when the connection is not open or
    /// the outbound queue is full; the call never blocks.
    pub fn send(&self, message: impl Into<Message>) -> bool {
        if self.shared.state() != ConnectionState::Open {
            return false;
        }
        self.tx.try_send(Command::Send(message.into())).is_ok()
    }

    /// Initiates a graceful close: a close frame is sent, the peer is given
    /// a short grace period to answer, then the transport is shut down.
    ///
    /// Calling `close` on a closing or closed connection is a no-op.
    pub fn close(&self) {
        let _ = self.tx.try_send(Command::Close);
    }

    /// Marks the handshake complete. Called by the endpoint that performed
    /// the Upgrade exchange.
    pub(crate) fn mark_open(&self) {
        self.shared.set_state(ConnectionState::Open);
    }
}

/// Creates a handle / command-receiver pair for a new connection.
pub(crate) fn connection_channel(id: u64) -> (ConnectionHandle, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(SEND_QUEUE);
    let handle = ConnectionHandle {
        id,
        tx,
        shared: Arc::new(Shared::new()),
    };
    (handle, rx)
}

pub(crate) type RequestCallback = Arc<dyn Fn(&ConnectionHandle, &Request) + Send + Sync>;
pub(crate) type ConnectCallback = Arc<dyn Fn(&ConnectionHandle) + Send + Sync>;
pub(crate) type MessageCallback = Arc<dyn Fn(&ConnectionHandle, Message) + Send + Sync>;
pub(crate) type ErrorCallback = Arc<dyn Fn(&WsError) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// The callback set a connection reports into.
///
/// Servers populate `on_request`/`on_connect`, clients `on_open` (stored in
/// the same slot) and `on_error`; both deliver messages and the final close
/// notification the same way.
#[derive(Default, Clone)]
pub(crate) struct Callbacks {
    pub(crate) on_request: Option<RequestCallback>,
    pub(crate) on_connect: Option<ConnectCallback>,
    pub(crate) on_message: Option<MessageCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_close: Option<CloseCallback>,
}

/// Runs a user callback, containing panics.
///
/// A panicking application callback is logged and swallowed; it must never
/// tear down the protocol state of the connection that invoked it.
pub(crate) fn invoke(name: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("user {name} callback panicked");
    }
}

// ================ Message assembly ====================

/// Reassembles fragmented messages and applies per-message decompression.
///
/// Control frames never pass through the assembler; they interleave freely
/// with the fragments of a data message.
struct MessageAssembler {
    /// Opcode of the first frame of the open message, `None` when idle.
    kind: Option<OpCode>,
    /// RSV1 of the first frame: the assembled payload needs inflating.
    compressed: bool,
    buffer: BytesMut,
    max_buffer: usize,
}

impl MessageAssembler {
    fn new(max_buffer: usize) -> Self {
        Self {
            kind: None,
            compressed: false,
            buffer: BytesMut::with_capacity(1024),
            max_buffer,
        }
    }

    /// Feeds one data frame; returns a complete message when `fin` closes it.
    fn push(
        &mut self,
        frame: Frame,
        inflator: Option<&mut Inflator>,
        check_utf8: bool,
    ) -> Result<Option<Message>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.kind.is_some() {
                    // previous fragmented message never finished
                    return Err(WsError::InvalidFragment);
                }

                if frame.fin {
                    let kind = frame.opcode;
                    let payload = if frame.is_compressed {
                        inflate(inflator, &frame.payload)?
                    } else {
                        frame.payload
                    };
                    return Self::complete(kind, payload, check_utf8).map(Some);
                }

                self.kind = Some(frame.opcode);
                self.compressed = frame.is_compressed;
                self.buffer.extend_from_slice(&frame.payload);
                self.check_capacity()?;
                Ok(None)
            }
            OpCode::Continuation => {
                let kind = self.kind.ok_or(WsError::InvalidContinuationFrame)?;

                self.buffer.extend_from_slice(&frame.payload);
                self.check_capacity()?;

                if !frame.fin {
                    return Ok(None);
                }

                // replace the buffer instead of reusing it so one huge
                // message does not pin its capacity for the connection
                let assembled =
                    std::mem::replace(&mut self.buffer, BytesMut::with_capacity(1024));
                let payload = if self.compressed {
                    inflate(inflator, &assembled)?
                } else {
                    assembled
                };

                self.kind = None;
                self.compressed = false;

                Self::complete(kind, payload, check_utf8).map(Some)
            }
            _ => unreachable!("control frames are handled before assembly"),
        }
    }

    fn check_capacity(&self) -> Result<()> {
        if self.buffer.len() > self.max_buffer {
            return Err(WsError::FrameTooLarge);
        }
        Ok(())
    }

    fn complete(kind: OpCode, payload: BytesMut, check_utf8: bool) -> Result<Message> {
        if check_utf8 && kind == OpCode::Text && std::str::from_utf8(&payload).is_err() {
            return Err(WsError::InvalidUtf8);
        }
        Ok(Message {
            opcode: kind,
            payload: payload.freeze(),
        })
    }
}

fn inflate(inflator: Option<&mut Inflator>, payload: &[u8]) -> Result<BytesMut> {
    // the codec rejects RSV1 on un-negotiated connections before frames get
    // here
    let inflator = inflator.ok_or(WsError::CompressionNotNegotiated)?;
    Ok(inflator.decompress(payload)?)
}

// ================ Connection driver ====================

/// Outcome of negotiating `permessage-deflate` during a handshake.
pub(crate) struct Negotiated {
    pub(crate) deflator: Option<Deflator>,
    pub(crate) inflator: Option<Inflator>,
}

impl Negotiated {
    pub(crate) fn none() -> Self {
        Self {
            deflator: None,
            inflator: None,
        }
    }

    pub(crate) fn from_extension(role: Role, options: &Options, ext: &DeflateExtension) -> Self {
        let opts = options.deflate.as_ref().expect("deflate options");
        let (deflator, inflator) = negotiated_pipelines(role, opts, ext);
        Self {
            deflator: Some(deflator),
            inflator: Some(inflator),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.deflator.is_some()
    }
}

/// Builds the framed transport for an opened connection, seeding the read
/// buffer with bytes that arrived behind the handshake terminator.
pub(crate) fn build_framed<S>(
    stream: S,
    role: Role,
    negotiated: bool,
    leftover: BytesMut,
    options: &Options,
) -> Framed<S, Codec>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let codec = Codec::new(role, negotiated, options.max_payload_read);
    let mut parts = FramedParts::new(stream, codec);
    parts.read_buf = leftover;
    Framed::from_parts(parts)
}

/// Accepts one server-side connection: drives the Upgrade handshake, then
/// the frame loop, and finally the close notification. This function is the
/// whole life of a connection; it returns when the transport is gone.
pub(crate) async fn serve<S>(
    stream: S,
    handle: ConnectionHandle,
    rx: mpsc::Receiver<Command>,
    options: Options,
    callbacks: Callbacks,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = serve_inner(stream, &handle, rx, &options, &callbacks).await;
    finish(&handle, &callbacks, result);
}

async fn serve_inner<S>(
    stream: S,
    handle: &ConnectionHandle,
    rx: mpsc::Receiver<Command>,
    options: &Options,
    callbacks: &Callbacks,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (framed, negotiated) = timeout(
        options.handshake_timeout,
        server_handshake(stream, handle, options, callbacks),
    )
    .await
    .map_err(|_| WsError::HandshakeTimeout)??;

    handle.shared.set_state(ConnectionState::Open);
    if let Some(on_connect) = &callbacks.on_connect {
        invoke("on_connect", || on_connect(handle));
    }

    run_frames(framed, negotiated, handle, rx, options, callbacks).await
}

/// Consumes the Upgrade request, negotiates extensions and emits the 101.
async fn server_handshake<S>(
    mut stream: S,
    handle: &ConnectionHandle,
    options: &Options,
    callbacks: &Callbacks,
) -> Result<(Framed<S, Codec>, Negotiated)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let (request, consumed) = loop {
        if let Some(parsed) = handshake::parse_request(&buf)? {
            break parsed;
        }
        if buf.len() > handshake::MAX_HANDSHAKE_SIZE {
            return Err(WsError::HandshakeTooLarge);
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(WsError::ConnectionClosed);
        }
    };

    let key = handshake::validate_request(&request)?;

    let negotiation = match &options.deflate {
        Some(_) => request
            .header("Sec-WebSocket-Extensions")
            .and_then(parse_offer),
        None => None,
    };

    // the application may inspect the request before the 101 goes out
    let _ = handle.shared.request.set(request.clone());
    if let Some(on_request) = &callbacks.on_request {
        invoke("on_request", || on_request(handle, &request));
    }

    let response_ext = negotiation.as_ref().map(|_| DeflateExtension::server_response());
    let response = handshake::build_response(
        &handshake::accept_key(key.as_bytes()),
        response_ext.as_ref(),
    );
    stream.write_all(response.as_bytes()).await?;

    let negotiated = match negotiation {
        Some(offer) => Negotiated::from_extension(Role::Server, options, &offer),
        None => Negotiated::none(),
    };

    // bytes pipelined behind the request seed the frame codec
    let _ = buf.split_to(consumed);
    let framed = build_framed(stream, Role::Server, negotiated.enabled(), buf, options);
    Ok((framed, negotiated))
}

/// Drives an already-open client connection to completion. The handshake has
/// been performed by the dialer; this runs the frame loop and the close
/// notification.
pub(crate) async fn drive<S>(
    framed: Framed<S, Codec>,
    negotiated: Negotiated,
    handle: ConnectionHandle,
    rx: mpsc::Receiver<Command>,
    options: Options,
    callbacks: Callbacks,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = run_frames(framed, negotiated, &handle, rx, &options, &callbacks).await;
    finish(&handle, &callbacks, result);
}

/// Terminal bookkeeping, shared by both roles: report the failure (if any),
/// mark the connection closed and fire `on_close` exactly once.
fn finish(handle: &ConnectionHandle, callbacks: &Callbacks, result: Result<()>) {
    if let Err(err) = result {
        match err {
            WsError::ClosedByPeer => log::debug!("connection {} closed by peer", handle.id()),
            _ => log::debug!("connection {} failed: {err}", handle.id()),
        }
        if let Some(on_error) = &callbacks.on_error {
            invoke("on_error", || on_error(&err));
        }
    }

    handle.shared.set_state(ConnectionState::Closed);
    if let Some(on_close) = &callbacks.on_close {
        let id = handle.id();
        invoke("on_close", || on_close(id));
    }
}

/// The open-state frame loop: multiplexes inbound frames with outbound
/// commands until either side closes.
async fn run_frames<S>(
    mut framed: Framed<S, Codec>,
    negotiated: Negotiated,
    handle: &ConnectionHandle,
    mut rx: mpsc::Receiver<Command>,
    options: &Options,
    callbacks: &Callbacks,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Negotiated {
        mut deflator,
        mut inflator,
    } = negotiated;
    let mut assembler = MessageAssembler::new(options.max_read_buffer);

    loop {
        tokio::select! {
            frame = framed.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        fail(&mut framed, &err).await;
                        return Err(err);
                    }
                    // transport dropped without a close frame
                    None => return Err(WsError::ConnectionClosed),
                };

                match frame.opcode {
                    OpCode::Close => {
                        handle.shared.set_state(ConnectionState::Closing);
                        return answer_close(framed, frame).await;
                    }
                    OpCode::Ping => {
                        if options.ping_pong {
                            let pong = Frame::new(true, OpCode::Pong, None, frame.payload);
                            framed.send(pong).await?;
                        }
                    }
                    OpCode::Pong => {}
                    _ => {
                        match assembler.push(frame, inflator.as_mut(), options.check_utf8) {
                            Ok(Some(message)) => {
                                if let Some(on_message) = &callbacks.on_message {
                                    invoke("on_message", || on_message(handle, message));
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                fail(&mut framed, &err).await;
                                return Err(err);
                            }
                        }
                    }
                }
            }
            command = rx.recv() => {
                match command {
                    Some(Command::Send(message)) => {
                        let frame = outbound_frame(message, deflator.as_mut())?;
                        framed.send(frame).await?;
                    }
                    // every handle dropped counts as a close request
                    Some(Command::Close) | None => {
                        handle.shared.set_state(ConnectionState::Closing);
                        return initiate_close(framed).await;
                    }
                }
            }
        }
    }
}

/// Prepares an outbound message: data messages run through the deflator when
/// compression was negotiated, control payloads are size-checked.
fn outbound_frame(message: Message, deflator: Option<&mut Deflator>) -> Result<Frame> {
    match message.opcode {
        OpCode::Text | OpCode::Binary => {
            if let Some(deflator) = deflator {
                let output = deflator.compress(&message.payload)?;
                return Ok(Frame::compressed(true, message.opcode, output));
            }
            Ok(Frame::from(message))
        }
        opcode if opcode.is_control() => {
            if message.payload.len() > 125 {
                return Err(WsError::ControlFrameTooLarge);
            }
            Ok(Frame::from(message))
        }
        _ => Ok(Frame::from(message)),
    }
}

/// Handles a close frame the peer initiated: validate the payload, answer
/// with an empty close frame, linger briefly so the answer gets delivered,
/// then drop the transport.
///
/// Terminates with [`WsError::ClosedByPeer`] so the peer-initiated shutdown
/// reaches `on_error` before the final `on_close`.
async fn answer_close<S>(mut framed: Framed<S, Codec>, frame: Frame) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match frame.payload.len() {
        0 => {}
        1 => return Err(WsError::InvalidCloseFrame),
        _ => {
            let code = frame.close_code().expect("close code");
            frame.close_reason()?;

            if !code.is_allowed() {
                let reply = Frame::from(Message::close(crate::CloseCode::Protocol, ""));
                let _ = timeout(CLOSE_GRACE, framed.send(reply)).await;
                return Err(WsError::InvalidCloseCode);
            }
        }
    }

    let reply = Frame::new(true, OpCode::Close, None, &[][..]);
    timeout(CLOSE_GRACE, framed.send(reply))
        .await
        .map_err(|_| WsError::ConnectionClosed)??;

    tokio::time::sleep(CLOSE_SETTLE).await;
    let _ = framed.get_mut().shutdown().await;
    Err(WsError::ClosedByPeer)
}

/// Performs a locally initiated close: send an empty close frame, wait a
/// bounded grace period for the peer's answer, then drop the transport.
async fn initiate_close<S>(mut framed: Framed<S, Codec>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let close = Frame::new(true, OpCode::Close, None, &[][..]);
    timeout(CLOSE_GRACE, framed.send(close))
        .await
        .map_err(|_| WsError::ConnectionClosed)??;

    let wait_for_echo = async {
        while let Some(result) = framed.next().await {
            match result {
                Ok(frame) if frame.opcode == OpCode::Close => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    };
    let _ = timeout(CLOSE_GRACE, wait_for_echo).await;

    let _ = framed.get_mut().shutdown().await;
    Ok(())
}

/// Best-effort close frame describing why the connection failed; errors
/// while sending it are ignored because the connection is going away anyway.
async fn fail<S>(framed: &mut Framed<S, Codec>, err: &WsError)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let close = Frame::from(Message::close(err.close_code(), err.to_string()));
    let _ = timeout(CLOSE_GRACE, framed.send(close)).await;
    let _ = framed.get_mut().shutdown().await;
}
