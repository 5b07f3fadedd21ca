//! XMLSocket client with callback-based completion.
//!
//! This module provides `XmlSocketClient`, which owns at most one TCP
//! connection to an XMLSocket peer. Every operation returns immediately after
//! submission; outcomes are reported through the caller's callbacks, which run
//! on a tokio worker.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::socket::framing::{encode_frame, FrameDecoder};

/// XMLSocket error types.
///
/// `InvalidState` and `ReceiveLoopActive` are returned directly from the
/// offending call. Every other variant is delivered through an `on_failed`
/// callback.
#[derive(Debug, Error)]
pub enum XmlSocketError {
    /// Operation not allowed in the current connection state.
    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the client was in
        state: ConnectionState,
    },

    /// A receive loop is already running on this connection.
    #[error("Invalid state: receive loop already running on this connection")]
    ReceiveLoopActive,

    /// Failed to establish the TCP connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] io::Error),

    /// The operation could not be queued.
    #[error("Submission failed: {0}")]
    Submission(String),

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// The peer closed its side of the connection.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// An incoming message grew past the configured limit.
    #[error("Message exceeds maximum length of {limit} bytes")]
    MessageTooLarge {
        /// Configured maximum, in bytes
        limit: usize,
    },
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Error returned when an endpoint string is not `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid endpoint '{input}': {reason}")]
pub struct EndpointParseError {
    input: String,
    reason: &'static str,
}

/// Remote address of an XMLSocket peer.
///
/// Parsed from `host:port`; IPv6 literals are written as `[addr]:port`.
/// Host names are resolved at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from a host name or IP literal and a port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| EndpointParseError {
            input: s.to_string(),
            reason,
        };

        let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port
            .parse()
            .map_err(|_| invalid("port is not a number in 0-65535"))?;

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl From<(&str, u16)> for Endpoint {
    fn from((host, port): (&str, u16)) -> Self {
        Self::new(host, port)
    }
}

type SentCallback = Box<dyn FnOnce() + Send + 'static>;
type FailedCallback = Box<dyn FnOnce(XmlSocketError) + Send + 'static>;

/// One in-flight send: the framed bytes and its completion callbacks.
struct PendingSend {
    frame: Vec<u8>,
    on_sent: SentCallback,
    on_failed: FailedCallback,
}

/// The live connection owned by the client.
struct Transport {
    /// Duplicate socket handle, used to shut the connection down synchronously.
    control: std::net::TcpStream,
    /// Queue feeding the connection's writer task.
    outgoing: mpsc::UnboundedSender<PendingSend>,
    /// Read half, moved into the receive loop when it starts.
    reader: Option<OwnedReadHalf>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

/// State shared between the client and its background tasks.
struct Shared {
    state: ConnectionState,
    /// Bumped on every connect and disconnect; completions carrying an older
    /// value belong to an abandoned connection.
    generation: u64,
    transport: Option<Transport>,
}

impl Shared {
    fn require(
        &self,
        expected: ConnectionState,
        operation: &'static str,
    ) -> Result<(), XmlSocketError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(XmlSocketError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Move to `Disconnected` and hand back the transport, if any.
    fn release(&mut self) -> Option<Transport> {
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        self.transport.take()
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_current(shared: &Mutex<Shared>, generation: u64) -> bool {
    lock(shared).generation == generation
}

/// Asynchronous client for the XMLSocket protocol.
///
/// Holds at most one connection. Operations never block: `connect`, `send`
/// and `receive` queue work on the ambient tokio runtime and report results
/// through callbacks.
///
/// # Connection Lifecycle
///
/// - `connect()` - start connecting; `on_connected` fires once established
/// - `receive()` - start the receive loop (once per connection)
/// - `send()` - queue a message; any number may be in flight
/// - `disconnect()` - shut the connection down and release it
///
/// # Late completions
///
/// `disconnect()` does not cancel operations in flight. Every completion
/// checks that its connection is still current right before invoking a
/// callback, so nothing further is delivered on the thread that called
/// `disconnect()` once it returns (e.g. the rest of a chunk after
/// `on_received` disconnects). A completion running on another worker may pass
/// its check just before `disconnect()` and still fire once.
///
/// # Example
///
/// ```ignore
/// use xmlsocket::{Endpoint, XmlSocketClient};
///
/// let client = XmlSocketClient::new();
/// client.connect("127.0.0.1:9000".parse::<Endpoint>()?, on_connected, on_failed)?;
/// // ... after on_connected fired:
/// client.receive(|xml| println!("{}", xml), |err| eprintln!("{}", err))?;
/// client.send("<hello/>", || {}, |err| eprintln!("{}", err))?;
/// ```
pub struct XmlSocketClient {
    shared: Arc<Mutex<Shared>>,
    config: ClientConfig,
}

impl Default for XmlSocketClient {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlSocketClient {
    /// Create a disconnected client with default configuration.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a disconnected client with the given configuration.
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                generation: 0,
                transport: None,
            })),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Local address of the live connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared).transport.as_ref().map(|t| t.local_addr)
    }

    /// Remote address of the live connection.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared).transport.as_ref().map(|t| t.peer_addr)
    }

    /// Start connecting to `endpoint`.
    ///
    /// On success the client becomes `Connected` and `on_connected` runs on a
    /// runtime worker. If the attempt cannot be started (no tokio runtime),
    /// `on_failed` runs before this call returns. A refused or unreachable
    /// peer reports `XmlSocketError::ConnectionFailed` through `on_failed`.
    ///
    /// # Errors
    ///
    /// Returns `XmlSocketError::InvalidState` unless the client is
    /// disconnected. No I/O is performed in that case.
    pub fn connect<E, C, F>(
        &self,
        endpoint: E,
        on_connected: C,
        on_failed: F,
    ) -> Result<(), XmlSocketError>
    where
        E: Into<Endpoint>,
        C: FnOnce() + Send + 'static,
        F: FnOnce(XmlSocketError) + Send + 'static,
    {
        let endpoint = endpoint.into();

        let mut shared = lock(&self.shared);
        shared.require(ConnectionState::Disconnected, "connect")?;

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                drop(shared);
                warn!(%endpoint, error = %err, "connect could not be submitted");
                on_failed(XmlSocketError::Submission(err.to_string()));
                return Ok(());
            }
        };

        shared.generation += 1;
        shared.state = ConnectionState::Connecting;
        let generation = shared.generation;
        drop(shared);

        debug!(%endpoint, generation, "connecting");

        let task_shared = Arc::clone(&self.shared);
        let nodelay = self.config.nodelay;
        runtime.spawn(async move {
            let result = open_stream(&endpoint, nodelay).await;

            let mut shared = lock(&task_shared);
            if shared.generation != generation {
                trace!(%endpoint, "dropping stale connect completion");
                return;
            }

            let established = result.and_then(|(stream, control)| {
                Transport::establish(stream, control, &task_shared, generation)
            });

            match established {
                Ok(transport) => {
                    info!(%endpoint, local = %transport.local_addr, "connected");
                    shared.transport = Some(transport);
                    shared.state = ConnectionState::Connected;
                    drop(shared);
                    on_connected();
                }
                Err(err) => {
                    shared.state = ConnectionState::Disconnected;
                    drop(shared);
                    warn!(%endpoint, error = %err, "connect failed");
                    on_failed(XmlSocketError::ConnectionFailed(err));
                }
            }
        });

        Ok(())
    }

    /// Shut down both directions of the connection and release it.
    ///
    /// Also abandons a connect still in progress. In-flight sends and the
    /// receive loop are not cancelled; their completions are dropped.
    ///
    /// # Errors
    ///
    /// Returns `XmlSocketError::InvalidState` when already disconnected.
    pub fn disconnect(&self) -> Result<(), XmlSocketError> {
        let transport = {
            let mut shared = lock(&self.shared);
            if shared.state == ConnectionState::Disconnected {
                return Err(XmlSocketError::InvalidState {
                    operation: "disconnect",
                    state: shared.state,
                });
            }
            shared.release()
        };

        match transport {
            Some(transport) => {
                info!(peer = %transport.peer_addr, "disconnecting");
                transport.close();
            }
            None => debug!("abandoned pending connect"),
        }

        Ok(())
    }

    /// Queue `message` for transmission as one null-terminated frame.
    ///
    /// Messages are written in the order they are queued. `on_sent` fires once
    /// the frame has been handed to the socket; a write error is reported
    /// through `on_failed`. A `\0` inside `message` is not rejected and will
    /// split it into two messages on the peer.
    ///
    /// # Errors
    ///
    /// Returns `XmlSocketError::InvalidState` unless connected.
    pub fn send<S, F>(&self, message: &str, on_sent: S, on_failed: F) -> Result<(), XmlSocketError>
    where
        S: FnOnce() + Send + 'static,
        F: FnOnce(XmlSocketError) + Send + 'static,
    {
        let shared = lock(&self.shared);
        shared.require(ConnectionState::Connected, "send")?;

        let pending = PendingSend {
            frame: encode_frame(message),
            on_sent: Box::new(on_sent),
            on_failed: Box::new(on_failed),
        };
        let len = pending.frame.len();

        let queued = match shared.transport.as_ref() {
            Some(transport) => transport.outgoing.send(pending).map_err(|err| err.0),
            None => Err(pending),
        };
        drop(shared);

        match queued {
            Ok(()) => trace!(len, "send queued"),
            Err(pending) => {
                warn!("send could not be submitted: writer stopped");
                (pending.on_failed)(XmlSocketError::Submission(
                    "connection writer has stopped".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Start the receive loop for the current connection.
    ///
    /// The loop reads fixed-size chunks, calls `on_received` for every
    /// complete message in stream order, and re-arms itself until a read
    /// fails, the peer closes the stream, or a message exceeds the configured
    /// limit. That failure is reported once through `on_failed` and the loop
    /// stops. Empty messages are delivered.
    ///
    /// # Errors
    ///
    /// Returns `XmlSocketError::InvalidState` unless connected, and
    /// `XmlSocketError::ReceiveLoopActive` if a loop was already started on
    /// this connection.
    pub fn receive<R, F>(&self, on_received: R, on_failed: F) -> Result<(), XmlSocketError>
    where
        R: FnMut(String) + Send + 'static,
        F: FnOnce(XmlSocketError) + Send + 'static,
    {
        let mut shared = lock(&self.shared);
        shared.require(ConnectionState::Connected, "receive")?;

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                drop(shared);
                warn!(error = %err, "receive could not be submitted");
                on_failed(XmlSocketError::Submission(err.to_string()));
                return Ok(());
            }
        };

        let generation = shared.generation;
        let reader = shared
            .transport
            .as_mut()
            .and_then(|transport| transport.reader.take())
            .ok_or(XmlSocketError::ReceiveLoopActive)?;
        drop(shared);

        let receiver = ReceiveLoop {
            reader,
            decoder: FrameDecoder::with_max_len(self.config.max_message_len),
            buffer_size: self.config.read_buffer_size,
            shared: Arc::clone(&self.shared),
            generation,
        };
        runtime.spawn(receiver.run(on_received, on_failed));

        debug!(generation, "receive loop started");
        Ok(())
    }
}

impl Drop for XmlSocketClient {
    fn drop(&mut self) {
        if let Some(transport) = lock(&self.shared).release() {
            transport.close();
        }
    }
}

async fn open_stream(
    endpoint: &Endpoint,
    nodelay: bool,
) -> io::Result<(TcpStream, std::net::TcpStream)> {
    let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
    stream.set_nodelay(nodelay)?;

    // Keep a duplicate handle so disconnect can shut the socket down without awaiting
    let std_stream = stream.into_std()?;
    let control = std_stream.try_clone()?;
    let stream = TcpStream::from_std(std_stream)?;

    Ok((stream, control))
}

impl Transport {
    /// Split the stream and start its writer task.
    fn establish(
        stream: TcpStream,
        control: std::net::TcpStream,
        shared: &Arc<Mutex<Shared>>,
        generation: u64,
    ) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let (outgoing, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, queue, Arc::clone(shared), generation));

        Ok(Self {
            control,
            outgoing,
            reader: Some(reader),
            local_addr,
            peer_addr,
        })
    }

    /// Shut down both directions. Pending reads observe end of stream and
    /// queued writes fail; their completions are dropped as stale.
    fn close(self) {
        if let Err(err) = self.control.shutdown(Shutdown::Both) {
            // NotConnected when the peer already went away
            debug!(error = %err, "socket shutdown failed");
        }
    }
}

/// Drain queued sends in order. Ends when the transport is released.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<PendingSend>,
    shared: Arc<Mutex<Shared>>,
    generation: u64,
) {
    while let Some(pending) = queue.recv().await {
        let result = write_frame(&mut writer, &pending.frame).await;

        if !is_current(&shared, generation) {
            trace!("dropping stale send completion");
            continue;
        }

        match result {
            Ok(()) => (pending.on_sent)(),
            Err(err) => {
                warn!(error = %err, "send failed");
                (pending.on_failed)(XmlSocketError::Io(err));
            }
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// The single receive loop of one connection. Owns the accumulator.
struct ReceiveLoop {
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
    buffer_size: usize,
    shared: Arc<Mutex<Shared>>,
    generation: u64,
}

impl ReceiveLoop {
    async fn run<R, F>(mut self, mut on_received: R, on_failed: F)
    where
        R: FnMut(String) + Send + 'static,
        F: FnOnce(XmlSocketError) + Send + 'static,
    {
        let mut buf = vec![0u8; self.buffer_size];

        let failure = loop {
            let n = match self.reader.read(&mut buf).await {
                Ok(0) => break XmlSocketError::ConnectionClosed,
                Ok(n) => n,
                Err(err) => break XmlSocketError::Io(err),
            };

            if !is_current(&self.shared, self.generation) {
                trace!(bytes = n, "dropping stale receive completion");
                return;
            }

            trace!(bytes = n, "chunk received");

            // A callback may disconnect; nothing after that point is delivered
            let mut abandoned = false;
            let decoded = self.decoder.decode(&buf[..n], |message| {
                if abandoned || !is_current(&self.shared, self.generation) {
                    abandoned = true;
                    return;
                }
                on_received(message);
            });

            if abandoned {
                trace!("dropping messages received after disconnect");
                return;
            }
            if let Err(err) = decoded {
                break err;
            }
        };

        if !is_current(&self.shared, self.generation) {
            trace!("receive loop ended after disconnect");
            return;
        }

        warn!(
            error = %failure,
            pending = self.decoder.pending_len(),
            "receive loop terminated"
        );
        on_failed(failure);
    }
}
