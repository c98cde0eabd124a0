//! Memcached text protocol transport over TCP.
//!
//! Each handle owns one background task that dials the server and then
//! serves requests over a single stream:
//! - Requests are pipelined and replies matched in FIFO order
//! - Every request carries a single-fire completion; replies for callers
//!   that already gave up are dropped
//! - Dial failures are retried after `retry_delay` until the handle ends
//! - Losing an established stream fails in-flight requests and stops the
//!   task; the owner is expected to open a new handle

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::{EventEmitter, Transport, TransportError, TransportEvent, TransportFactory, TransportResult};
use crate::config::ClientOptions;
use crate::fuse::{self, Completion};
use crate::protocol::{ParseResult, Parser, Reply, ReplyKind, Request};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

type ReplyCompletion = Completion<TransportResult<Reply>>;

/// A request queued for the I/O task
struct Envelope {
    request: Request,
    completion: ReplyCompletion,
}

/// A request written to the stream and awaiting its reply
struct InFlight {
    kind: ReplyKind,
    completion: ReplyCompletion,
}

/// Opens [`MemcachedTransport`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct MemcachedFactory;

impl TransportFactory for MemcachedFactory {
    type Transport = MemcachedTransport;

    fn open(&self, options: &ClientOptions, events: EventEmitter) -> MemcachedTransport {
        MemcachedTransport::open(options.clone(), events)
    }
}

/// Handle to a memcached server connection
///
/// Must be opened from within a Tokio runtime.
#[derive(Debug)]
pub struct MemcachedTransport {
    requests: mpsc::UnboundedSender<Envelope>,
    online: Arc<AtomicBool>,
    offline_queue: bool,
    shutdown: watch::Sender<bool>,
}

impl MemcachedTransport {
    /// Spawn the I/O task and return immediately; dial results arrive as events
    pub fn open(options: ClientOptions, events: EventEmitter) -> Self {
        let (requests, queue) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let online = Arc::new(AtomicBool::new(false));

        let offline_queue = options.enable_offline_queue;
        let task = IoTask {
            options,
            events,
            queue,
            shutdown: shutdown_rx,
            online: Arc::clone(&online),
        };
        tokio::spawn(task.run());

        Self {
            requests,
            online,
            offline_queue,
            shutdown,
        }
    }

    /// Whether the stream is currently established
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Queue a request and wait for its reply
    async fn send(&self, request: Request) -> TransportResult<Reply> {
        if !self.offline_queue && !self.is_online() {
            return Err(TransportError::Offline);
        }

        let (completion, pending) = fuse::completion();
        self.requests
            .send(Envelope {
                request,
                completion,
            })
            .map_err(|_| TransportError::Closed)?;

        pending.wait().await.unwrap_or(Err(TransportError::Closed))
    }
}

#[async_trait]
impl Transport for MemcachedTransport {
    async fn get(&self, key: &str) -> TransportResult<Option<Bytes>> {
        let request = Request::Get {
            key: key.to_string(),
        };
        match self.send(request).await? {
            Reply::Value(payload) => Ok(payload),
            other => Err(unexpected(other)),
        }
    }

    async fn set(&self, key: &str, payload: Bytes, ttl: u32) -> TransportResult<()> {
        let request = Request::Set {
            key: key.to_string(),
            flags: 0,
            exptime: ttl,
            data: payload,
        };
        match self.send(request).await? {
            Reply::Stored => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, key: &str) -> TransportResult<bool> {
        let request = Request::Delete {
            key: key.to_string(),
        };
        match self.send(request).await? {
            Reply::Deleted => Ok(true),
            Reply::NotFound => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    async fn touch(&self, key: &str, ttl: u32) -> TransportResult<bool> {
        let request = Request::Touch {
            key: key.to_string(),
            exptime: ttl,
        };
        match self.send(request).await? {
            Reply::Touched => Ok(true),
            Reply::NotFound => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    fn end(&self) {
        // Receivers are gone once the task has stopped, nothing to signal then
        let _ = self.shutdown.send(true);
    }
}

impl Drop for MemcachedTransport {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Map a reply that is not the success shape of its request to an error
fn unexpected(reply: Reply) -> TransportError {
    match reply {
        Reply::ServerError(msg) => TransportError::Server(msg),
        Reply::ClientError(msg) => TransportError::Server(format!("client error: {}", msg)),
        Reply::Error => TransportError::Server("command not recognized".to_string()),
        Reply::NotStored => TransportError::Server("not stored".to_string()),
        other => TransportError::Protocol(format!("unexpected reply {:?}", other)),
    }
}

/// Why a served stream stopped
enum StreamExit {
    /// The handle was ended or dropped
    Shutdown,
    /// The stream failed; carries the reason
    Lost(String),
    /// The server sent bytes that do not fit the protocol
    Desync(String),
}

/// Background task owning the socket
struct IoTask {
    options: ClientOptions,
    events: EventEmitter,
    queue: mpsc::UnboundedReceiver<Envelope>,
    shutdown: watch::Receiver<bool>,
    online: Arc<AtomicBool>,
}

impl IoTask {
    async fn run(mut self) {
        let address = self.options.address();
        let mut attempt = 0u32;

        let stream = loop {
            if *self.shutdown.borrow() {
                self.finish(&address);
                return;
            }

            let dialed = tokio::select! {
                _ = self.shutdown.changed() => {
                    self.finish(&address);
                    return;
                }
                dialed = dial(&self.options, &address) => dialed,
            };

            match dialed {
                Ok(stream) => break stream,
                Err(e) => {
                    attempt += 1;
                    let delay = self.options.retry_delay();
                    warn!(server = %address, attempt, error = %e, "Failed to connect");
                    self.events.emit(TransportEvent::Failure {
                        reason: e.to_string(),
                    });
                    self.events
                        .emit(TransportEvent::Reconnecting { attempt, delay });

                    tokio::select! {
                        _ = self.shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        self.online.store(true, Ordering::SeqCst);
        info!(server = %address, "Connected and ready");
        self.events.emit(TransportEvent::Ready);

        let exit = self.serve(stream).await;
        self.online.store(false, Ordering::SeqCst);

        match exit {
            StreamExit::Shutdown => {}
            StreamExit::Lost(reason) => {
                warn!(server = %address, reason = %reason, "Connection lost");
                self.events.emit(TransportEvent::Failure { reason });
            }
            StreamExit::Desync(reason) => {
                warn!(server = %address, reason = %reason, "Protocol error");
                self.events.emit(TransportEvent::Error { reason });
            }
        }
        self.finish(&address);
    }

    /// Fail whatever is still queued and announce the handle is gone
    fn finish(&mut self, address: &str) {
        self.queue.close();
        while let Ok(envelope) = self.queue.try_recv() {
            envelope.completion.complete(Err(TransportError::Closed));
        }
        debug!(server = %address, "Transport stopped");
        self.events.emit(TransportEvent::Remove);
    }

    /// Pump requests out and replies back until the stream ends
    async fn serve(&mut self, stream: TcpStream) -> StreamExit {
        let (mut reader, mut writer) = stream.into_split();
        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
        let mut out = BytesMut::with_capacity(BUFFER_SIZE);
        let mut in_flight: VecDeque<InFlight> = VecDeque::new();

        let exit = loop {
            tokio::select! {
                _ = self.shutdown.changed() => break StreamExit::Shutdown,

                envelope = self.queue.recv() => {
                    let Some(Envelope { request, completion }) = envelope else {
                        break StreamExit::Shutdown;
                    };
                    trace!(?request, "Sending request");

                    out.clear();
                    request.encode(&mut out);
                    if let Err(e) = writer.write_all(&out).await {
                        completion.complete(Err(TransportError::Closed));
                        break StreamExit::Lost(e.to_string());
                    }
                    in_flight.push_back(InFlight {
                        kind: request.reply_kind(),
                        completion,
                    });
                }

                read = reader.read_buf(&mut buffer) => {
                    match read {
                        Ok(0) => break StreamExit::Lost("connection closed by server".to_string()),
                        Ok(_) => {}
                        Err(e) => break StreamExit::Lost(e.to_string()),
                    }
                    if let Err(reason) = drain_replies(&mut buffer, &mut in_flight) {
                        break StreamExit::Desync(reason);
                    }
                }
            }
        };

        for pending in in_flight.drain(..) {
            pending.completion.complete(Err(TransportError::Closed));
        }
        exit
    }
}

/// Complete in-flight requests for every full reply in `buffer`
fn drain_replies(buffer: &mut BytesMut, in_flight: &mut VecDeque<InFlight>) -> Result<(), String> {
    while !buffer.is_empty() {
        let Some(front) = in_flight.front() else {
            return Err("unsolicited data from server".to_string());
        };

        match Parser::parse(buffer, front.kind) {
            ParseResult::Complete(reply, consumed) => {
                buffer.advance(consumed);
                if let Some(done) = in_flight.pop_front() {
                    if !done.completion.complete(Ok(reply)) {
                        trace!("Discarding reply for abandoned request");
                    }
                }
            }
            ParseResult::Incomplete => break,
            ParseResult::Error(e) => return Err(e.to_string()),
        }
    }
    Ok(())
}

/// Connect, apply socket options and run the readiness probe
async fn dial(options: &ClientOptions, address: &str) -> TransportResult<TcpStream> {
    let connect_timeout = options.connect_timeout();

    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| timed_out("connect timed out"))??;

    stream.set_nodelay(options.socket_nodelay)?;
    if options.socket_keepalive {
        socket2::SockRef::from(&stream).set_keepalive(true)?;
    }

    if !options.no_ready_check {
        tokio::time::timeout(connect_timeout, ready_check(&mut stream))
            .await
            .map_err(|_| timed_out("ready check timed out"))??;
    }

    Ok(stream)
}

/// Send `version` and wait for a VERSION reply
async fn ready_check(stream: &mut TcpStream) -> TransportResult<()> {
    let mut out = BytesMut::new();
    Request::Version.encode(&mut out);
    stream.write_all(&out).await?;

    let mut buffer = BytesMut::with_capacity(128);
    loop {
        if stream.read_buf(&mut buffer).await? == 0 {
            return Err(TransportError::Closed);
        }
        match Parser::parse(&buffer, ReplyKind::Version) {
            ParseResult::Complete(Reply::Version(version), _) => {
                debug!(version = %version, "Ready check passed");
                return Ok(());
            }
            ParseResult::Complete(other, _) => return Err(unexpected(other)),
            ParseResult::Incomplete => continue,
            ParseResult::Error(e) => return Err(TransportError::Protocol(e.to_string())),
        }
    }
}

fn timed_out(msg: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, msg.to_string()))
}
