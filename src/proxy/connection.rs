//! Base connection shared by the client-facing and server-facing sides
//!
//! A [`Connection`] owns one socket, split into a read side that feeds the
//! HTTP decoder and a write side with a bounded outbound queue. The owning
//! actor drives it through [`Connection::next_event`], which multiplexes the
//! actor's mailbox, pending writes, socket reads and the idle timer.
//!
//! [`ProxyConnection`] holds the state-driven dispatch of inbound messages;
//! each side only supplies the per-state handlers.

use crate::config::WriteBufferConfig;
use crate::error::{Error, Result};
use crate::models::{HttpObject, Message};
use crate::proxy::codec::{CodecLimits, HttpDecoder, HttpEncoder, Role};
use crate::proxy::state::ConnectionState;
use crate::proxy::throttle::Throttle;
use crate::proxy::transport::{BoxedSocket, Rewind};
use crate::utils::is_last_chunk;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace, warn};

const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// What woke the owning actor up
#[derive(Debug)]
pub enum Event<C> {
    Command(C),
    /// Every sender of the actor's mailbox is gone
    MailboxClosed,
    Message(Message),
    /// Inbound bytes could not be parsed as HTTP
    Malformed(Error),
    Saturated,
    Writable,
    /// A message ending in a terminal chunk has been fully written out
    MessageFlushed,
    IdleTimeout,
    /// Peer closed the socket, or it failed with the given error
    Closed(Option<Error>),
}

#[derive(Debug)]
enum IoEvent {
    Saturated,
    Writable,
    MessageFlushed,
}

struct Outbound {
    data: Bytes,
    /// Empty sentinel queued after a terminal chunk
    sentinel: bool,
}

struct ReadSide {
    half: Option<ReadHalf<BoxedSocket>>,
    buf: BytesMut,
    chunk_size: usize,
    eof: bool,
}

impl ReadSide {
    async fn fill(&mut self) -> io::Result<usize> {
        match self.half.as_mut() {
            Some(half) => {
                self.buf.reserve(self.chunk_size);
                half.read_buf(&mut self.buf).await
            }
            None => std::future::pending().await,
        }
    }
}

struct WriteSide {
    half: Option<WriteHalf<BoxedSocket>>,
    queue: VecDeque<Outbound>,
    queued_bytes: usize,
    needs_flush: bool,
}

enum Flushed {
    Bytes(usize),
    Sentinel,
    Nothing,
}

impl WriteSide {
    fn has_work(&self) -> bool {
        self.half.is_some() && (!self.queue.is_empty() || self.needs_flush)
    }

    /// Performs at most one write (or one flush) so it can be raced against
    /// other events without losing data.
    async fn flush_some(&mut self) -> io::Result<Flushed> {
        let Some(half) = self.half.as_mut() else {
            return std::future::pending().await;
        };

        let Some(front) = self.queue.front_mut() else {
            if self.needs_flush {
                half.flush().await?;
                self.needs_flush = false;
            }
            return Ok(Flushed::Nothing);
        };

        if front.data.is_empty() {
            let sentinel = front.sentinel;
            self.queue.pop_front();
            return Ok(if sentinel { Flushed::Sentinel } else { Flushed::Nothing });
        }

        let written = half.write(&front.data).await?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        front.data.advance(written);
        if front.data.is_empty() && !front.sentinel {
            self.queue.pop_front();
        }
        self.queued_bytes = self.queued_bytes.saturating_sub(written);
        self.needs_flush = true;
        Ok(Flushed::Bytes(written))
    }
}

/// Per-socket state machine and I/O plumbing.
pub struct Connection {
    label: String,
    role: Role,
    limits: CodecLimits,
    state: ConnectionState,
    state_tx: Option<Arc<watch::Sender<ConnectionState>>>,
    tunneling: bool,
    reading: bool,
    read: ReadSide,
    write: WriteSide,
    decoder: Option<HttpDecoder>,
    encoder: HttpEncoder,
    water_marks: WriteBufferConfig,
    saturated: bool,
    pending: VecDeque<IoEvent>,
    idle_timeout: Option<Duration>,
    last_activity: Instant,
    bytes_read: u64,
    bytes_written: u64,
    throttle: Option<Arc<Throttle>>,
    read_paused_until: Option<Instant>,
    write_paused_until: Option<Instant>,
}

impl Connection {
    /// `role` is the kind of message this connection reads: requests on the
    /// client side, responses on the server side.
    pub fn new(
        label: impl Into<String>,
        role: Role,
        initial_state: ConnectionState,
        limits: CodecLimits,
        read_buffer_size: usize,
        water_marks: WriteBufferConfig,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            label: label.into(),
            role,
            limits,
            state: initial_state,
            state_tx: None,
            tunneling: false,
            reading: true,
            read: ReadSide {
                half: None,
                buf: BytesMut::with_capacity(read_buffer_size),
                chunk_size: read_buffer_size.max(1024),
                eof: false,
            },
            write: WriteSide {
                half: None,
                queue: VecDeque::new(),
                queued_bytes: 0,
                needs_flush: false,
            },
            decoder: Some(HttpDecoder::new(role, limits)),
            encoder: HttpEncoder::new(),
            water_marks,
            saturated: false,
            pending: VecDeque::new(),
            idle_timeout,
            last_activity: Instant::now(),
            bytes_read: 0,
            bytes_written: 0,
            throttle: None,
            read_paused_until: None,
            write_paused_until: None,
        }
    }

    /// Charge socket reads and writes against a shared bandwidth limit.
    pub fn set_throttle(&mut self, throttle: Option<Arc<Throttle>>) {
        self.throttle = throttle;
    }

    /// Publish every state change on `tx`.
    pub fn observe_state(&mut self, tx: Arc<watch::Sender<ConnectionState>>) {
        tx.send_replace(self.state);
        self.state_tx = Some(tx);
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn become_state(&mut self, state: ConnectionState) {
        if self.state != state {
            trace!("{}: {} -> {}", self.label, self.state, state);
        }
        self.state = state;
        if let Some(tx) = &self.state_tx {
            tx.send_replace(state);
        }
    }

    pub fn is_tunneling(&self) -> bool {
        self.tunneling
    }

    pub fn is_connected(&self) -> bool {
        self.read.half.is_some() && self.write.half.is_some()
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    pub fn stop_reading(&mut self) {
        if self.reading {
            debug!("{}: stopped reading", self.label);
        }
        self.reading = false;
    }

    pub fn resume_reading(&mut self) {
        if !self.reading {
            debug!("{}: resumed reading", self.label);
        }
        self.reading = true;
    }

    /// Bytes read from and written to the socket since the last call.
    pub fn take_io_counters(&mut self) -> (u64, u64) {
        let counters = (self.bytes_read, self.bytes_written);
        self.bytes_read = 0;
        self.bytes_written = 0;
        counters
    }

    /// Install a freshly connected or accepted socket.
    pub fn attach(&mut self, socket: BoxedSocket) {
        let (read, write) = tokio::io::split(socket);
        self.read.half = Some(read);
        self.read.eof = false;
        self.write.half = Some(write);
        if !self.tunneling {
            self.decoder = Some(HttpDecoder::new(self.role, self.limits));
            self.encoder = HttpEncoder::new();
        }
        self.touch();
    }

    /// Queue a message for the socket. After a terminal chunk an empty
    /// sentinel is queued as well; its flush surfaces as
    /// [`Event::MessageFlushed`].
    pub fn write(&mut self, message: impl Into<Message>) {
        match message.into() {
            Message::Raw(buf) => self.enqueue(buf, false),
            Message::Http(object) => {
                if let (HttpObject::Request(request), Some(decoder)) =
                    (&object, self.decoder.as_mut())
                {
                    if decoder.role() == Role::Response {
                        decoder.expect_response_to(request.method.clone());
                    }
                }
                let last = is_last_chunk(&object);
                let mut out = BytesMut::new();
                self.encoder.encode(&object, &mut out);
                self.enqueue(out.freeze(), false);
                if last {
                    self.enqueue(Bytes::new(), true);
                }
            }
        }
    }

    fn enqueue(&mut self, data: Bytes, sentinel: bool) {
        if self.write.half.is_none() {
            debug!("{}: dropping write on a closed connection", self.label);
            return;
        }
        if data.is_empty() && !sentinel {
            return;
        }
        self.write.queued_bytes += data.len();
        self.write.queue.push_back(Outbound { data, sentinel });

        if !self.saturated && self.write.queued_bytes > self.water_marks.high_water_mark {
            self.saturated = true;
            self.pending.push_back(IoEvent::Saturated);
        }
    }

    fn after_flush(&mut self, flushed: Flushed) {
        match flushed {
            Flushed::Bytes(n) => {
                self.bytes_written += n as u64;
                self.touch();
                if let Some(delay) = self.throttle.as_ref().and_then(|t| t.write_delay(n)) {
                    self.write_paused_until = Some(Instant::now() + delay);
                }
                if self.saturated && self.write.queued_bytes <= self.water_marks.low_water_mark {
                    self.saturated = false;
                    self.pending.push_back(IoEvent::Writable);
                }
            }
            Flushed::Sentinel => self.pending.push_back(IoEvent::MessageFlushed),
            Flushed::Nothing => {}
        }
    }

    /// Write everything queued so far.
    pub async fn flush(&mut self) -> Result<()> {
        while self.write.has_work() {
            if let Some(until) = self.write_paused_until.take() {
                tokio::time::sleep_until(until).await;
            }
            let flushed = self.write.flush_some().await?;
            self.after_flush(flushed);
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn decode_buffered(&mut self) -> Result<Option<Message>> {
        if self.read.buf.is_empty() {
            return Ok(None);
        }
        if self.tunneling {
            return Ok(Some(Message::Raw(self.read.buf.split().freeze())));
        }
        match self.decoder.as_mut() {
            Some(decoder) => Ok(decoder.decode(&mut self.read.buf)?.map(Message::Http)),
            None => Ok(None),
        }
    }

    fn decode_at_eof(&mut self) -> Result<Option<Message>> {
        if let Some(message) = self.decode_buffered()? {
            return Ok(Some(message));
        }
        match self.decoder.as_mut() {
            Some(decoder) if !self.tunneling => {
                Ok(decoder.decode_eof(&mut self.read.buf)?.map(Message::Http))
            }
            _ => Ok(None),
        }
    }

    fn can_read(&self) -> bool {
        self.reading
            && self.read_paused_until.is_none()
            && self.read.half.is_some()
            && !self.read.eof
            && !self.decoder.as_ref().map_or(false, |d| d.is_paused() && !self.tunneling)
    }

    /// Wait for the next thing the owning actor has to react to.
    ///
    /// Priority: queued I/O notifications, then mailbox commands, then
    /// already buffered messages, then the socket and the idle timer.
    pub async fn next_event<C: Send>(
        &mut self,
        mut mailbox: Option<&mut mpsc::UnboundedReceiver<C>>,
    ) -> Event<C> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return match event {
                    IoEvent::Saturated => Event::Saturated,
                    IoEvent::Writable => Event::Writable,
                    IoEvent::MessageFlushed => Event::MessageFlushed,
                };
            }

            if let Some(mailbox) = mailbox.as_deref_mut() {
                match mailbox.try_recv() {
                    Ok(command) => return Event::Command(command),
                    Err(mpsc::error::TryRecvError::Disconnected) => return Event::MailboxClosed,
                    Err(mpsc::error::TryRecvError::Empty) => {}
                }
            }

            if self.reading {
                let decoded = if self.read.eof {
                    self.decode_at_eof()
                } else {
                    self.decode_buffered()
                };
                match decoded {
                    Ok(Some(message)) => return Event::Message(message),
                    Ok(None) if self.read.eof && self.read.half.is_some() => {
                        self.read.half = None;
                        return Event::Closed(None);
                    }
                    Ok(None) => {}
                    Err(e) => return Event::Malformed(e),
                }
            }

            let now = Instant::now();
            self.read_paused_until = self.read_paused_until.filter(|until| *until > now);
            self.write_paused_until = self.write_paused_until.filter(|until| *until > now);
            let resume_at = match (self.read_paused_until, self.write_paused_until) {
                (Some(read), Some(write)) => Some(read.min(write)),
                (read, write) => read.or(write),
            };

            let can_read = self.can_read();
            let can_write = self.write.has_work() && self.write_paused_until.is_none();
            let idle_deadline = self.idle_timeout.map(|timeout| self.last_activity + timeout);
            let has_mailbox = mailbox.is_some();

            tokio::select! {
                biased;
                command = recv_command(mailbox.as_deref_mut()), if has_mailbox => {
                    return match command {
                        Some(command) => Event::Command(command),
                        None => Event::MailboxClosed,
                    };
                }
                flushed = self.write.flush_some(), if can_write => {
                    match flushed {
                        Ok(flushed) => self.after_flush(flushed),
                        Err(e) => return self.socket_failed(e),
                    }
                }
                filled = self.read.fill(), if can_read => {
                    match filled {
                        Ok(0) => self.read.eof = true,
                        Ok(n) => {
                            self.bytes_read += n as u64;
                            self.touch();
                            if let Some(delay) = self.throttle.as_ref().and_then(|t| t.read_delay(n)) {
                                self.read_paused_until = Some(Instant::now() + delay);
                            }
                        }
                        Err(e) => return self.socket_failed(e),
                    }
                }
                _ = sleep_until(resume_at), if resume_at.is_some() => {}
                _ = sleep_until(idle_deadline) => {
                    self.touch();
                    return Event::IdleTimeout;
                }
            }
        }
    }

    fn socket_failed<C>(&mut self, err: io::Error) -> Event<C> {
        self.read.half = None;
        self.write.half = None;
        self.write.queue.clear();
        self.write.queued_bytes = 0;
        Event::Closed(Some(Error::Io(err)))
    }

    /// Stop parsing HTTP and relay raw bytes from now on. Whatever is still
    /// buffered is delivered as the first raw message.
    pub fn start_tunneling(&mut self) {
        debug!("{}: switching to tunneling", self.label);
        self.tunneling = true;
        self.decoder = None;
        self.idle_timeout = None;
    }

    fn take_socket(&mut self) -> Result<(BoxedSocket, Bytes)> {
        match (self.read.half.take(), self.write.half.take()) {
            (Some(read), Some(write)) => {
                let leftover = self.read.buf.split().freeze();
                Ok((read.unsplit(write), leftover))
            }
            _ => Err(Error::Closed(format!("{} has no socket", self.label))),
        }
    }

    /// Client-role TLS handshake over the current socket.
    pub async fn encrypt_as_client(
        &mut self,
        connector: TlsConnector,
        server_name: rustls::ServerName,
    ) -> Result<()> {
        self.flush().await?;
        let (socket, leftover) = self.take_socket()?;
        let stream = connector
            .connect(server_name, Rewind::new(socket, leftover))
            .await?;
        self.attach(Box::new(stream));
        Ok(())
    }

    /// Server-role TLS handshake over the current socket.
    pub async fn encrypt_as_server(&mut self, acceptor: TlsAcceptor) -> Result<()> {
        self.flush().await?;
        let (socket, leftover) = self.take_socket()?;
        let stream = acceptor.accept(Rewind::new(socket, leftover)).await?;
        self.attach(Box::new(stream));
        Ok(())
    }

    /// Graceful close: flush what is queued, then shut the socket down.
    pub async fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected && !self.is_connected() {
            return;
        }
        self.become_state(ConnectionState::DisconnectRequested);
        match tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, self.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{}: error flushing before close: {}", self.label, e),
            Err(_) => warn!("{}: timed out flushing before close", self.label),
        }
        if let Some(mut write) = self.write.half.take() {
            let _ = write.shutdown().await;
        }
        self.disconnected();
    }

    /// The socket is gone: drop it and everything queued for it.
    pub fn disconnected(&mut self) {
        self.read.half = None;
        self.read.buf.clear();
        self.write.half = None;
        self.write.queue.clear();
        self.write.queued_bytes = 0;
        self.write.needs_flush = false;
        if self.saturated {
            self.saturated = false;
        }
        self.become_state(ConnectionState::Disconnected);
    }
}

async fn recv_command<C>(mailbox: Option<&mut mpsc::UnboundedReceiver<C>>) -> Option<C> {
    match mailbox {
        Some(mailbox) => mailbox.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// State-driven handling of inbound messages.
///
/// Implementors provide the handlers for initial messages, body chunks and
/// raw tunnel bytes; [`ProxyConnection::read`] routes each inbound unit
/// according to the current state.
#[async_trait]
pub trait ProxyConnection: Send {
    fn connection(&mut self) -> &mut Connection;

    /// Handle a request or response head and return the next state.
    async fn read_initial(&mut self, object: HttpObject) -> ConnectionState;

    async fn read_chunk(&mut self, object: HttpObject);

    async fn read_raw(&mut self, buf: Bytes);

    async fn read(&mut self, message: Message) {
        if self.connection().is_tunneling() {
            match message {
                Message::Raw(buf) => self.read_raw(buf).await,
                Message::Http(object) => {
                    debug!("{}: dropping parsed {:?} while tunneling", self.connection().label(), object)
                }
            }
            return;
        }

        let Message::Http(object) = message else {
            debug!("{}: dropping raw bytes outside a tunnel", self.connection().label());
            return;
        };

        let state = self.connection().state();
        match state {
            ConnectionState::AwaitingInitial => {
                if object.is_message() {
                    let next = self.read_initial(object).await;
                    self.connection().become_state(next);
                } else {
                    debug!("{}: dropping orphaned content", self.connection().label());
                }
            }
            ConnectionState::AwaitingChunk => {
                let last = is_last_chunk(&object);
                self.read_chunk(object).await;
                if last && self.connection().state() == ConnectionState::AwaitingChunk {
                    self.connection().become_state(ConnectionState::AwaitingInitial);
                }
            }
            ConnectionState::AwaitingProxyAuthentication => {
                if let HttpObject::Request(_) = object {
                    let next = self.read_initial(object).await;
                    self.connection().become_state(next);
                } else {
                    debug!(
                        "{}: dropping content while awaiting proxy authentication",
                        self.connection().label()
                    );
                }
            }
            state if state.is_part_of_connection_flow() => {
                warn!(
                    "{}: unexpected message while in {}, ignoring",
                    self.connection().label(),
                    state
                );
            }
            _ => {
                trace!("{}: ignoring message in {}", self.connection().label(), state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HttpContent, HttpResponse};
    use http::{StatusCode, Version};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn connection(role: Role) -> Connection {
        Connection::new(
            "test",
            role,
            ConnectionState::AwaitingInitial,
            CodecLimits::default(),
            1024,
            WriteBufferConfig::default(),
            None,
        )
    }

    fn attached(role: Role) -> (Connection, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let mut conn = connection(role);
        conn.attach(Box::new(ours));
        (conn, theirs)
    }

    async fn next(conn: &mut Connection) -> Event<()> {
        tokio::time::timeout(Duration::from_secs(5), conn.next_event::<()>(None))
            .await
            .expect("event within the timeout")
    }

    #[tokio::test]
    async fn test_reads_request_and_writes_response() {
        let (mut conn, mut peer) = attached(Role::Request);
        peer.write_all(b"GET /a HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();

        match next(&mut conn).await {
            Event::Message(Message::Http(HttpObject::Request(request))) => {
                assert_eq!(request.uri, "/a")
            }
            other => panic!("unexpected {:?}", other),
        }

        conn.write(HttpObject::Response(HttpResponse::full(
            Version::HTTP_11,
            StatusCode::OK,
            "ok",
        )));
        conn.flush().await.unwrap();
        assert!(matches!(next(&mut conn).await, Event::MessageFlushed));

        let mut buf = vec![0u8; 128];
        let n = peer.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).ends_with("\r\n\r\nok"));
    }

    #[tokio::test]
    async fn test_close_delimited_body_ends_at_eof() {
        let (mut conn, mut peer) = attached(Role::Response);
        // A complete request, so its flush is reported
        let mut request = crate::models::HttpRequest::new(http::Method::GET, "/", Version::HTTP_11);
        request.body = Some(Bytes::new());
        conn.write(HttpObject::Request(request));
        conn.flush().await.unwrap();
        assert!(matches!(next(&mut conn).await, Event::MessageFlushed));

        peer.write_all(b"HTTP/1.0 200 OK\r\n\r\nbody").await.unwrap();
        drop(peer);

        let mut body = Vec::new();
        let mut last_seen = false;
        loop {
            match next(&mut conn).await {
                Event::Message(Message::Http(HttpObject::Response(response))) => {
                    assert!(response.body.is_none());
                }
                Event::Message(Message::Http(HttpObject::Content(content))) => {
                    assert!(!last_seen, "content after the last chunk");
                    body.extend_from_slice(&content.data);
                    last_seen |= content.last;
                }
                Event::Closed(None) => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(last_seen);
        assert_eq!(body, b"body");
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_saturation_and_writability() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let mut conn = Connection::new(
            "test",
            Role::Request,
            ConnectionState::AwaitingInitial,
            CodecLimits::default(),
            1024,
            WriteBufferConfig {
                high_water_mark: 4096,
                low_water_mark: 1024,
            },
            None,
        );
        conn.attach(Box::new(ours));
        conn.start_tunneling();

        conn.write(Message::Raw(Bytes::from(vec![b'x'; 8192])));
        assert!(conn.is_saturated());
        assert!(matches!(next(&mut conn).await, Event::Saturated));

        let drain = tokio::spawn(async move {
            let mut sink = vec![0u8; 8192];
            let mut total = 0;
            while total < 8192 {
                total += theirs.read(&mut sink).await.unwrap();
            }
        });

        assert!(matches!(next(&mut conn).await, Event::Writable));
        assert!(!conn.is_saturated());
        conn.flush().await.unwrap();
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_timeout_fires() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let mut conn = Connection::new(
            "test",
            Role::Request,
            ConnectionState::AwaitingInitial,
            CodecLimits::default(),
            1024,
            WriteBufferConfig::default(),
            Some(Duration::from_millis(50)),
        );
        conn.attach(Box::new(ours));
        assert!(matches!(next(&mut conn).await, Event::IdleTimeout));
    }

    #[tokio::test]
    async fn test_mailbox_has_priority_over_buffered_messages() {
        let (mut conn, mut peer) = attached(Role::Request);
        peer.write_all(b"GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(matches!(next(&mut conn).await, Event::Message(_)));

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send("stop").unwrap();
        match conn.next_event(Some(&mut rx)).await {
            Event::Command(command) => assert_eq!(command, "stop"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stopped_connection_does_not_deliver() {
        let (mut conn, mut peer) = attached(Role::Request);
        conn.stop_reading();
        peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let waited =
            tokio::time::timeout(Duration::from_millis(50), next(&mut conn)).await;
        assert!(waited.is_err());
        conn.resume_reading();
        assert!(matches!(next(&mut conn).await, Event::Message(_)));
    }

    struct Recorder {
        conn: Connection,
        initial: usize,
        chunks: usize,
        raw: usize,
    }

    #[async_trait]
    impl ProxyConnection for Recorder {
        fn connection(&mut self) -> &mut Connection {
            &mut self.conn
        }

        async fn read_initial(&mut self, _object: HttpObject) -> ConnectionState {
            self.initial += 1;
            ConnectionState::AwaitingChunk
        }

        async fn read_chunk(&mut self, _object: HttpObject) {
            self.chunks += 1;
        }

        async fn read_raw(&mut self, _buf: Bytes) {
            self.raw += 1;
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_state() {
        let mut recorder = Recorder {
            conn: connection(Role::Request),
            initial: 0,
            chunks: 0,
            raw: 0,
        };

        // Content without a head is dropped
        recorder
            .read(HttpObject::Content(HttpContent::chunk("orphan")).into())
            .await;
        assert_eq!(recorder.chunks, 0);

        let request = crate::models::HttpRequest::new(http::Method::POST, "/", Version::HTTP_11);
        recorder.read(HttpObject::Request(request.clone()).into()).await;
        assert_eq!(recorder.conn.state(), ConnectionState::AwaitingChunk);

        recorder
            .read(HttpObject::Content(HttpContent::last("done")).into())
            .await;
        assert_eq!(recorder.chunks, 1);
        assert_eq!(recorder.conn.state(), ConnectionState::AwaitingInitial);

        recorder.conn.become_state(ConnectionState::AwaitingProxyAuthentication);
        recorder
            .read(HttpObject::Content(HttpContent::chunk("stray")).into())
            .await;
        assert_eq!(recorder.chunks, 1);
        recorder.read(HttpObject::Request(request.clone()).into()).await;
        assert_eq!(recorder.initial, 2);

        recorder.conn.become_state(ConnectionState::Connecting);
        recorder.read(HttpObject::Request(request.clone()).into()).await;
        assert_eq!(recorder.initial, 2);

        recorder.conn.become_state(ConnectionState::Disconnected);
        recorder.read(HttpObject::Request(request).into()).await;
        assert_eq!(recorder.initial, 2);

        recorder.conn.start_tunneling();
        recorder.read(Message::Raw(Bytes::from_static(b"\x16\x03"))).await;
        assert_eq!(recorder.raw, 1);
    }
}
