//! Per-connection state and the receive pipeline.
//!
//! A [`TcpSession`] is owned by the engine task. Socket I/O happens in
//! reader and writer tasks that report back through engine events; this
//! module only transforms bytes: it accumulates, decrypts, frames and
//! dispatches inbound data, and encrypts and queues outbound data.

use bytes::{Buf, Bytes, BytesMut};
use netcore_wire::{AccepterId, HttpMessage, IntegrityResult, Rc4, SessionId, MAX_BUFF_SIZE};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::handle::{EngineHandle, InFlight, SendGauge, SessionHandle};
use crate::reconnect::{ConnectState, ReconnectMachine};
use crate::traits::{ProtoKind, SessionTraits};

/// Legacy cross-domain policy request, NUL included
pub const FLASH_POLICY_REQUEST: &[u8] = b"<policy-file-request/>\0";

/// Reply sent for [`FLASH_POLICY_REQUEST`], NUL included
pub const FLASH_POLICY_RESPONSE: &[u8] =
    b"<cross-domain-policy><allow-access-from domain=\"*\" to-ports=\"*\"/></cross-domain-policy>\0";

/// Why a connection or session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed through the engine API
    Local,
    /// Peer closed the stream
    PeerClosed,
    /// Socket error
    Io(String),
    /// Integrity checker rejected the byte stream
    Corruption,
    /// Dispatcher returned `false`
    Dispatcher,
    /// Outbound connect attempt failed
    ConnectFailed(String),
    /// Engine shut down
    Shutdown,
}

impl CloseReason {
    /// Whether this reason ends the session even for a connector
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CloseReason::Local | CloseReason::Dispatcher | CloseReason::Shutdown
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Io(e) => write!(f, "I/O error: {}", e),
            CloseReason::Corruption => write!(f, "stream corruption"),
            CloseReason::Dispatcher => write!(f, "closed by dispatcher"),
            CloseReason::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            CloseReason::Shutdown => write!(f, "engine shutdown"),
        }
    }
}

/// Statistics for a session
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes handed to the writer
    pub bytes_out: u64,
    /// Units dispatched
    pub units_in: u64,
    /// Units written
    pub units_out: u64,
    /// Timestamp of last received bytes
    pub last_recv: Option<Instant>,
}

/// How the session came to exist
#[derive(Debug)]
pub enum SessionRole {
    /// Accepted by a listening socket
    Accepted {
        /// Owning accepter
        accepter: AccepterId,
    },
    /// Outbound connector with its reconnection machine
    Connector(ReconnectMachine),
}

/// Result of feeding received bytes through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Keep reading
    Continue,
    /// Stop reading and close the connection
    Close(CloseReason),
}

/// Tasks bound to the session; aborted on teardown
#[derive(Debug, Default)]
pub(crate) struct SessionTasks {
    pub reader: Option<JoinHandle<()>>,
    pub pulse: Option<JoinHandle<()>>,
    pub reconnect: Option<JoinHandle<()>>,
    pub connect: Option<JoinHandle<()>>,
}

impl SessionTasks {
    /// Abort the tasks tied to the current connection
    fn abort_connection(&mut self) {
        for task in [self.reader.take(), self.pulse.take()].into_iter().flatten() {
            task.abort();
        }
    }

    /// Abort everything
    fn abort_all(&mut self) {
        self.abort_connection();
        for task in [self.reconnect.take(), self.connect.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

enum FlashCheck {
    Pending,
    Answered,
    NotPolicy,
}

/// One accepted session or outbound connector
#[derive(Debug)]
pub struct TcpSession {
    id: SessionId,
    traits: SessionTraits,
    role: SessionRole,
    peer: Option<SocketAddr>,
    generation: u64,
    recv_buf: BytesMut,
    send_queue: VecDeque<Bytes>,
    gauge: SendGauge,
    writer: Option<(mpsc::UnboundedSender<Bytes>, InFlight)>,
    recv_cipher: Option<Rc4>,
    send_cipher: Option<Rc4>,
    http_msg: HttpMessage,
    http_had_header: bool,
    flash_pending: bool,
    pub(crate) tasks: SessionTasks,
    stats: SessionStats,
}

impl TcpSession {
    /// Session admitted by accepter `accepter`
    pub fn accepted(id: SessionId, accepter: AccepterId, traits: SessionTraits) -> Result<Self> {
        Self::build(id, traits, SessionRole::Accepted { accepter })
    }

    /// Outbound connector in `Disconnected`
    pub fn connector(id: SessionId, traits: SessionTraits) -> Result<Self> {
        let machine = ReconnectMachine::new(traits.options.reconnect.clone());
        Self::build(id, traits, SessionRole::Connector(machine))
    }

    fn build(id: SessionId, traits: SessionTraits, role: SessionRole) -> Result<Self> {
        let mut session = Self {
            id,
            traits,
            role,
            peer: None,
            generation: 0,
            recv_buf: BytesMut::with_capacity(MAX_BUFF_SIZE),
            send_queue: VecDeque::new(),
            gauge: SendGauge::new(),
            writer: None,
            recv_cipher: None,
            send_cipher: None,
            http_msg: HttpMessage::default(),
            http_had_header: false,
            flash_pending: false,
            tasks: SessionTasks::default(),
            stats: SessionStats::default(),
        };
        session.reset_connection()?;
        Ok(session)
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Configuration this session was created with
    pub fn traits(&self) -> &SessionTraits {
        &self.traits
    }

    /// Accepted or connector
    pub fn role(&self) -> &SessionRole {
        &self.role
    }

    /// Reconnection machine of a connector
    pub fn machine_mut(&mut self) -> Option<&mut ReconnectMachine> {
        match &mut self.role {
            SessionRole::Connector(machine) => Some(machine),
            SessionRole::Accepted { .. } => None,
        }
    }

    /// Connection state; accepted sessions are always `Connected`
    pub fn state(&self) -> ConnectState {
        match &self.role {
            SessionRole::Connector(machine) => machine.state(),
            SessionRole::Accepted { .. } => ConnectState::Connected,
        }
    }

    /// Remote address of the current connection
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Counters
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Send-buffer gauge shared with handles and the writer task
    pub fn gauge(&self) -> &SendGauge {
        &self.gauge
    }

    /// Tag of the current connection; events carrying another tag are stale
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Whether a writer is attached
    pub fn is_linked(&self) -> bool {
        self.writer.is_some()
    }

    /// Bytes waiting for a connection
    pub fn queued_units(&self) -> usize {
        self.send_queue.len()
    }

    /// Handle to this session
    pub fn handle(&self, engine: &EngineHandle) -> SessionHandle {
        SessionHandle::new(self.id, self.peer, self.gauge.clone(), engine.clone())
    }

    /// Bind a freshly established connection and flush anything queued
    pub(crate) fn attach(
        &mut self,
        peer: Option<SocketAddr>,
        writer: mpsc::UnboundedSender<Bytes>,
        in_flight: InFlight,
    ) {
        self.peer = peer;
        self.writer = Some((writer, in_flight));
        for data in std::mem::take(&mut self.send_queue) {
            self.write(data);
        }
    }

    /// Drop the current connection and reset per-connection state.
    ///
    /// The receive buffer, HTTP state and cipher states always start over.
    /// The send queue is kept, with units the old writer never wrote put
    /// back at its front; see [`TcpSession::discard_send_queue`].
    pub(crate) fn reset_connection(&mut self) -> Result<()> {
        self.tasks.abort_connection();
        let unwritten = self.detach_writer();
        if !unwritten.is_empty() {
            debug!("Session {} requeueing {} unwritten units", self.id, unwritten.len());
            for unit in unwritten.into_iter().rev() {
                self.send_queue.push_front(unit);
            }
        }
        self.peer = None;
        self.recv_buf.clear();
        self.http_msg.reset();
        self.http_had_header = false;
        self.flash_pending = self.traits.options.open_flash_policy;

        let options = &self.traits.options;
        if options.is_encrypted() {
            self.recv_cipher = Some(Rc4::new(options.rc4_key.as_bytes())?);
            self.send_cipher = Some(Rc4::new(options.rc4_key.as_bytes())?);
        } else {
            self.recv_cipher = None;
            self.send_cipher = None;
        }
        Ok(())
    }

    /// Drop queued outbound data and its reservations
    pub(crate) fn discard_send_queue(&mut self) {
        if !self.send_queue.is_empty() {
            debug!(
                "Session {} discarding {} queued units",
                self.id,
                self.send_queue.len()
            );
        }
        let queued: usize = self.send_queue.drain(..).map(|data| data.len()).sum();
        self.gauge.release(queued);
    }

    fn detach_writer(&mut self) -> VecDeque<Bytes> {
        match self.writer.take() {
            Some((_, in_flight)) => in_flight.retire(),
            None => VecDeque::new(),
        }
    }

    /// Tear down everything before the session is removed
    pub(crate) fn shutdown(&mut self) {
        self.tasks.abort_all();
        self.detach_writer();
        self.send_queue.clear();
        self.gauge.reset();
        if let SessionRole::Connector(machine) = &mut self.role {
            machine.shutdown();
        }
    }

    /// Queue one outbound unit whose bytes are already reserved
    pub(crate) fn queue_send(&mut self, data: Bytes) {
        if self.writer.is_some() {
            self.write(data);
        } else {
            self.send_queue.push_back(data);
        }
    }

    fn write(&mut self, data: Bytes) {
        let Some((writer, in_flight)) = self.writer.as_ref() else {
            self.send_queue.push_back(data);
            return;
        };
        let len = data.len();
        if !in_flight.hand_off(data.clone()) {
            self.send_queue.push_back(data);
            return;
        }

        let data = match self.send_cipher.as_mut() {
            Some(cipher) => {
                let mut buf = BytesMut::from(&data[..]);
                cipher.apply(&mut buf);
                buf.freeze()
            }
            None => data,
        };
        // A failed writer has stopped taking units; the unit stays with
        // `in_flight` until the connection is reset
        if writer.send(data).is_err() {
            return;
        }
        self.stats.bytes_out += len as u64;
        self.stats.units_out += 1;
    }

    /// Feed bytes read from the socket through the pipeline
    pub fn on_recv(&mut self, data: &[u8], session: &SessionHandle) -> RecvOutcome {
        self.stats.bytes_in += data.len() as u64;
        self.stats.last_recv = Some(Instant::now());

        let mut offset = 0;
        while offset < data.len() {
            let room = MAX_BUFF_SIZE - self.recv_buf.len();
            if room == 0 {
                return RecvOutcome::Close(CloseReason::Corruption);
            }
            let take = room.min(data.len() - offset);
            let start = self.recv_buf.len();
            self.recv_buf.extend_from_slice(&data[offset..offset + take]);
            offset += take;

            if let Some(cipher) = self.recv_cipher.as_mut() {
                cipher.apply(&mut self.recv_buf[start..]);
            }

            if self.flash_pending {
                match self.check_flash_policy() {
                    FlashCheck::Pending => continue,
                    FlashCheck::Answered | FlashCheck::NotPolicy => {}
                }
            }

            if let RecvOutcome::Close(reason) = self.drain(session) {
                return RecvOutcome::Close(reason);
            }

            if self.recv_buf.len() >= MAX_BUFF_SIZE {
                warn!(
                    "Session {} receive buffer full without a complete unit",
                    self.id
                );
                return RecvOutcome::Close(CloseReason::Corruption);
            }
        }

        RecvOutcome::Continue
    }

    fn check_flash_policy(&mut self) -> FlashCheck {
        let n = self.recv_buf.len().min(FLASH_POLICY_REQUEST.len());
        if self.recv_buf[..n] != FLASH_POLICY_REQUEST[..n] {
            self.flash_pending = false;
            return FlashCheck::NotPolicy;
        }
        if n < FLASH_POLICY_REQUEST.len() {
            return FlashCheck::Pending;
        }

        self.flash_pending = false;
        self.recv_buf.advance(FLASH_POLICY_REQUEST.len());
        debug!("Session {} answering cross-domain policy request", self.id);
        self.gauge.force_reserve(FLASH_POLICY_RESPONSE.len());
        self.queue_send(Bytes::from_static(FLASH_POLICY_RESPONSE));
        FlashCheck::Answered
    }

    /// Dispatch every complete unit at the front of the receive buffer
    fn drain(&mut self, session: &SessionHandle) -> RecvOutcome {
        let handler = self.traits.handler.clone();

        while !self.recv_buf.is_empty() {
            match self.traits.options.proto {
                ProtoKind::Tcp => match handler.check_tcp(&self.recv_buf, MAX_BUFF_SIZE) {
                    IntegrityResult::Shortage(_) => break,
                    IntegrityResult::Corruption => {
                        return RecvOutcome::Close(CloseReason::Corruption);
                    }
                    IntegrityResult::Success(n) => {
                        if n == 0 || n > self.recv_buf.len() {
                            warn!("Session {} checker reported bad length {}", self.id, n);
                            return RecvOutcome::Close(CloseReason::Corruption);
                        }
                        let unit = self.recv_buf.split_to(n).freeze();
                        self.stats.units_in += 1;
                        trace!("Session {} dispatching {} byte unit", self.id, n);
                        if !handler.dispatch(session, &unit) {
                            return RecvOutcome::Close(CloseReason::Dispatcher);
                        }
                    }
                },
                ProtoKind::Http => {
                    let had_header = self.http_had_header;
                    let result = handler.check_http(
                        &self.recv_buf,
                        MAX_BUFF_SIZE,
                        had_header,
                        &mut self.http_msg,
                    );
                    match result {
                        IntegrityResult::Shortage(_) => {
                            let consumed = self.http_msg.consumed;
                            if had_header || !self.http_msg.is_chunked || consumed == 0 {
                                break;
                            }
                            if consumed > self.recv_buf.len() {
                                return RecvOutcome::Close(CloseReason::Corruption);
                            }
                            // Header parsed, first chunk incomplete
                            self.recv_buf.advance(consumed);
                            self.http_had_header = true;
                        }
                        IntegrityResult::Corruption => {
                            return RecvOutcome::Close(CloseReason::Corruption);
                        }
                        IntegrityResult::Success(n) => {
                            if n == 0 || n > self.recv_buf.len() {
                                warn!("Session {} checker reported bad length {}", self.id, n);
                                return RecvOutcome::Close(CloseReason::Corruption);
                            }
                            self.recv_buf.advance(n);
                            self.stats.units_in += 1;
                            if !handler.dispatch_http(session, &self.http_msg) {
                                return RecvOutcome::Close(CloseReason::Dispatcher);
                            }
                            self.http_had_header =
                                self.http_msg.is_chunked && !self.http_msg.is_last_chunk();
                        }
                    }
                }
            }
        }

        RecvOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::RecordingHandler;
    use crate::handler::SessionHandler;
    use crate::traits::SessionOptions;
    use netcore_wire::BlockBuilder;
    use std::sync::Arc;

    fn session_with(
        options: SessionOptions,
        handler: Arc<RecordingHandler>,
    ) -> (TcpSession, SessionHandle) {
        let dyn_handler: Arc<dyn SessionHandler> = handler;
        let traits = SessionTraits::with_options(options, dyn_handler);
        let session = TcpSession::accepted(1, 0, traits).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = session.handle(&EngineHandle::new(tx));
        (session, handle)
    }

    fn block(proto: u16, payload: &[u8]) -> Bytes {
        BlockBuilder::new(proto).payload(payload).build(MAX_BUFF_SIZE).unwrap()
    }

    #[test]
    fn test_fragmented_and_coalesced_blocks() {
        let handler = Arc::new(RecordingHandler::default());
        let (mut session, handle) = session_with(SessionOptions::default(), handler.clone());

        let a = block(1, b"first");
        let b = block(2, b"second");
        let c = block(3, b"third");

        // a split in two, then b + half of c, then the rest of c
        assert_eq!(session.on_recv(&a[..4], &handle), RecvOutcome::Continue);
        assert!(handler.blocks().is_empty());
        assert_eq!(session.on_recv(&a[4..], &handle), RecvOutcome::Continue);

        let mut joined = b.to_vec();
        joined.extend_from_slice(&c[..5]);
        assert_eq!(session.on_recv(&joined, &handle), RecvOutcome::Continue);
        assert_eq!(session.on_recv(&c[5..], &handle), RecvOutcome::Continue);

        assert_eq!(handler.blocks(), vec![a.to_vec(), b.to_vec(), c.to_vec()]);
        assert_eq!(session.stats().units_in, 3);
    }

    #[test]
    fn test_delivery_larger_than_buffer() {
        let handler = Arc::new(RecordingHandler::default());
        let (mut session, handle) = session_with(SessionOptions::default(), handler.clone());

        let unit = block(5, &[7u8; 994]);
        let mut stream = Vec::new();
        for _ in 0..150 {
            stream.extend_from_slice(&unit);
        }
        assert!(stream.len() > MAX_BUFF_SIZE);

        assert_eq!(session.on_recv(&stream, &handle), RecvOutcome::Continue);
        assert_eq!(handler.blocks().len(), 150);
    }

    #[test]
    fn test_corruption_closes() {
        let handler = Arc::new(RecordingHandler::default());
        let (mut session, handle) = session_with(SessionOptions::default(), handler.clone());

        let mut bad = Vec::new();
        bad.extend_from_slice(&((MAX_BUFF_SIZE as u32) + 1).to_be_bytes());
        bad.extend_from_slice(&[0, 1]);
        assert_eq!(
            session.on_recv(&bad, &handle),
            RecvOutcome::Close(CloseReason::Corruption)
        );
        assert!(handler.blocks().is_empty());
    }

    #[test]
    fn test_dispatcher_false_stops_draining() {
        let handler = Arc::new(RecordingHandler::rejecting(b'!'));
        let (mut session, handle) = session_with(SessionOptions::default(), handler.clone());

        let mut stream = block(1, b"ok").to_vec();
        stream.extend_from_slice(&block(1, b"!stop"));
        stream.extend_from_slice(&block(1, b"never"));

        assert_eq!(
            session.on_recv(&stream, &handle),
            RecvOutcome::Close(CloseReason::Dispatcher)
        );
        assert_eq!(handler.blocks().len(), 2);
    }

    #[test]
    fn test_rc4_stream_decrypted_across_reads() {
        let options = SessionOptions {
            rc4_key: "secret".to_string(),
            ..Default::default()
        };
        let handler = Arc::new(RecordingHandler::default());
        let (mut session, handle) = session_with(options, handler.clone());

        let a = block(1, b"alpha");
        let b = block(2, b"beta");
        let mut plain = a.to_vec();
        plain.extend_from_slice(&b);

        let mut cipher = Rc4::new(b"secret").unwrap();
        let mut wire = plain.clone();
        cipher.apply(&mut wire);

        session.on_recv(&wire[..7], &handle);
        session.on_recv(&wire[7..], &handle);
        assert_eq!(handler.blocks(), vec![a.to_vec(), b.to_vec()]);
    }

    #[test]
    fn test_http_chunked_split_header() {
        let options = SessionOptions {
            proto: ProtoKind::Http,
            ..Default::default()
        };
        let handler = Arc::new(RecordingHandler::default());
        let (mut session, handle) = session_with(options, handler.clone());

        let head = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(session.on_recv(head, &handle), RecvOutcome::Continue);
        assert!(handler.messages.lock().unwrap().is_empty());

        session.on_recv(b"5\r\nhel", &handle);
        session.on_recv(b"lo\r\n3\r\nabc\r\n0\r\n\r\n", &handle);

        let messages = handler.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 3);
        assert_eq!(&messages[0].body[..], b"hello");
        assert_eq!(&messages[1].body[..], b"abc");
        assert!(messages[2].is_last_chunk());
        assert_eq!(messages[2].common_line.0, "POST");
        assert_eq!(messages[2].headers.get("Transfer-Encoding"), Some("chunked"));

        // Next message starts with a fresh header
        session.on_recv(b"GET / HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi", &handle);
        let messages = handler.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 4);
        assert_eq!(&messages[3].body[..], b"hi");
        assert!(!messages[3].is_chunked);
    }

    #[test]
    fn test_flash_policy_answered() {
        let options = SessionOptions {
            open_flash_policy: true,
            ..Default::default()
        };
        let handler = Arc::new(RecordingHandler::default());
        let (mut session, handle) = session_with(options, handler.clone());
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
        let in_flight = session.gauge().connection();
        session.attach(None, writer_tx, in_flight);

        session.on_recv(&FLASH_POLICY_REQUEST[..10], &handle);
        assert!(writer_rx.try_recv().is_err());

        let unit = block(4, b"after");
        let mut rest = FLASH_POLICY_REQUEST[10..].to_vec();
        rest.extend_from_slice(&unit);
        assert_eq!(session.on_recv(&rest, &handle), RecvOutcome::Continue);

        assert_eq!(&writer_rx.try_recv().unwrap()[..], FLASH_POLICY_RESPONSE);
        assert_eq!(handler.blocks(), vec![unit.to_vec()]);
    }

    #[test]
    fn test_flash_policy_ignored_for_normal_traffic() {
        let options = SessionOptions {
            open_flash_policy: true,
            ..Default::default()
        };
        let handler = Arc::new(RecordingHandler::default());
        let (mut session, handle) = session_with(options, handler.clone());

        let unit = block(4, b"plain");
        session.on_recv(&unit, &handle);
        assert_eq!(handler.blocks(), vec![unit.to_vec()]);
    }

    #[test]
    fn test_queue_flushes_on_attach_encrypted() {
        let options = SessionOptions {
            rc4_key: "k".to_string(),
            ..Default::default()
        };
        let handler = Arc::new(RecordingHandler::default());
        let (mut session, _handle) = session_with(options, handler);

        session.gauge().try_reserve(3).unwrap();
        session.queue_send(Bytes::from_static(b"abc"));
        assert_eq!(session.queued_units(), 1);

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
        let in_flight = session.gauge().connection();
        session.attach(None, writer_tx, in_flight);
        assert_eq!(session.queued_units(), 0);

        let mut wire = writer_rx.try_recv().unwrap().to_vec();
        Rc4::new(b"k").unwrap().apply(&mut wire);
        assert_eq!(wire, b"abc");
        assert_eq!(session.stats().units_out, 1);
    }

    #[test]
    fn test_reset_keeps_queue_until_discarded() {
        let handler = Arc::new(RecordingHandler::default());
        let (mut session, handle) = session_with(SessionOptions::default(), handler);

        session.on_recv(&block(1, b"partial")[..5], &handle);
        session.gauge().try_reserve(4).unwrap();
        session.queue_send(Bytes::from_static(b"wait"));

        session.reset_connection().unwrap();
        assert_eq!(session.recv_buf.len(), 0);
        assert_eq!(session.queued_units(), 1);
        assert_eq!(session.gauge().pending(), 4);

        session.discard_send_queue();
        assert_eq!(session.queued_units(), 0);
        assert_eq!(session.gauge().pending(), 0);
    }

    #[test]
    fn test_reset_requeues_unwritten_units() {
        let handler = Arc::new(RecordingHandler::default());
        let (mut session, _handle) = session_with(SessionOptions::default(), handler);

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
        let in_flight = session.gauge().connection();
        session.attach(None, writer_tx, in_flight.clone());
        session.gauge().try_reserve(12).unwrap();
        session.queue_send(Bytes::from_static(b"sent-1"));
        session.queue_send(Bytes::from_static(b"sent-2"));
        assert_eq!(in_flight.held(), 12);

        // First unit reaches the socket, the second does not
        assert_eq!(&writer_rx.try_recv().unwrap()[..], b"sent-1");
        in_flight.written();
        assert_eq!(session.gauge().pending(), 6);

        session.reset_connection().unwrap();
        assert_eq!(session.queued_units(), 1);
        assert_eq!(session.gauge().pending(), 6);

        // The old writer finishing late changes nothing
        in_flight.written();
        assert_eq!(session.gauge().pending(), 6);

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
        let in_flight = session.gauge().connection();
        session.attach(None, writer_tx, in_flight.clone());
        assert_eq!(&writer_rx.try_recv().unwrap()[..], b"sent-2");
        in_flight.written();
        assert_eq!(session.gauge().pending(), 0);
    }

    #[test]
    fn test_discard_drops_unwritten_units() {
        let handler = Arc::new(RecordingHandler::default());
        let (mut session, _handle) = session_with(SessionOptions::default(), handler);

        let (writer_tx, _writer_rx) = mpsc::unbounded_channel();
        let in_flight = session.gauge().connection();
        session.attach(None, writer_tx, in_flight);
        session.gauge().try_reserve(4).unwrap();
        session.queue_send(Bytes::from_static(b"lost"));

        session.reset_connection().unwrap();
        session.discard_send_queue();
        assert_eq!(session.queued_units(), 0);
        assert_eq!(session.gauge().pending(), 0);
    }

    #[test]
    fn test_close_reason_terminal() {
        assert!(CloseReason::Local.is_terminal());
        assert!(CloseReason::Dispatcher.is_terminal());
        assert!(!CloseReason::PeerClosed.is_terminal());
        assert!(!CloseReason::Corruption.is_terminal());
        assert!(!CloseReason::Io("reset".into()).is_terminal());
    }
}
