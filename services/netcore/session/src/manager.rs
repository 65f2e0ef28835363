//! Session engine: owns every accepter and session and serializes all
//! state changes on one task.
//!
//! Socket and timer tasks never touch session state. They post
//! [`EngineEvent`]s tagged with the session id and connection generation;
//! the engine drops events whose generation no longer matches, so a
//! cancelled timer or a dead socket can never act on a newer connection.
//! A connector moves to a fresh generation as soon as its connection is
//! dropped, so nothing from the dead connection reaches it while it waits
//! to reconnect.
//!
//! Socket reads travel on a bounded channel; readers wait while the engine
//! is behind instead of buffering without limit.

use bytes::Bytes;
use netcore_wire::{AccepterId, IdAllocator, SessionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accepter::{AccepterExtend, Admission};
use crate::error::{Result, SessionError};
use crate::handle::EngineHandle;
use crate::keepalive::{spawn_pulse, spawn_retry_timer};
use crate::reconnect::{ConnectState, Transition};
use crate::session::{CloseReason, RecvOutcome, SessionRole, TcpSession};
use crate::traits::SessionTraits;
use crate::transport::{listen_tcp, spawn_accept_loop, spawn_connect, spawn_reader, spawn_writer};

/// Read events buffered ahead of the engine across all connections
const READ_EVENT_CAPACITY: usize = 100;

/// Everything that can change engine state
#[derive(Debug)]
pub enum EngineEvent {
    /// Listener accepted a connection
    Accepted {
        /// Accepter that owns the listener
        accepter: AccepterId,
        /// Accepted stream
        stream: TcpStream,
        /// Remote address
        peer: SocketAddr,
    },
    /// Outbound connect attempt succeeded
    Connected {
        /// Connector id
        id: SessionId,
        /// Attempt generation
        generation: u64,
        /// Established stream
        stream: TcpStream,
    },
    /// Outbound connect attempt failed
    ConnectFailed {
        /// Connector id
        id: SessionId,
        /// Attempt generation
        generation: u64,
        /// Error text
        error: String,
    },
    /// Bytes read from a connection
    Data {
        /// Session id
        id: SessionId,
        /// Connection generation
        generation: u64,
        /// Raw bytes as read
        data: Bytes,
    },
    /// Connection ended from the socket side
    Closed {
        /// Session id
        id: SessionId,
        /// Connection generation
        generation: u64,
        /// Cause
        reason: CloseReason,
    },
    /// Pulse timer fired
    Pulse {
        /// Session id
        id: SessionId,
        /// Connection generation
        generation: u64,
    },
    /// Reconnection delay elapsed
    ReconnectDue {
        /// Connector id
        id: SessionId,
        /// Generation of the failed connection
        generation: u64,
    },
    /// Outbound unit whose bytes are already reserved
    Send {
        /// Session id
        id: SessionId,
        /// Plaintext bytes
        data: Bytes,
    },
    /// Close a session
    Close {
        /// Session id
        id: SessionId,
    },
    /// Stop accepting on a listener
    CloseAccepter {
        /// Accepter id
        id: AccepterId,
    },
    /// Create and start a connector
    Connect {
        /// Connector configuration
        traits: SessionTraits,
        /// Receives the new id
        reply: oneshot::Sender<Result<SessionId>>,
    },
    /// Close everything and leave the run loop
    Stop,
}

#[derive(Debug)]
struct AccepterEntry {
    extend: AccepterExtend,
    task: JoinHandle<()>,
}

/// Session engine
#[derive(Debug)]
pub struct SessionManager {
    ids: IdAllocator,
    sessions: HashMap<SessionId, TcpSession>,
    accepters: HashMap<AccepterId, AccepterEntry>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    reads_tx: mpsc::Sender<EngineEvent>,
    reads_rx: mpsc::Receiver<EngineEvent>,
    engine: EngineHandle,
    last_generation: u64,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    /// Create an engine with no accepters or sessions
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reads_tx, reads_rx) = mpsc::channel(READ_EVENT_CAPACITY);
        let engine = EngineHandle::new(events_tx.clone());
        Self {
            ids: IdAllocator::new(),
            sessions: HashMap::new(),
            accepters: HashMap::new(),
            events_tx,
            events_rx,
            reads_tx,
            reads_rx,
            engine,
            last_generation: 0,
        }
    }

    /// Cloneable command handle
    pub fn handle(&self) -> EngineHandle {
        self.engine.clone()
    }

    /// Number of live sessions (accepted and connectors)
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Look up a live session
    pub fn session(&self, id: SessionId) -> Option<&TcpSession> {
        self.sessions.get(&id)
    }

    /// Connection state of a live session
    pub fn session_state(&self, id: SessionId) -> Option<ConnectState> {
        self.sessions.get(&id).map(TcpSession::state)
    }

    /// Ids of every live session
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Configuration and counters of an open accepter
    pub fn accepter(&self, id: AccepterId) -> Option<&AccepterExtend> {
        self.accepters.get(&id).map(|entry| &entry.extend)
    }

    /// Bind and start an accepter.
    ///
    /// A listen port of 0 binds an ephemeral port; the returned accepter
    /// reports the port actually bound.
    pub async fn open_accepter(&mut self, mut extend: AccepterExtend) -> Result<AccepterId> {
        let addr = extend.listen_addr()?;
        let accepters = &self.accepters;
        let id = self
            .ids
            .alloc_accepter(|id| accepters.contains_key(&id))
            .ok_or(SessionError::IdsExhausted)?;

        let listener = listen_tcp(addr).await?;
        let local = listener.local_addr()?;
        extend.id = id;
        extend.listen_port = local.port();

        info!("Accepter {} listening on {}", id, local);
        debug!("Accepter {} config: {}", id, extend);

        let task = spawn_accept_loop(id, listener, self.events_tx.clone());
        self.accepters.insert(id, AccepterEntry { extend, task });
        Ok(id)
    }

    /// Stop an accepter; sessions it already admitted stay alive
    pub fn close_accepter(&mut self, id: AccepterId) -> Result<()> {
        let entry = self
            .accepters
            .remove(&id)
            .ok_or(SessionError::UnknownAccepter(id))?;
        entry.task.abort();
        info!(
            "Accepter {} closed ({} accepted, {} still linked)",
            id, entry.extend.total_accept_count, entry.extend.current_linked
        );
        Ok(())
    }

    /// Register an outbound session without connecting it
    pub fn add_connector(&mut self, traits: SessionTraits) -> Result<SessionId> {
        let remote = traits.options.remote_addr()?;
        let sessions = &self.sessions;
        let id = self
            .ids
            .alloc_connect(|id| sessions.contains_key(&id))
            .ok_or(SessionError::IdsExhausted)?;

        let session = TcpSession::connector(id, traits)?;
        debug!("Connector {} to {}: {}", id, remote, session.traits());
        self.sessions.insert(id, session);
        Ok(id)
    }

    /// Start the first connect attempt of a connector
    pub fn open_connector(&mut self, id: SessionId) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        session
            .machine_mut()
            .ok_or(SessionError::UnknownSession(id))?
            .start()?;
        self.start_connect(id)
    }

    /// Register and start an outbound session
    pub fn connect(&mut self, traits: SessionTraits) -> Result<SessionId> {
        let id = self.add_connector(traits)?;
        if let Err(e) = self.open_connector(id) {
            self.sessions.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Queue one outbound unit, enforcing the send-buffer bound
    pub fn send(&mut self, id: SessionId, data: Bytes) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        session.gauge().try_reserve(data.len())?;
        session.queue_send(data);
        Ok(())
    }

    /// Close a session; the id is invalid when this returns
    pub fn close_session(&mut self, id: SessionId) -> Result<()> {
        if !self.sessions.contains_key(&id) {
            return Err(SessionError::UnknownSession(id));
        }
        self.terminate(id, CloseReason::Local);
        Ok(())
    }

    /// Close every session and accepter
    pub fn stop(&mut self) {
        let ids: Vec<AccepterId> = self.accepters.keys().copied().collect();
        for id in ids {
            let _ = self.close_accepter(id);
        }
        for id in self.session_ids() {
            self.terminate(id, CloseReason::Shutdown);
        }
    }

    /// Process events until [`EngineEvent::Stop`]
    pub async fn run(mut self) {
        info!("Session engine started");
        while let Some(event) = self.next_event().await {
            if !self.process_event(event) {
                break;
            }
        }
        self.stop();
        info!("Session engine stopped");
    }

    /// Wait for and process a single event; `false` after a stop request
    pub async fn step(&mut self) -> bool {
        match self.next_event().await {
            Some(event) => self.process_event(event),
            None => false,
        }
    }

    async fn next_event(&mut self) -> Option<EngineEvent> {
        tokio::select! {
            biased;
            Some(event) = self.events_rx.recv() => Some(event),
            Some(event) = self.reads_rx.recv() => Some(event),
            else => None,
        }
    }

    /// Apply one event; returns `false` when the engine should stop
    pub fn process_event(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Accepted {
                accepter,
                stream,
                peer,
            } => self.on_accepted(accepter, stream, peer),
            EngineEvent::Connected {
                id,
                generation,
                stream,
            } => self.on_connected(id, generation, stream),
            EngineEvent::ConnectFailed {
                id,
                generation,
                error,
            } => self.on_connect_failed(id, generation, error),
            EngineEvent::Data {
                id,
                generation,
                data,
            } => self.on_data(id, generation, data),
            EngineEvent::Closed {
                id,
                generation,
                reason,
            } => {
                if current(&mut self.sessions, id, generation).is_some() {
                    self.drop_connection(id, reason);
                }
            }
            EngineEvent::Pulse { id, generation } => self.on_pulse(id, generation),
            EngineEvent::ReconnectDue { id, generation } => self.on_reconnect_due(id, generation),
            EngineEvent::Send { id, data } => match self.sessions.get_mut(&id) {
                Some(session) => session.queue_send(data),
                None => debug!("Dropping {} bytes for unknown session {}", data.len(), id),
            },
            EngineEvent::Close { id } => {
                if let Err(e) = self.close_session(id) {
                    debug!("Close ignored: {}", e);
                }
            }
            EngineEvent::CloseAccepter { id } => {
                if let Err(e) = self.close_accepter(id) {
                    warn!("Close accepter ignored: {}", e);
                }
            }
            EngineEvent::Connect { traits, reply } => {
                let _ = reply.send(self.connect(traits));
            }
            EngineEvent::Stop => return false,
        }
        true
    }

    fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }

    fn on_accepted(&mut self, accepter_id: AccepterId, stream: TcpStream, peer: SocketAddr) {
        let Some(entry) = self.accepters.get_mut(&accepter_id) else {
            debug!("Connection from {} for closed accepter {}", peer, accepter_id);
            return;
        };

        let traits = match entry.extend.admit(&peer.ip().to_string()) {
            Admission::Accepted(traits) => traits,
            Admission::RejectedWhitelist => {
                warn!("Accepter {} rejected {}: not whitelisted", accepter_id, peer);
                return;
            }
            Admission::RejectedCapacity => {
                warn!(
                    "Accepter {} rejected {}: {} sessions linked",
                    accepter_id, peer, entry.extend.current_linked
                );
                return;
            }
        };

        let sessions = &self.sessions;
        let Some(id) = self.ids.alloc_session(|id| sessions.contains_key(&id)) else {
            error!("Session id space exhausted, dropping {}", peer);
            entry.extend.release();
            return;
        };

        let mut session = match TcpSession::accepted(id, accepter_id, traits) {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to create session for {}: {}", peer, e);
                entry.extend.release();
                return;
            }
        };

        let generation = self.next_generation();
        session.set_generation(generation);
        link(&self.events_tx, &self.reads_tx, &mut session, stream);
        info!("Session {} accepted from {} on accepter {}", id, peer, accepter_id);

        let handle = session.handle(&self.engine);
        let handler = session.traits().handler.clone();
        self.sessions.insert(id, session);
        handler.on_linked(&handle);
    }

    fn on_connected(&mut self, id: SessionId, generation: u64, stream: TcpStream) {
        let Some(session) = current(&mut self.sessions, id, generation) else {
            debug!("Discarding stale connection for session {}", id);
            return;
        };
        session.tasks.connect = None;

        if let Some(machine) = session.machine_mut() {
            if let Err(e) = machine.on_connected() {
                warn!("Session {}: {}", id, e);
                return;
            }
        }

        link(&self.events_tx, &self.reads_tx, session, stream);
        info!("Session {} connected to {:?}", id, session.peer());

        let handle = session.handle(&self.engine);
        session.traits().handler.clone().on_linked(&handle);
    }

    fn on_connect_failed(&mut self, id: SessionId, generation: u64, error: String) {
        let Some(session) = current(&mut self.sessions, id, generation) else {
            return;
        };
        session.tasks.connect = None;

        let transition = match session.machine_mut().map(|m| m.on_connect_failed()) {
            Some(Ok(transition)) => transition,
            Some(Err(e)) => {
                warn!("Session {}: {}", id, e);
                return;
            }
            None => return,
        };

        match transition {
            Transition::Retry { delay, .. } => {
                warn!("Session {} connect failed ({}), retrying in {:?}", id, error, delay);
                self.schedule_retry(id, delay);
            }
            Transition::Failed => {
                warn!("Session {} connect failed ({}), giving up", id, error);
                self.terminate(id, CloseReason::ConnectFailed(error));
            }
        }
    }

    fn on_data(&mut self, id: SessionId, generation: u64, data: Bytes) {
        let Some(session) = current(&mut self.sessions, id, generation) else {
            return;
        };
        let handle = session.handle(&self.engine);
        if let RecvOutcome::Close(reason) = session.on_recv(&data, &handle) {
            self.drop_connection(id, reason);
        }
    }

    fn on_pulse(&mut self, id: SessionId, generation: u64) {
        let Some(session) = current(&mut self.sessions, id, generation) else {
            return;
        };
        let handle = session.handle(&self.engine);
        session.traits().handler.clone().on_pulse(&handle);
    }

    fn on_reconnect_due(&mut self, id: SessionId, generation: u64) {
        let Some(session) = current(&mut self.sessions, id, generation) else {
            return;
        };
        session.tasks.reconnect = None;

        let Some(machine) = session.machine_mut() else {
            return;
        };
        if let Err(e) = machine.on_retry_due() {
            warn!("Session {}: {}", id, e);
            return;
        }
        debug!("Session {} reconnecting ({})", id, machine);
        if let Err(e) = self.start_connect(id) {
            warn!("Session {} reconnect failed to start: {}", id, e);
            self.terminate(id, CloseReason::ConnectFailed(e.to_string()));
        }
    }

    fn start_connect(&mut self, id: SessionId) -> Result<()> {
        let generation = self.next_generation();
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        let addr = session.traits().options.remote_addr()?;
        session.set_generation(generation);
        session.tasks.connect = Some(spawn_connect(id, generation, addr, self.events_tx.clone()));
        debug!("Session {} connecting to {}", id, addr);
        Ok(())
    }

    /// Wait out `delay` under a fresh generation
    fn schedule_retry(&mut self, id: SessionId, delay: Duration) {
        let generation = self.next_generation();
        if let Some(session) = self.sessions.get_mut(&id) {
            session.set_generation(generation);
            let task = spawn_retry_timer(id, generation, delay, self.events_tx.clone());
            session.tasks.reconnect = Some(task);
        }
    }

    /// A connection ended. Accepted sessions and terminal reasons remove
    /// the session; connectors consult their reconnection machine.
    fn drop_connection(&mut self, id: SessionId, reason: CloseReason) {
        if reason.is_terminal() {
            self.terminate(id, reason);
            return;
        }

        let transition = match self.sessions.get_mut(&id) {
            Some(session) => session.machine_mut().map(|m| m.on_disconnected()),
            None => return,
        };
        let (delay, discard_send_queue) = match transition {
            Some(Ok(Transition::Retry {
                delay,
                discard_send_queue,
            })) => (delay, discard_send_queue),
            Some(Ok(Transition::Failed)) | None => {
                self.terminate(id, reason);
                return;
            }
            Some(Err(e)) => {
                // Connection already dropped
                debug!("Session {} ignoring close ({}): {}", id, reason, e);
                return;
            }
        };

        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let handle = session.handle(&self.engine);
        if let Err(e) = session.reset_connection() {
            error!("Session {} failed to reset: {}", id, e);
            self.terminate(id, reason);
            return;
        }
        if discard_send_queue {
            session.discard_send_queue();
        }
        info!("Session {} disconnected: {}, retrying in {:?}", id, reason, delay);
        let handler = session.traits().handler.clone();
        self.schedule_retry(id, delay);
        handler.on_disconnected(&handle, &reason);
    }

    /// Remove a session for good and notify its handler
    fn terminate(&mut self, id: SessionId, reason: CloseReason) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        session.shutdown();

        if let SessionRole::Accepted { accepter } = session.role() {
            if let Some(entry) = self.accepters.get_mut(accepter) {
                entry.extend.release();
            }
        }

        info!("Session {} closed: {}", id, reason);
        let handle = session.handle(&self.engine);
        session.traits().handler.clone().on_closed(&handle, &reason);
    }
}

/// Live session whose current connection carries `generation`
fn current(
    sessions: &mut HashMap<SessionId, TcpSession>,
    id: SessionId,
    generation: u64,
) -> Option<&mut TcpSession> {
    sessions
        .get_mut(&id)
        .filter(|session| session.generation() == generation)
}

/// Split `stream` into reader and writer tasks bound to `session`
fn link(
    events: &mpsc::UnboundedSender<EngineEvent>,
    reads: &mpsc::Sender<EngineEvent>,
    session: &mut TcpSession,
    stream: TcpStream,
) {
    let id = session.id();
    let generation = session.generation();
    let no_delay = session.traits().options.no_delay;
    let pulse = session.traits().options.pulse_interval();

    if let Err(e) = stream.set_nodelay(no_delay) {
        debug!("Session {} set_nodelay failed: {}", id, e);
    }
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();

    let in_flight = session.gauge().connection();

    // Writer is not tracked: it drains and exits once writer_tx is dropped
    spawn_writer(
        write_half,
        writer_rx,
        in_flight.clone(),
        id,
        generation,
        events.clone(),
    );
    session.tasks.reader = Some(spawn_reader(read_half, id, generation, reads.clone()));
    if let Some(period) = pulse {
        session.tasks.pulse = Some(spawn_pulse(id, generation, period, events.clone()));
    }
    session.attach(peer, writer_tx, in_flight);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::SessionHandle;
    use crate::handler::tests::RecordingHandler;
    use crate::handler::SessionHandler;
    use netcore_wire::{
        BlockBuilder, BLOCK_HEADER_SIZE, MAX_BUFF_SIZE, MAX_SEND_PACK_SIZE, SESSION_ID_BOUNDARY,
    };
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug, Default)]
    struct EchoHandler;

    impl SessionHandler for EchoHandler {
        fn dispatch(&self, session: &SessionHandle, block: &[u8]) -> bool {
            session.send(Bytes::copy_from_slice(block)).is_ok()
        }
    }

    fn block(payload: &[u8]) -> Bytes {
        BlockBuilder::new(1).payload(payload).build(MAX_BUFF_SIZE).unwrap()
    }

    async fn drive_until(manager: &mut SessionManager, cond: impl Fn(&SessionManager) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond(manager) {
                assert!(manager.step().await, "engine stopped");
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn local_accepter(handler: Arc<dyn SessionHandler>) -> AccepterExtend {
        AccepterExtend::new("127.0.0.1", 0, SessionTraits::new(handler))
    }

    /// Connector to `listener` that reached `Connected`, with the server side
    async fn connected(
        manager: &mut SessionManager,
        listener: &TcpListener,
        traits: SessionTraits,
    ) -> (SessionId, TcpStream) {
        let id = manager.connect(traits).unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drive_until(manager, |m| m.session_state(id) == Some(ConnectState::Connected)).await;
        (id, server)
    }

    fn connect_count(manager: &SessionManager, id: SessionId) -> Option<u64> {
        manager.session(id).and_then(|s| match s.role() {
            SessionRole::Connector(machine) => Some(machine.total_connect_count()),
            SessionRole::Accepted { .. } => None,
        })
    }

    /// Reset `server` and queue a full send buffer before the engine notices
    async fn reset_then_fill(
        manager: &mut SessionManager,
        id: SessionId,
        server: TcpStream,
    ) -> Vec<Bytes> {
        server.set_linger(Some(Duration::ZERO)).unwrap();
        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let units: Vec<Bytes> = (0..MAX_SEND_PACK_SIZE / 1024)
            .map(|i| block(&vec![i as u8; 1024 - BLOCK_HEADER_SIZE]))
            .collect();
        for unit in &units {
            manager.send(id, unit.clone()).unwrap();
        }
        assert!(matches!(
            manager.send(id, block(b"over")),
            Err(SessionError::Backpressure { .. })
        ));
        units
    }

    async fn read_block(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut rest = vec![0u8; len - 4];
        stream.read_exact(&mut rest).await.unwrap();
        let mut out = header.to_vec();
        out.extend_from_slice(&rest);
        out
    }

    #[tokio::test]
    async fn test_echo_through_run_loop() {
        let mut manager = SessionManager::new();
        let accepter = manager
            .open_accepter(local_accepter(Arc::new(EchoHandler)))
            .await
            .unwrap();
        let port = manager.accepter(accepter).unwrap().listen_port;
        let engine = manager.handle();
        let running = tokio::spawn(manager.run());

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let first = block(b"one");
        let second = block(b"two");
        let mut wire = first.to_vec();
        wire.extend_from_slice(&second);
        client.write_all(&wire).await.unwrap();

        assert_eq!(read_block(&mut client).await, first.to_vec());
        assert_eq!(read_block(&mut client).await, second.to_vec());

        engine.stop().unwrap();
        running.await.unwrap();

        // Engine closed the session on shutdown
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_capacity_admission() {
        let handler = Arc::new(RecordingHandler::default());
        let mut manager = SessionManager::new();
        let accepter = manager
            .open_accepter(local_accepter(handler.clone()).max_sessions(1))
            .await
            .unwrap();
        let port = manager.accepter(accepter).unwrap().listen_port;

        let first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        drive_until(&mut manager, |m| m.session_count() == 1).await;

        let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        drive_until(&mut manager, |m| {
            m.accepter(accepter).unwrap().rejected_capacity == 1
        })
        .await;

        let mut buf = [0u8; 1];
        assert_eq!(second.read(&mut buf).await.unwrap(), 0);

        let stats = manager.accepter(accepter).unwrap();
        assert_eq!(stats.total_accept_count, 2);
        assert_eq!(stats.current_linked, 1);
        assert_eq!(manager.session_count(), 1);

        drop(first);
        drive_until(&mut manager, |m| m.session_count() == 0).await;
        assert_eq!(manager.accepter(accepter).unwrap().current_linked, 0);

        let events = handler.events();
        assert_eq!(events[0], "linked 0");
        assert_eq!(events[1], "closed 0 closed by peer");
    }

    #[tokio::test]
    async fn test_whitelist_admission() {
        let mut manager = SessionManager::new();
        let accepter = manager
            .open_accepter(
                local_accepter(Arc::new(RecordingHandler::default())).whitelist(["10.0.0.1"]),
            )
            .await
            .unwrap();
        let port = manager.accepter(accepter).unwrap().listen_port;

        let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        drive_until(&mut manager, |m| {
            m.accepter(accepter).unwrap().rejected_whitelist == 1
        })
        .await;

        let stats = manager.accepter(accepter).unwrap();
        assert_eq!(stats.total_accept_count, 0);
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatcher_rejection_closes_session() {
        let handler = Arc::new(RecordingHandler::rejecting(b'!'));
        let mut manager = SessionManager::new();
        let accepter = manager
            .open_accepter(local_accepter(handler.clone()))
            .await
            .unwrap();
        let port = manager.accepter(accepter).unwrap().listen_port;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        drive_until(&mut manager, |m| m.session_count() == 1).await;
        client.write_all(&block(b"!bye")).await.unwrap();
        drive_until(&mut manager, |m| m.session_count() == 0).await;

        assert!(handler
            .events()
            .contains(&"closed 0 closed by dispatcher".to_string()));
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_invalidates_id() {
        let handler = Arc::new(RecordingHandler::default());
        let mut manager = SessionManager::new();
        let accepter = manager
            .open_accepter(local_accepter(handler.clone()))
            .await
            .unwrap();
        let port = manager.accepter(accepter).unwrap().listen_port;

        let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        drive_until(&mut manager, |m| m.session_count() == 1).await;
        let id = manager.session_ids()[0];

        manager.close_session(id).unwrap();
        assert!(manager.session(id).is_none());
        assert!(matches!(
            manager.send(id, block(b"late")),
            Err(SessionError::UnknownSession(_))
        ));
        assert!(matches!(
            manager.close_session(id),
            Err(SessionError::UnknownSession(_))
        ));
        assert_eq!(handler.events().last().unwrap(), &format!("closed {} closed locally", id));
        assert_eq!(manager.accepter(accepter).unwrap().current_linked, 0);
    }

    #[tokio::test]
    async fn test_connector_gives_up_after_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handler = Arc::new(RecordingHandler::default());
        let traits = SessionTraits::new(handler.clone())
            .remote("127.0.0.1", port)
            .reconnect(2, Duration::from_millis(10), true);

        let mut manager = SessionManager::new();
        let id = manager.connect(traits).unwrap();
        assert!(id >= SESSION_ID_BOUNDARY);
        assert_eq!(manager.session_state(id), Some(ConnectState::Connecting));

        drive_until(&mut manager, |m| m.session_count() == 0).await;
        let events = handler.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with(&format!("closed {} connect failed", id)));
    }

    #[tokio::test]
    async fn test_connector_reconnects_and_flushes_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handler = Arc::new(RecordingHandler::default());
        let traits = SessionTraits::new(handler.clone())
            .remote("127.0.0.1", port)
            .reconnect(3, Duration::from_millis(20), false);

        let mut manager = SessionManager::new();
        let id = manager.add_connector(traits).unwrap();
        assert_eq!(manager.session_state(id), Some(ConnectState::Disconnected));

        // Queued before the first connection exists
        let hello = block(b"queued");
        manager.send(id, hello.clone()).unwrap();
        manager.open_connector(id).unwrap();

        let server = tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            let received = read_block(&mut first).await;
            drop(first);
            let (second, _) = listener.accept().await.unwrap();
            (received, second)
        });

        drive_until(&mut manager, |m| connect_count(m, id) == Some(2)).await;
        assert_eq!(manager.session_state(id), Some(ConnectState::Connected));

        let (received, _second) = server.await.unwrap();
        assert_eq!(received, hello.to_vec());

        let events = handler.events();
        assert_eq!(events[0], format!("linked {}", id));
        assert!(events[1].starts_with(&format!("disconnected {}", id)));
        assert_eq!(events[2], format!("linked {}", id));
    }

    #[tokio::test]
    async fn test_late_events_ignored_while_reconnecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(RecordingHandler::default());
        let traits = SessionTraits::new(handler.clone())
            .remote("127.0.0.1", port)
            .reconnect(3, Duration::from_secs(60), true);

        let mut manager = SessionManager::new();
        let (id, _server) = connected(&mut manager, &listener, traits).await;
        let old = manager.session(id).unwrap().generation();
        let reset = || EngineEvent::Closed {
            id,
            generation: old,
            reason: CloseReason::Io("reset".into()),
        };

        assert!(manager.process_event(reset()));
        assert_eq!(manager.session_state(id), Some(ConnectState::ReconnectPending));
        assert_ne!(manager.session(id).unwrap().generation(), old);

        // Reader and writer of the dead connection both report it
        assert!(manager.process_event(reset()));
        assert!(manager.process_event(EngineEvent::Data {
            id,
            generation: old,
            data: block(b"stale"),
        }));
        assert!(manager.process_event(EngineEvent::Pulse {
            id,
            generation: old,
        }));

        assert_eq!(manager.session_state(id), Some(ConnectState::ReconnectPending));
        assert!(handler.blocks().is_empty());
        assert_eq!(
            handler.events(),
            vec![
                format!("linked {}", id),
                format!("disconnected {} I/O error: reset", id),
            ]
        );
    }

    #[tokio::test]
    async fn test_unwritten_units_replayed_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(RecordingHandler::default());
        let traits = SessionTraits::new(handler.clone())
            .remote("127.0.0.1", port)
            .reconnect(3, Duration::from_millis(20), false);

        let mut manager = SessionManager::new();
        let (id, first) = connected(&mut manager, &listener, traits).await;
        let units = reset_then_fill(&mut manager, id, first).await;

        let expected = units.len();
        let server = tokio::spawn(async move {
            let (mut second, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            for _ in 0..expected {
                received.push(read_block(&mut second).await);
            }
            (received, second)
        });

        drive_until(&mut manager, |m| connect_count(m, id) == Some(2)).await;
        let (received, _second) = server.await.unwrap();
        let sent: Vec<Vec<u8>> = units.iter().map(|unit| unit.to_vec()).collect();
        assert_eq!(received, sent);

        // The send buffer frees up once the replayed units are written
        let gauge = manager.session(id).unwrap().gauge().clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while gauge.pending() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("send buffer never drained");
        manager.send(id, block(b"more")).unwrap();

        let events = handler.events();
        assert_eq!(events[0], format!("linked {}", id));
        assert!(events[1].starts_with(&format!("disconnected {}", id)));
        assert_eq!(events[2], format!("linked {}", id));
    }

    #[tokio::test]
    async fn test_clean_all_data_discards_on_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(RecordingHandler::default());
        let traits = SessionTraits::new(handler.clone())
            .remote("127.0.0.1", port)
            .reconnect(3, Duration::from_secs(60), true);

        let mut manager = SessionManager::new();
        let (id, server) = connected(&mut manager, &listener, traits).await;
        reset_then_fill(&mut manager, id, server).await;

        drive_until(&mut manager, |m| {
            m.session_state(id) == Some(ConnectState::ReconnectPending)
        })
        .await;
        let session = manager.session(id).unwrap();
        assert_eq!(session.queued_units(), 0);
        assert_eq!(session.gauge().pending(), 0);
        manager.send(id, block(b"next")).unwrap();
        assert_eq!(manager.session(id).unwrap().queued_units(), 1);
    }

    #[tokio::test]
    async fn test_corruption_schedules_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(RecordingHandler::default());
        let traits = SessionTraits::new(handler.clone())
            .remote("127.0.0.1", port)
            .reconnect(3, Duration::from_secs(60), true);

        let mut manager = SessionManager::new();
        let (id, mut server) = connected(&mut manager, &listener, traits).await;

        // Declared length shorter than the block header
        server.write_all(&[0, 0, 0, 2, 0, 1]).await.unwrap();
        drive_until(&mut manager, |m| {
            m.session_state(id) == Some(ConnectState::ReconnectPending)
        })
        .await;

        assert_eq!(manager.session_count(), 1);
        assert_eq!(
            handler.events()[1],
            format!("disconnected {} stream corruption", id)
        );
    }

    #[tokio::test]
    async fn test_no_retries_closes_on_live_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = Arc::new(RecordingHandler::default());
        let traits = SessionTraits::new(handler.clone())
            .remote("127.0.0.1", port)
            .reconnect(0, Duration::from_millis(10), true);

        let mut manager = SessionManager::new();
        let (id, server) = connected(&mut manager, &listener, traits).await;
        drop(server);
        drive_until(&mut manager, |m| m.session_count() == 0).await;

        // Closed without a disconnect notice
        assert_eq!(
            handler.events(),
            vec![
                format!("linked {}", id),
                format!("closed {} closed by peer", id),
            ]
        );
    }

    #[tokio::test]
    async fn test_send_backpressure() {
        let handler = Arc::new(RecordingHandler::default());
        let traits = SessionTraits::new(handler).remote("127.0.0.1", 9);
        let mut manager = SessionManager::new();
        let id = manager.add_connector(traits).unwrap();

        let unit = Bytes::from(vec![0u8; 1024]);
        for _ in 0..MAX_SEND_PACK_SIZE / 1024 {
            manager.send(id, unit.clone()).unwrap();
        }
        assert!(matches!(
            manager.send(id, unit),
            Err(SessionError::Backpressure { .. })
        ));
        assert_eq!(manager.session(id).unwrap().queued_units(), MAX_SEND_PACK_SIZE / 1024);
    }

    #[tokio::test]
    async fn test_connect_via_handle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let manager = SessionManager::new();
        let engine = manager.handle();
        let running = tokio::spawn(manager.run());

        let traits =
            SessionTraits::new(Arc::new(RecordingHandler::default())).remote("127.0.0.1", port);
        let id = engine.connect(traits).await.unwrap();
        assert!(netcore_wire::is_connect_id(id));

        let bad = SessionTraits::new(Arc::new(RecordingHandler::default()));
        assert!(matches!(
            engine.connect(bad).await,
            Err(SessionError::InvalidRemote(_))
        ));

        let (_stream, _) = listener.accept().await.unwrap();
        engine.stop().unwrap();
        running.await.unwrap();
        assert!(matches!(
            engine.close(id),
            Err(SessionError::EngineStopped)
        ));
    }
}
