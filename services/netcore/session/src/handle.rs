//! Cheap, cloneable references into a running engine.

use bytes::Bytes;
use netcore_wire::{AccepterId, SessionId, MAX_SEND_PACK_SIZE};
use std::net::SocketAddr;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, SessionError};
use crate::manager::EngineEvent;
use crate::traits::SessionTraits;

/// Outbound bytes accepted for a session but not yet written to its socket.
///
/// Shared between every handle of a session and its writer task.
#[derive(Debug, Clone, Default)]
pub struct SendGauge {
    pending: Arc<AtomicUsize>,
}

impl SendGauge {
    /// Empty gauge
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently reserved
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Reserve `len` bytes unless that would exceed [`MAX_SEND_PACK_SIZE`]
    pub fn try_reserve(&self, len: usize) -> Result<()> {
        if len > MAX_SEND_PACK_SIZE {
            return Err(SessionError::OversizedBlock(len));
        }
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                let total = pending + len;
                (total <= MAX_SEND_PACK_SIZE).then_some(total)
            })
            .map(|_| ())
            .map_err(|pending| SessionError::Backpressure {
                pending,
                requested: len,
            })
    }

    /// Reserve unconditionally (engine-generated replies)
    pub fn force_reserve(&self, len: usize) {
        self.pending.fetch_add(len, Ordering::AcqRel);
    }

    /// Release bytes once written
    pub fn release(&self, len: usize) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                Some(pending.saturating_sub(len))
            });
    }

    /// Drop every reservation
    pub fn reset(&self) {
        self.pending.store(0, Ordering::Release);
    }

    /// Accounting for the units handed to one connection's writer
    pub(crate) fn connection(&self) -> InFlight {
        InFlight {
            gauge: self.clone(),
            units: Arc::new(Mutex::new(Some(VecDeque::new()))),
        }
    }
}

/// Units handed to one connection's writer and not yet written, in order.
///
/// The writer releases each unit's bytes after writing it. Retiring the
/// connection hands the unwritten units back to the session, which either
/// queues them for the next connection or discards them. Once retired,
/// late activity from the old writer is ignored, so it never touches the
/// accounting of the next connection.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    gauge: SendGauge,
    units: Arc<Mutex<Option<VecDeque<Bytes>>>>,
}

impl InFlight {
    fn units(&self) -> MutexGuard<'_, Option<VecDeque<Bytes>>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a reserved plaintext unit; `false` once retired
    pub(crate) fn hand_off(&self, unit: Bytes) -> bool {
        match self.units().as_mut() {
            Some(units) => {
                units.push_back(unit);
                true
            }
            None => false,
        }
    }

    /// Oldest unit reached the socket
    pub(crate) fn written(&self) {
        let unit = self.units().as_mut().and_then(VecDeque::pop_front);
        if let Some(unit) = unit {
            self.gauge.release(unit.len());
        }
    }

    /// End the connection and take back every unit not yet written.
    ///
    /// Their bytes stay reserved on the gauge.
    pub(crate) fn retire(&self) -> VecDeque<Bytes> {
        self.units().take().unwrap_or_default()
    }

    /// Bytes currently held
    pub(crate) fn held(&self) -> usize {
        self.units()
            .as_ref()
            .map(|units| units.iter().map(Bytes::len).sum())
            .unwrap_or(0)
    }
}

/// Command channel into the engine task
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    pub(crate) fn post(&self, event: EngineEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| SessionError::EngineStopped)
    }

    /// Queue bytes for a session without send-buffer accounting.
    ///
    /// Prefer [`SessionHandle::send`], which enforces the buffer bound.
    pub fn send_unbounded(&self, id: SessionId, data: Bytes) -> Result<()> {
        self.post(EngineEvent::Send { id, data })
    }

    /// Close a session; its id is invalid once the engine processes this
    pub fn close(&self, id: SessionId) -> Result<()> {
        self.post(EngineEvent::Close { id })
    }

    /// Stop an accepter
    pub fn close_accepter(&self, id: AccepterId) -> Result<()> {
        self.post(EngineEvent::CloseAccepter { id })
    }

    /// Create and start an outbound session, returning its id
    pub async fn connect(&self, traits: SessionTraits) -> Result<SessionId> {
        let (reply, rx) = oneshot::channel();
        self.post(EngineEvent::Connect { traits, reply })?;
        rx.await.map_err(|_| SessionError::EngineStopped)?
    }

    /// Ask the engine loop to close everything and return
    pub fn stop(&self) -> Result<()> {
        self.post(EngineEvent::Stop)
    }
}

/// Reference to one session, handed to handlers and usable from any task
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: Option<SocketAddr>,
    gauge: SendGauge,
    engine: EngineHandle,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        peer: Option<SocketAddr>,
        gauge: SendGauge,
        engine: EngineHandle,
    ) -> Self {
        Self {
            id,
            peer,
            gauge,
            engine,
        }
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address of the current connection, if any
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Bytes accepted but not yet written
    pub fn pending_bytes(&self) -> usize {
        self.gauge.pending()
    }

    /// Queue one outbound unit.
    ///
    /// Fails with [`SessionError::Backpressure`] when the send buffer is
    /// full; nothing is queued in that case.
    pub fn send(&self, data: Bytes) -> Result<()> {
        let len = data.len();
        self.gauge.try_reserve(len)?;
        if let Err(e) = self.engine.send_unbounded(self.id, data) {
            self.gauge.release(len);
            return Err(e);
        }
        Ok(())
    }

    /// Close this session
    pub fn close(&self) -> Result<()> {
        self.engine.close(self.id)
    }

    /// Engine this session belongs to
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }
}
