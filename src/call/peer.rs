//! Peer connection management — transport identities and the rendezvous
//! service boundary.
//!
//! One [`PeerConnectionManager`] lives for exactly one call attempt. It
//! registers a fresh transport identity, answers inbound dials with the held
//! local stream, and (receiver role only) places the single outbound dial
//! after a short grace delay so the caller's identity has time to finish
//! registering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use super::media::{LocalStream, RemoteStream};

/// Wait before the receiver dials the caller's transport identity.
pub const DIAL_GRACE: Duration = Duration::from_millis(1000);

static ATTEMPT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Address under which the rendezvous service can locate this process for a
/// single call attempt. Never reused across attempts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportId(String);

impl TransportId {
    /// Mint a fresh identity: participant id, wall-clock millis, and a
    /// per-process sequence number so two attempts in the same millisecond
    /// still differ.
    pub fn new_for_attempt(participant: &str) -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let seq = ATTEMPT_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("{participant}-{millis}-{seq}"))
    }

    pub fn from_wire(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Error)]
pub enum PeerError {
    #[error("transport registration failed: {0}")]
    Registration(String),
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("answer failed: {0}")]
    Answer(String),
    #[error("inbound dial arrived before local media was ready")]
    NoLocalStream,
    #[error("peer connection closed: {0}")]
    Closed(String),
}

/// Events reported by a registered endpoint.
#[derive(Debug)]
pub enum PeerEvent {
    /// The rendezvous service reports a dial addressed to our identity.
    IncomingDial { dial_id: u64, from: TransportId },
    /// The connection closed for any reason. No reconnection is attempted.
    Closed { reason: String },
    Error(PeerError),
}

/// A transport identity registered and confirmed live by the rendezvous
/// service.
pub struct RegisteredEndpoint {
    pub endpoint: Arc<dyn PeerEndpoint>,
    pub events: mpsc::Receiver<PeerEvent>,
}

/// Rendezvous service boundary: registers identities and brokers dials.
/// NAT traversal and media transport are entirely its concern.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Register `id` as reachable. Resolves only once the service confirms
    /// the identity is live; rejects if registration errors.
    async fn register(&self, id: &TransportId) -> Result<RegisteredEndpoint, PeerError>;
}

/// One registered identity's connection surface.
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    fn id(&self) -> &TransportId;

    /// Place the outbound dial and wait for the negotiated remote stream.
    async fn dial(
        &self,
        remote: &TransportId,
        local: LocalStream,
    ) -> Result<RemoteStream, PeerError>;

    /// Answer an inbound dial with the local stream.
    async fn answer(&self, dial_id: u64, local: LocalStream) -> Result<RemoteStream, PeerError>;

    /// Deregister and drop the connection. Idempotent.
    async fn close(&self);
}

/// Owns the single peer transport of one call attempt.
pub struct PeerConnectionManager {
    rendezvous: Arc<dyn Rendezvous>,
    endpoint: Mutex<Option<Arc<dyn PeerEndpoint>>>,
}

impl PeerConnectionManager {
    pub fn new(rendezvous: Arc<dyn Rendezvous>) -> Self {
        Self {
            rendezvous,
            endpoint: Mutex::new(None),
        }
    }

    /// Register `id` with the rendezvous service. Idempotent within the
    /// attempt: a second call returns the existing endpoint and no new event
    /// stream.
    pub async fn create_transport(
        &self,
        id: &TransportId,
    ) -> Result<(Arc<dyn PeerEndpoint>, Option<mpsc::Receiver<PeerEvent>>), PeerError> {
        let mut slot = self.endpoint.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Ok((existing.clone(), None));
        }

        let registered = self.rendezvous.register(id).await?;
        *slot = Some(registered.endpoint.clone());
        tracing::info!("Transport identity {} registered", id);
        Ok((registered.endpoint, Some(registered.events)))
    }

    /// Receiver role only: dial the caller's transport identity after the
    /// grace delay.
    pub async fn dial(
        &self,
        remote: &TransportId,
        local: LocalStream,
    ) -> Result<RemoteStream, PeerError> {
        let endpoint = self
            .endpoint
            .lock()
            .await
            .clone()
            .ok_or_else(|| PeerError::Dial("no registered transport".into()))?;

        // The caller may still be registering its identity; dialing too early
        // fails rendezvous lookup.
        tokio::time::sleep(DIAL_GRACE).await;

        tracing::info!("Dialing {}", remote);
        endpoint.dial(remote, local).await
    }

    /// Answer an inbound dial with the held local stream. A missing stream is
    /// a protocol-ordering violation and is reported as an error rather than
    /// left hanging.
    pub async fn answer(
        &self,
        dial_id: u64,
        local: Option<LocalStream>,
    ) -> Result<RemoteStream, PeerError> {
        let endpoint = self
            .endpoint
            .lock()
            .await
            .clone()
            .ok_or_else(|| PeerError::Answer("no registered transport".into()))?;
        let local = local.ok_or(PeerError::NoLocalStream)?;

        tracing::info!("Answering inbound dial {}", dial_id);
        endpoint.answer(dial_id, local).await
    }

    /// Close and forget the endpoint. Safe to call repeatedly.
    pub async fn close(&self) {
        if let Some(endpoint) = self.endpoint.lock().await.take() {
            endpoint.close().await;
        }
    }
}
