//! In-memory collaborators for exercising the call core without devices,
//! sockets, or a rendezvous server. Two controllers wired through a
//! [`TestRelayHub`] and a [`TestMesh`] behave like two browsers on the real
//! platform.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time;

use super::media::{
    LocalStream, MediaConstraints, MediaError, MediaErrorKind, MediaRuntime, MediaTrack,
    RemoteStream, TrackKind,
};
use super::noise::{NoiseReducer, ProcessingFailed};
use super::peer::{PeerEndpoint, PeerError, PeerEvent, RegisteredEndpoint, Rendezvous, TransportId};
use super::session::{CallController, SessionDeps};
use super::{CallPhase, SignalEvent, SignalPayload, Signaling};

// ---------------------------------------------------------------------------
// Signaling hub
// ---------------------------------------------------------------------------

/// Routes signaling messages between per-user clients and keeps a log of
/// everything sent.
pub struct TestRelayHub {
    channels: Mutex<HashMap<String, broadcast::Sender<SignalEvent>>>,
    log: Mutex<Vec<(String, String, SignalPayload)>>,
}

impl TestRelayHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    /// A signaling client for `user`, initially connected.
    pub fn client(self: &Arc<Self>, user: &str) -> Arc<TestSignaling> {
        let inbox = self
            .channels
            .lock()
            .unwrap()
            .entry(user.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone();
        let (connected_tx, connected_rx) = watch::channel(true);
        Arc::new(TestSignaling {
            user: user.to_string(),
            hub: self.clone(),
            inbox,
            connected_tx,
            connected_rx,
        })
    }

    fn deliver(&self, from: &str, to: &str, payload: SignalPayload) {
        if let Some(tx) = self.channels.lock().unwrap().get(to) {
            let _ = tx.send(SignalEvent {
                from: from.to_string(),
                payload,
            });
        }
    }

    /// Every message sent through any client: (from, to, payload).
    pub fn sent(&self) -> Vec<(String, String, SignalPayload)> {
        self.log.lock().unwrap().clone()
    }

    pub fn count_offers(&self) -> usize {
        self.sent()
            .iter()
            .filter(|(_, _, p)| matches!(p, SignalPayload::PeerIdOffer { .. }))
            .count()
    }

    /// Poll until a matching message shows up in the log.
    pub async fn wait_for_sent(
        &self,
        from: &str,
        to: &str,
        pred: impl Fn(&SignalPayload) -> bool,
    ) {
        time::timeout(Duration::from_secs(20), async {
            loop {
                let hit = self
                    .sent()
                    .iter()
                    .any(|(f, t, p)| f == from && t == to && pred(p));
                if hit {
                    return;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no matching message from {from} to {to}"));
    }
}

/// One user's connection to the hub.
pub struct TestSignaling {
    user: String,
    hub: Arc<TestRelayHub>,
    inbox: broadcast::Sender<SignalEvent>,
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
}

impl TestSignaling {
    pub fn set_connected(&self, up: bool) {
        let _ = self.connected_tx.send(up);
    }
}

#[async_trait]
impl Signaling for TestSignaling {
    fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    async fn send(&self, to: &str, payload: SignalPayload) -> anyhow::Result<()> {
        if !self.is_connected() {
            bail!("relay not connected");
        }
        self.hub
            .log
            .lock()
            .unwrap()
            .push((self.user.clone(), to.to_string(), payload.clone()));
        self.hub.deliver(&self.user, to, payload);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.inbox.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Rendezvous mesh
// ---------------------------------------------------------------------------

struct PendingDial {
    from: TransportId,
    dialer_kinds: Vec<TrackKind>,
    reply: oneshot::Sender<Result<RemoteStream, PeerError>>,
}

#[derive(Default)]
struct MeshInner {
    endpoints: HashMap<String, mpsc::Sender<PeerEvent>>,
    pending: HashMap<u64, PendingDial>,
    next_dial: u64,
    registrations: usize,
    fail_registration: Option<String>,
    fail_dial: Option<String>,
}

/// In-memory rendezvous service: registered identities can dial each other
/// and exchange streams instantly.
pub struct TestMesh {
    inner: Arc<Mutex<MeshInner>>,
}

impl TestMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(MeshInner::default())),
        })
    }

    pub fn rendezvous(self: &Arc<Self>) -> Arc<dyn Rendezvous> {
        self.clone()
    }

    pub fn registration_count(&self) -> usize {
        self.inner.lock().unwrap().registrations
    }

    /// Make the next registration fail with `message`.
    pub fn fail_next_registration(&self, message: &str) {
        self.inner.lock().unwrap().fail_registration = Some(message.to_string());
    }

    /// Make every dial fail with `message`.
    pub fn fail_dials(&self, message: &str) {
        self.inner.lock().unwrap().fail_dial = Some(message.to_string());
    }
}

#[async_trait]
impl Rendezvous for TestMesh {
    async fn register(&self, id: &TransportId) -> Result<RegisteredEndpoint, PeerError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.fail_registration.take() {
            return Err(PeerError::Registration(message));
        }
        inner.registrations += 1;
        let (tx, rx) = mpsc::channel(8);
        inner.endpoints.insert(id.as_str().to_string(), tx);
        Ok(RegisteredEndpoint {
            endpoint: Arc::new(MeshEndpoint {
                id: id.clone(),
                inner: self.inner.clone(),
            }),
            events: rx,
        })
    }
}

struct MeshEndpoint {
    id: TransportId,
    inner: Arc<Mutex<MeshInner>>,
}

#[async_trait]
impl PeerEndpoint for MeshEndpoint {
    fn id(&self) -> &TransportId {
        &self.id
    }

    async fn dial(
        &self,
        remote: &TransportId,
        local: LocalStream,
    ) -> Result<RemoteStream, PeerError> {
        let reply_rx = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(message) = inner.fail_dial.clone() {
                return Err(PeerError::Dial(message));
            }
            let Some(peer_tx) = inner.endpoints.get(remote.as_str()).cloned() else {
                return Err(PeerError::Dial(format!("no such transport: {remote}")));
            };
            inner.next_dial += 1;
            let dial_id = inner.next_dial;
            let (reply_tx, reply_rx) = oneshot::channel();
            inner.pending.insert(
                dial_id,
                PendingDial {
                    from: self.id.clone(),
                    dialer_kinds: local.kinds(),
                    reply: reply_tx,
                },
            );
            let _ = peer_tx.try_send(PeerEvent::IncomingDial {
                dial_id,
                from: self.id.clone(),
            });
            reply_rx
        };

        match time::timeout(Duration::from_secs(60), reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PeerError::Dial("dial abandoned".into())),
            Err(_) => Err(PeerError::Dial("dial timed out".into())),
        }
    }

    async fn answer(&self, dial_id: u64, local: LocalStream) -> Result<RemoteStream, PeerError> {
        let pending = self
            .inner
            .lock()
            .unwrap()
            .pending
            .remove(&dial_id)
            .ok_or_else(|| PeerError::Answer(format!("unknown dial {dial_id}")))?;

        // Each side receives a stream mirroring the other's track kinds.
        let _ = pending.reply.send(Ok(RemoteStream::new(
            self.id.as_str(),
            local.kinds(),
            None,
        )));
        Ok(RemoteStream::new(
            pending.from.as_str(),
            pending.dialer_kinds,
            None,
        ))
    }

    async fn close(&self) {
        self.inner.lock().unwrap().endpoints.remove(self.id.as_str());
    }
}

// ---------------------------------------------------------------------------
// Media runtime
// ---------------------------------------------------------------------------

/// Capture runtime producing bare tracks, with every created track recorded
/// so teardown behavior can be asserted.
pub struct MockMediaRuntime {
    fail_with: Mutex<Option<MediaErrorKind>>,
    calls: AtomicUsize,
    last: Mutex<Option<MediaConstraints>>,
    tracks: Mutex<Vec<Arc<MediaTrack>>>,
}

impl MockMediaRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_with: Mutex::new(None),
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
        })
    }

    /// A runtime whose every acquisition fails with `kind`.
    pub fn failing(kind: MediaErrorKind) -> Arc<Self> {
        let runtime = Self::new();
        *runtime.fail_with.lock().unwrap() = Some(kind);
        runtime
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_constraints(&self) -> Option<MediaConstraints> {
        self.last.lock().unwrap().clone()
    }

    pub fn created_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks.lock().unwrap().clone()
    }

    /// True when every track this runtime ever handed out has been stopped.
    pub fn all_tracks_stopped(&self) -> bool {
        self.tracks.lock().unwrap().iter().all(|t| t.is_stopped())
    }
}

#[async_trait]
impl MediaRuntime for MockMediaRuntime {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(constraints.clone());

        if let Some(kind) = *self.fail_with.lock().unwrap() {
            return Err(MediaError::new(kind, "mock capture failure"));
        }

        let mut tracks = vec![MediaTrack::new(TrackKind::Audio, "mock mic", None, None)];
        if constraints.video.is_some() {
            tracks.push(MediaTrack::new(TrackKind::Video, "mock camera", None, None));
        }
        self.tracks.lock().unwrap().extend(tracks.iter().cloned());
        Ok(LocalStream::new(tracks))
    }
}

/// Noise reducer that always fails, handing the stream back untouched.
pub struct FailingReducer;

impl NoiseReducer for FailingReducer {
    fn process(&self, stream: LocalStream) -> Result<LocalStream, ProcessingFailed> {
        Err(ProcessingFailed {
            stream,
            source: anyhow::anyhow!("simulated processing failure"),
        })
    }
}

// ---------------------------------------------------------------------------
// Controller harness
// ---------------------------------------------------------------------------

/// One user: a controller wired to the shared hub and mesh.
pub struct TestActor {
    pub controller: CallController,
    pub signaling: Arc<TestSignaling>,
    pub media: Arc<MockMediaRuntime>,
}

impl TestActor {
    pub fn start(hub: &Arc<TestRelayHub>, mesh: &Arc<TestMesh>, user: &str) -> Self {
        Self::start_with_media(hub, mesh, user, MockMediaRuntime::new())
    }

    pub fn start_with_media(
        hub: &Arc<TestRelayHub>,
        mesh: &Arc<TestMesh>,
        user: &str,
        media: Arc<MockMediaRuntime>,
    ) -> Self {
        let signaling = hub.client(user);
        let deps = SessionDeps {
            local_user: user.to_string(),
            signaling: signaling.clone(),
            rendezvous: mesh.rendezvous(),
            media: media.clone(),
            noise: None,
        };
        Self {
            controller: CallController::start(deps),
            signaling,
            media,
        }
    }
}

/// Block until the controller reports `phase`, panicking on timeout.
pub async fn wait_for_phase(controller: &CallController, phase: CallPhase) {
    let mut rx = controller.phase_watch();
    let result = time::timeout(Duration::from_secs(20), async {
        loop {
            let current = *rx.borrow();
            if current == phase {
                return;
            }
            rx.changed().await.expect("controller task alive");
        }
    })
    .await;
    if result.is_err() {
        panic!(
            "phase {:?} not reached (stuck at {:?})",
            phase,
            controller.phase()
        );
    }
}

/// Collect everything currently buffered on an event subscription.
pub fn drain_events(
    rx: &mut broadcast::Receiver<super::session::SessionEvent>,
) -> Vec<super::session::SessionEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}
