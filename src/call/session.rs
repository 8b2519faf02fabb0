//! Call session controller — the per-process call state machine.
//!
//! Exactly one call session may exist at a time. The controller owns the
//! local/remote streams and the peer transport for the active attempt,
//! coordinates signaling with the counterpart, and guarantees that every
//! exit path — hangup, decline, timeout, device failure, dropped peer
//! connection — releases all capture hardware and lands back in `Idle`.
//!
//! The two ends of a call are two independent controller instances that only
//! ever talk through the signaling relay; nothing here assumes shared state
//! with the counterpart.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Sleep};

use super::media::{
    acquire_media, LocalStream, MediaError, MediaRuntime, RemoteFrame, RemoteStream, TrackKind,
};
use super::noise::NoiseReducer;
use super::peer::{PeerConnectionManager, PeerEvent, Rendezvous, TransportId};
use super::{CallPhase, CallType, SignalEvent, SignalPayload, Signaling};

/// How long an unanswered ring may last, on either role.
pub const RING_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval while waiting for the relay to come back before sending the
/// transport-id offer.
const OFFER_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Total window for delivering the transport-id offer.
const OFFER_RETRY_WINDOW: Duration = Duration::from_secs(5);

/// How long the receiver waits for the caller's transport id after accepting.
const REMOTE_ID_WAIT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Errors surfaced to the caller of controller operations. Every one of
/// these leaves the controller in a consistent state with no hardware held.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("cannot start a call right now: the relay is not connected")]
    SignalingUnavailable,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("call setup failed: {0}")]
    Negotiation(String),
    #[error("{op} is not valid while {phase:?}")]
    InvalidState {
        op: &'static str,
        phase: CallPhase,
    },
    #[error("call controller is shut down")]
    Disposed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    LocalDeclined,
    RemoteHangup,
    RemoteDeclined,
    RingTimeout,
    /// A classified error already went out as [`SessionEvent::Failed`].
    Failed,
    /// The established peer connection dropped.
    ConnectionLost,
}

impl EndReason {
    /// Reason string carried in the outbound `CallEnded` message, when one
    /// is sent for this teardown.
    fn wire_reason(self) -> Option<String> {
        match self {
            EndReason::Failed => Some("error".into()),
            EndReason::RingTimeout => Some("timeout".into()),
            _ => None,
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndReason::LocalHangup => "hung up",
            EndReason::LocalDeclined => "declined",
            EndReason::RemoteHangup => "remote hung up",
            EndReason::RemoteDeclined => "remote declined",
            EndReason::RingTimeout => "no answer",
            EndReason::Failed => "failed",
            EndReason::ConnectionLost => "connection lost",
        };
        f.write_str(s)
    }
}

/// Notifications for the UI layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    IncomingCall { from: String, call_type: CallType },
    OutgoingCall { to: String, call_type: CallType },
    RemoteAccepted,
    Connected,
    Failed { error: CallError },
    Ended { reason: EndReason },
}

/// Collaborators injected into the controller.
#[derive(Clone)]
pub struct SessionDeps {
    pub local_user: String,
    pub signaling: Arc<dyn Signaling>,
    pub rendezvous: Arc<dyn Rendezvous>,
    pub media: Arc<dyn MediaRuntime>,
    pub noise: Option<Arc<dyn NoiseReducer>>,
}

/// Point-in-time view of the controller, for status display and tests.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub phase: CallPhase,
    pub remote_user: Option<String>,
    pub call_type: Option<CallType>,
    pub remote_transport_id: Option<String>,
    pub has_local_stream: bool,
    pub has_remote_stream: bool,
}

/// Handle to the session controller task. Dropping the handle tears down any
/// active session and stops the task.
pub struct CallController {
    cmd_tx: mpsc::Sender<Command>,
    phase_rx: watch::Receiver<CallPhase>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl CallController {
    /// Spawn the controller task: subscribes to signaling and starts the
    /// event loop in `Idle`.
    pub fn start(deps: SessionDeps) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (phase_tx, phase_rx) = watch::channel(CallPhase::Idle);
        let (events_tx, _) = broadcast::channel(32);
        let (setup_tx, setup_rx) = mpsc::channel(16);
        let signal_rx = deps.signaling.subscribe();

        let state = LoopState {
            deps,
            phase_tx,
            events_tx: events_tx.clone(),
            setup_tx,
            session: None,
            next_attempt: 0,
        };
        tokio::spawn(run_loop(state, cmd_rx, signal_rx, setup_rx));

        Self {
            cmd_tx,
            phase_rx,
            events_tx,
        }
    }

    pub fn phase(&self) -> CallPhase {
        *self.phase_rx.borrow()
    }

    pub fn phase_watch(&self) -> watch::Receiver<CallPhase> {
        self.phase_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Ring `remote`. Valid only while `Idle`; refused (with a log) when the
    /// relay is down. Media is not touched yet — capture starts only once the
    /// counterpart accepts.
    pub async fn initiate(&self, remote: &str, call_type: CallType) -> Result<(), CallError> {
        self.request(|reply| Command::Initiate {
            remote: remote.to_string(),
            call_type,
            reply,
        })
        .await
    }

    /// Accept the currently ringing incoming call.
    pub async fn accept_incoming_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    /// Decline the currently ringing incoming call.
    pub async fn reject_incoming_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    /// Hang up / cancel. Valid from any state and idempotent: calling it
    /// twice, or while `Idle`, does nothing and never fails.
    pub async fn end_call(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::End { ack: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Enable/disable (or flip, with `None`) the microphone tracks.
    pub async fn toggle_mic(&self, enabled: Option<bool>) -> Result<(), CallError> {
        self.request(|reply| Command::Toggle {
            kind: TrackKind::Audio,
            enabled,
            reply,
        })
        .await
    }

    /// Enable/disable (or flip, with `None`) the camera tracks. No-op on an
    /// audio-only call.
    pub async fn toggle_camera(&self, enabled: Option<bool>) -> Result<(), CallError> {
        self.request(|reply| Command::Toggle {
            kind: TrackKind::Video,
            enabled,
            reply,
        })
        .await
    }

    /// Take the remote stream's frame channel for playback. `None` until
    /// `InCall`, or once already taken.
    pub async fn remote_frames(&self) -> Option<mpsc::Receiver<RemoteFrame>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RemoteFrames { reply: tx })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot { reply: tx })
            .await
            .map_err(|_| CallError::Disposed)?;
        rx.await.map_err(|_| CallError::Disposed)
    }

    /// Tear down any active session and stop the controller task.
    pub async fn dispose(self) {
        let _ = self.cmd_tx.send(Command::Dispose).await;
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), CallError>>) -> Command,
    ) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| CallError::Disposed)?;
        rx.await.map_err(|_| CallError::Disposed)?
    }
}

// ---------------------------------------------------------------------------
// Event loop internals
// ---------------------------------------------------------------------------

enum Command {
    Initiate {
        remote: String,
        call_type: CallType,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        ack: oneshot::Sender<()>,
    },
    Toggle {
        kind: TrackKind,
        enabled: Option<bool>,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    RemoteFrames {
        reply: oneshot::Sender<Option<mpsc::Receiver<RemoteFrame>>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Dispose,
}

/// Progress reports from the per-attempt setup tasks. Every event carries
/// the attempt id so results from a cancelled attempt can be reclaimed
/// instead of corrupting a newer session.
enum SetupEvent {
    MediaReady {
        attempt: u64,
        stream: LocalStream,
    },
    TransportUp {
        attempt: u64,
        events: mpsc::Receiver<PeerEvent>,
    },
    Connected {
        attempt: u64,
        remote: RemoteStream,
    },
    Failed {
        attempt: u64,
        error: CallError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Receiver,
}

struct ActiveSession {
    attempt: u64,
    role: Role,
    call_type: CallType,
    remote_user: String,
    local_tid: TransportId,
    remote_tid: Option<TransportId>,
    /// Receiver side: feeds the caller's transport id to the setup task.
    remote_tid_tx: watch::Sender<Option<TransportId>>,
    local_stream: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    pcm: Arc<PeerConnectionManager>,
    /// Checked by setup tasks between suspension points.
    cancelled: Arc<AtomicBool>,
}

struct LoopState {
    deps: SessionDeps,
    phase_tx: watch::Sender<CallPhase>,
    events_tx: broadcast::Sender<SessionEvent>,
    setup_tx: mpsc::Sender<SetupEvent>,
    session: Option<ActiveSession>,
    next_attempt: u64,
}

type RingDeadline = Option<Pin<Box<Sleep>>>;
type PeerEvents = Option<mpsc::Receiver<PeerEvent>>;

async fn run_loop(
    mut state: LoopState,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut signal_rx: broadcast::Receiver<SignalEvent>,
    mut setup_rx: mpsc::Receiver<SetupEvent>,
) {
    let mut peer_rx: PeerEvents = None;
    let mut ring: RingDeadline = None;
    let mut signaling_gone = false;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        if state.handle_command(cmd, &mut peer_rx, &mut ring).await {
                            break;
                        }
                    }
                    None => {
                        // Handle dropped: unwind and exit.
                        state.teardown(EndReason::LocalHangup, true, &mut peer_rx, &mut ring).await;
                        break;
                    }
                }
            }
            sig = signal_rx.recv(), if !signaling_gone => {
                match sig {
                    Ok(ev) => state.handle_signal(ev, &mut peer_rx, &mut ring).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Signaling subscriber lagged, {} events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("Signaling event stream closed");
                        signaling_gone = true;
                    }
                }
            }
            Some(ev) = setup_rx.recv() => {
                state.handle_setup(ev, &mut peer_rx, &mut ring).await;
            }
            ev = peer_event_or_pending(&mut peer_rx) => {
                state.handle_peer_event(ev, &mut peer_rx, &mut ring).await;
            }
            _ = ring_or_pending(&mut ring) => {
                state.handle_ring_timeout(&mut peer_rx, &mut ring).await;
            }
        }
    }
}

async fn peer_event_or_pending(rx: &mut PeerEvents) -> PeerEvent {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(ev) => ev,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn ring_or_pending(deadline: &mut RingDeadline) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

impl LoopState {
    fn phase(&self) -> CallPhase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&self, phase: CallPhase) {
        let _ = self.phase_tx.send(phase);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Returns true when the loop should exit.
    async fn handle_command(
        &mut self,
        cmd: Command,
        peer_rx: &mut PeerEvents,
        ring: &mut RingDeadline,
    ) -> bool {
        match cmd {
            Command::Initiate {
                remote,
                call_type,
                reply,
            } => {
                let _ = reply.send(self.start_outgoing(remote, call_type, ring).await);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept_incoming(ring).await);
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.reject_incoming(peer_rx, ring).await);
            }
            Command::End { ack } => {
                self.teardown(EndReason::LocalHangup, true, peer_rx, ring).await;
                let _ = ack.send(());
            }
            Command::Toggle {
                kind,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.toggle_track(kind, enabled));
            }
            Command::RemoteFrames { reply } => {
                let frames = self
                    .session
                    .as_ref()
                    .and_then(|s| s.remote_stream.as_ref())
                    .and_then(|r| r.take_frames());
                let _ = reply.send(frames);
            }
            Command::Snapshot { reply } => {
                let s = self.session.as_ref();
                let _ = reply.send(SessionSnapshot {
                    phase: self.phase(),
                    remote_user: s.map(|s| s.remote_user.clone()),
                    call_type: s.map(|s| s.call_type),
                    remote_transport_id: s
                        .and_then(|s| s.remote_tid.as_ref())
                        .map(|t| t.as_str().to_string()),
                    has_local_stream: s.map_or(false, |s| s.local_stream.is_some()),
                    has_remote_stream: s.map_or(false, |s| s.remote_stream.is_some()),
                });
            }
            Command::Dispose => {
                self.teardown(EndReason::LocalHangup, true, peer_rx, ring).await;
                return true;
            }
        }
        false
    }

    async fn start_outgoing(
        &mut self,
        remote: String,
        call_type: CallType,
        ring: &mut RingDeadline,
    ) -> Result<(), CallError> {
        if self.session.is_some() || self.phase() != CallPhase::Idle {
            return Err(CallError::InvalidState {
                op: "initiate",
                phase: self.phase(),
            });
        }
        if !self.deps.signaling.is_connected() {
            tracing::warn!("Cannot call {}: relay not connected", remote);
            return Err(CallError::SignalingUnavailable);
        }

        if let Err(e) = self
            .deps
            .signaling
            .send(&remote, SignalPayload::CallRequest { call_type })
            .await
        {
            tracing::warn!("Call request to {} not delivered: {:#}", remote, e);
            return Err(CallError::SignalingUnavailable);
        }

        self.session = Some(self.new_session(Role::Caller, remote.clone(), call_type));
        self.set_phase(CallPhase::RingingAsCaller);
        *ring = Some(Box::pin(time::sleep(RING_TIMEOUT)));
        self.emit(SessionEvent::OutgoingCall {
            to: remote,
            call_type,
        });
        Ok(())
    }

    async fn accept_incoming(&mut self, ring: &mut RingDeadline) -> Result<(), CallError> {
        if self.phase() != CallPhase::RingingAsReceiver {
            return Err(CallError::InvalidState {
                op: "accept",
                phase: self.phase(),
            });
        }
        let session = self.session.as_ref().expect("ringing implies session");

        if let Err(e) = self
            .deps
            .signaling
            .send(
                &session.remote_user,
                SignalPayload::CallAnswer { accepted: true },
            )
            .await
        {
            // Stay ringing; the user can retry or decline.
            tracing::warn!("Accept not delivered: {:#}", e);
            return Err(CallError::SignalingUnavailable);
        }

        *ring = None;
        self.set_phase(CallPhase::ConnectingAsReceiver);
        self.spawn_receiver_setup();
        Ok(())
    }

    async fn reject_incoming(
        &mut self,
        peer_rx: &mut PeerEvents,
        ring: &mut RingDeadline,
    ) -> Result<(), CallError> {
        if self.phase() != CallPhase::RingingAsReceiver {
            return Err(CallError::InvalidState {
                op: "reject",
                phase: self.phase(),
            });
        }
        let session = self.session.as_ref().expect("ringing implies session");

        if let Err(e) = self
            .deps
            .signaling
            .send(
                &session.remote_user,
                SignalPayload::CallAnswer { accepted: false },
            )
            .await
        {
            tracing::warn!("Decline not delivered: {:#}", e);
        }

        self.teardown(EndReason::LocalDeclined, false, peer_rx, ring).await;
        Ok(())
    }

    fn toggle_track(&mut self, kind: TrackKind, enabled: Option<bool>) -> Result<(), CallError> {
        let phase = self.phase();
        if !matches!(
            phase,
            CallPhase::InCall | CallPhase::ConnectingAsCaller | CallPhase::ConnectingAsReceiver
        ) {
            return Err(CallError::InvalidState {
                op: "toggle",
                phase,
            });
        }

        let Some(stream) = self.session.as_ref().and_then(|s| s.local_stream.as_ref()) else {
            // Connecting but capture hasn't finished — nothing to flip yet.
            tracing::debug!("Toggle before local media is ready — ignored");
            return Ok(());
        };

        if !stream.set_enabled(kind, enabled) {
            tracing::debug!("No {:?} track on this call — toggle ignored", kind);
        }
        Ok(())
    }

    async fn handle_signal(
        &mut self,
        ev: SignalEvent,
        peer_rx: &mut PeerEvents,
        ring: &mut RingDeadline,
    ) {
        match ev.payload {
            SignalPayload::CallRequest { call_type } => {
                self.on_call_request(ev.from, call_type, ring);
            }
            SignalPayload::PeerIdOffer { transport_id, .. } => {
                let Some(session) = self.session.as_mut() else {
                    tracing::debug!("Transport id from {} with no session — ignored", ev.from);
                    return;
                };
                if session.remote_user != ev.from {
                    tracing::debug!("Transport id from unexpected sender {} — ignored", ev.from);
                    return;
                }
                let tid = TransportId::from_wire(transport_id);
                tracing::info!("Counterpart transport id: {}", tid);
                session.remote_tid = Some(tid.clone());
                // send_replace: the value must stick even when the setup task
                // has not subscribed yet.
                session.remote_tid_tx.send_replace(Some(tid));
            }
            SignalPayload::CallAnswer { accepted } => {
                let relevant = self
                    .session
                    .as_ref()
                    .map(|s| s.remote_user == ev.from && self.phase() == CallPhase::RingingAsCaller)
                    .unwrap_or(false);
                if !relevant {
                    tracing::debug!("Stray call answer from {} — ignored", ev.from);
                    return;
                }
                if accepted {
                    *ring = None;
                    self.set_phase(CallPhase::ConnectingAsCaller);
                    self.emit(SessionEvent::RemoteAccepted);
                    self.spawn_caller_setup();
                } else {
                    self.teardown(EndReason::RemoteDeclined, false, peer_rx, ring).await;
                }
            }
            SignalPayload::CallEnded { reason } => {
                let relevant = self
                    .session
                    .as_ref()
                    .map(|s| s.remote_user == ev.from)
                    .unwrap_or(false);
                if !relevant {
                    tracing::debug!("Stray call-ended from {} — ignored", ev.from);
                    return;
                }
                tracing::info!(
                    "Call ended by {} ({})",
                    ev.from,
                    reason.as_deref().unwrap_or("hangup")
                );
                self.teardown(EndReason::RemoteHangup, false, peer_rx, ring).await;
            }
        }
    }

    fn on_call_request(&mut self, from: String, call_type: CallType, ring: &mut RingDeadline) {
        if let Some(session) = self.session.as_ref() {
            if session.remote_user == from && self.phase() == CallPhase::RingingAsReceiver {
                tracing::debug!("Duplicate ring from {} — ignored", from);
                return;
            }
            // One session at a time: answer the second caller with a decline.
            tracing::info!("Busy — auto-declining call from {}", from);
            let signaling = self.deps.signaling.clone();
            tokio::spawn(async move {
                if let Err(e) = signaling
                    .send(&from, SignalPayload::CallAnswer { accepted: false })
                    .await
                {
                    tracing::debug!("Busy decline to {} not delivered: {:#}", from, e);
                }
            });
            return;
        }

        self.session = Some(self.new_session(Role::Receiver, from.clone(), call_type));
        self.set_phase(CallPhase::RingingAsReceiver);
        *ring = Some(Box::pin(time::sleep(RING_TIMEOUT)));
        self.emit(SessionEvent::IncomingCall { from, call_type });
    }

    async fn handle_setup(
        &mut self,
        ev: SetupEvent,
        peer_rx: &mut PeerEvents,
        ring: &mut RingDeadline,
    ) {
        let current = self.session.as_ref().map(|s| s.attempt);
        match ev {
            SetupEvent::MediaReady { attempt, stream } => {
                if current != Some(attempt) {
                    // Attempt was cancelled while capture was in flight:
                    // release the hardware right here.
                    stream.stop_all();
                    return;
                }
                self.session.as_mut().unwrap().local_stream = Some(stream);
            }
            SetupEvent::TransportUp { attempt, events } => {
                if current != Some(attempt) {
                    return;
                }
                *peer_rx = Some(events);
            }
            SetupEvent::Connected { attempt, remote } => {
                if current != Some(attempt) {
                    remote.stop();
                    return;
                }
                tracing::info!("Call media connected ({})", remote.id());
                self.session.as_mut().unwrap().remote_stream = Some(remote);
                self.set_phase(CallPhase::InCall);
                self.emit(SessionEvent::Connected);
            }
            SetupEvent::Failed { attempt, error } => {
                if current != Some(attempt) {
                    tracing::debug!("Stale setup failure ignored: {}", error);
                    return;
                }
                tracing::warn!("Call setup failed: {}", error);
                self.emit(SessionEvent::Failed { error });
                self.teardown(EndReason::Failed, true, peer_rx, ring).await;
            }
        }
    }

    async fn handle_peer_event(
        &mut self,
        ev: PeerEvent,
        peer_rx: &mut PeerEvents,
        ring: &mut RingDeadline,
    ) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        match ev {
            PeerEvent::IncomingDial { dial_id, from } => {
                tracing::info!("Inbound dial {} from {}", dial_id, from);
                // Answer with whatever local media we hold; a missing stream
                // is reported as a setup failure by the manager.
                let pcm = session.pcm.clone();
                let local = session.local_stream.clone();
                let attempt = session.attempt;
                let setup_tx = self.setup_tx.clone();
                tokio::spawn(async move {
                    let ev = match pcm.answer(dial_id, local).await {
                        Ok(remote) => SetupEvent::Connected { attempt, remote },
                        Err(e) => SetupEvent::Failed {
                            attempt,
                            error: CallError::Negotiation(e.to_string()),
                        },
                    };
                    let _ = setup_tx.send(ev).await;
                });
            }
            PeerEvent::Closed { reason } => {
                if self.phase() == CallPhase::InCall {
                    tracing::info!("Peer connection closed: {}", reason);
                    self.teardown(EndReason::ConnectionLost, false, peer_rx, ring).await;
                } else {
                    let error = CallError::Negotiation(reason);
                    self.emit(SessionEvent::Failed {
                        error: error.clone(),
                    });
                    tracing::warn!("Peer connection lost during setup: {}", error);
                    self.teardown(EndReason::Failed, true, peer_rx, ring).await;
                }
            }
            PeerEvent::Error(e) => {
                if self.phase() == CallPhase::InCall {
                    tracing::warn!("Peer connection error: {}", e);
                    self.teardown(EndReason::ConnectionLost, false, peer_rx, ring).await;
                } else {
                    let error = CallError::Negotiation(e.to_string());
                    self.emit(SessionEvent::Failed {
                        error: error.clone(),
                    });
                    self.teardown(EndReason::Failed, true, peer_rx, ring).await;
                }
            }
        }
    }

    async fn handle_ring_timeout(&mut self, peer_rx: &mut PeerEvents, ring: &mut RingDeadline) {
        *ring = None;
        match self.phase() {
            CallPhase::RingingAsCaller => {
                tracing::info!("Outgoing call timed out");
                if let Some(session) = self.session.as_ref() {
                    let signaling = self.deps.signaling.clone();
                    let to = session.remote_user.clone();
                    tokio::spawn(async move {
                        let _ = signaling
                            .send(
                                &to,
                                SignalPayload::CallEnded {
                                    reason: Some("timeout".into()),
                                },
                            )
                            .await;
                    });
                }
                self.teardown(EndReason::RingTimeout, false, peer_rx, ring).await;
            }
            CallPhase::RingingAsReceiver => {
                tracing::info!("Incoming call timed out");
                self.teardown(EndReason::RingTimeout, false, peer_rx, ring).await;
            }
            _ => {}
        }
    }

    fn new_session(&mut self, role: Role, remote_user: String, call_type: CallType) -> ActiveSession {
        self.next_attempt += 1;
        let (remote_tid_tx, _) = watch::channel(None);
        ActiveSession {
            attempt: self.next_attempt,
            role,
            call_type,
            remote_user,
            // Fresh per attempt, before any media is requested.
            local_tid: TransportId::new_for_attempt(&self.deps.local_user),
            remote_tid: None,
            remote_tid_tx,
            local_stream: None,
            remote_stream: None,
            pcm: Arc::new(PeerConnectionManager::new(self.deps.rendezvous.clone())),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawn_caller_setup(&self) {
        let session = self.session.as_ref().expect("connecting implies session");
        let attempt = session.attempt;
        let cancelled = session.cancelled.clone();
        let pcm = session.pcm.clone();
        let local_tid = session.local_tid.clone();
        let remote_user = session.remote_user.clone();
        let call_type = session.call_type;
        let setup_tx = self.setup_tx.clone();
        let signaling = self.deps.signaling.clone();
        let media = self.deps.media.clone();
        let noise = self.deps.noise.clone();

        tokio::spawn(async move {
            let stream = match acquire_media(media.as_ref(), noise.as_deref(), call_type).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = setup_tx
                        .send(SetupEvent::Failed {
                            attempt,
                            error: CallError::Media(e),
                        })
                        .await;
                    return;
                }
            };
            if cancelled.load(Ordering::SeqCst) {
                stream.stop_all();
                return;
            }
            let _ = setup_tx
                .send(SetupEvent::MediaReady {
                    attempt,
                    stream: stream.clone(),
                })
                .await;

            let events = match pcm.create_transport(&local_tid).await {
                Ok((_endpoint, events)) => events,
                Err(e) => {
                    let _ = setup_tx
                        .send(SetupEvent::Failed {
                            attempt,
                            error: CallError::Negotiation(e.to_string()),
                        })
                        .await;
                    return;
                }
            };
            if cancelled.load(Ordering::SeqCst) {
                pcm.close().await;
                return;
            }
            if let Some(events) = events {
                let _ = setup_tx.send(SetupEvent::TransportUp { attempt, events }).await;
            }

            // The caller never dials out: once the offer lands, the receiver
            // dials us and the connection completes through `answer`.
            if let Err(error) =
                send_offer_when_ready(signaling.as_ref(), &remote_user, &local_tid, call_type).await
            {
                let _ = setup_tx.send(SetupEvent::Failed { attempt, error }).await;
            }
        });
    }

    fn spawn_receiver_setup(&self) {
        let session = self.session.as_ref().expect("connecting implies session");
        let attempt = session.attempt;
        let cancelled = session.cancelled.clone();
        let pcm = session.pcm.clone();
        let local_tid = session.local_tid.clone();
        let call_type = session.call_type;
        let setup_tx = self.setup_tx.clone();
        let media = self.deps.media.clone();
        let noise = self.deps.noise.clone();
        let mut remote_tid_rx = session.remote_tid_tx.subscribe();

        tokio::spawn(async move {
            let stream = match acquire_media(media.as_ref(), noise.as_deref(), call_type).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = setup_tx
                        .send(SetupEvent::Failed {
                            attempt,
                            error: CallError::Media(e),
                        })
                        .await;
                    return;
                }
            };
            if cancelled.load(Ordering::SeqCst) {
                stream.stop_all();
                return;
            }
            let _ = setup_tx
                .send(SetupEvent::MediaReady {
                    attempt,
                    stream: stream.clone(),
                })
                .await;

            let events = match pcm.create_transport(&local_tid).await {
                Ok((_endpoint, events)) => events,
                Err(e) => {
                    let _ = setup_tx
                        .send(SetupEvent::Failed {
                            attempt,
                            error: CallError::Negotiation(e.to_string()),
                        })
                        .await;
                    return;
                }
            };
            if cancelled.load(Ordering::SeqCst) {
                pcm.close().await;
                return;
            }
            if let Some(events) = events {
                let _ = setup_tx.send(SetupEvent::TransportUp { attempt, events }).await;
            }

            // The caller's transport id arrives over signaling once its own
            // setup finishes.
            let remote_tid = match wait_for_remote_tid(&mut remote_tid_rx).await {
                Ok(Some(tid)) => tid,
                Ok(None) => return, // session torn down
                Err(_elapsed) => {
                    let _ = setup_tx
                        .send(SetupEvent::Failed {
                            attempt,
                            error: CallError::Negotiation(
                                "caller's transport id never arrived".into(),
                            ),
                        })
                        .await;
                    return;
                }
            };
            if cancelled.load(Ordering::SeqCst) {
                return;
            }

            // Receiver places the one outbound dial (after the grace delay
            // inside `dial`).
            let ev = match pcm.dial(&remote_tid, stream.clone()).await {
                Ok(remote) => SetupEvent::Connected { attempt, remote },
                Err(e) => SetupEvent::Failed {
                    attempt,
                    error: CallError::Negotiation(e.to_string()),
                },
            };
            let _ = setup_tx.send(ev).await;
        });
    }

    /// Unwind to `Idle`, releasing everything the session holds. Safe to call
    /// from any state, any number of times; only the teardown that actually
    /// destroys a session emits `Ended`.
    async fn teardown(
        &mut self,
        reason: EndReason,
        notify_remote: bool,
        peer_rx: &mut PeerEvents,
        ring: &mut RingDeadline,
    ) {
        *ring = None;
        *peer_rx = None;

        let Some(session) = self.session.take() else {
            self.set_phase(CallPhase::Idle);
            return;
        };

        self.set_phase(CallPhase::Ended);
        session.cancelled.store(true, Ordering::SeqCst);

        if let Some(stream) = session.local_stream {
            stream.stop_all();
        }
        if let Some(remote) = session.remote_stream {
            remote.stop();
        }
        session.pcm.close().await;

        if notify_remote {
            let signaling = self.deps.signaling.clone();
            let to = session.remote_user.clone();
            let payload = SignalPayload::CallEnded {
                reason: reason.wire_reason(),
            };
            tokio::spawn(async move {
                if let Err(e) = signaling.send(&to, payload).await {
                    tracing::debug!("Hangup to {} not delivered: {:#}", to, e);
                }
            });
        }

        tracing::info!(
            "Call with {} ended: {} ({:?} role)",
            session.remote_user,
            reason,
            session.role
        );
        self.set_phase(CallPhase::Idle);
        self.emit(SessionEvent::Ended { reason });
    }
}

/// Deliver the transport-id offer, waiting out a relay outage.
///
/// Polls every [`OFFER_RETRY_INTERVAL`] for up to [`OFFER_RETRY_WINDOW`],
/// with a connected-watch wakeup so reconnection is caught immediately. The
/// offer is sent exactly once.
async fn send_offer_when_ready(
    signaling: &dyn Signaling,
    to: &str,
    transport_id: &TransportId,
    call_type: CallType,
) -> Result<(), CallError> {
    let deadline = time::Instant::now() + OFFER_RETRY_WINDOW;
    let mut ready = signaling.connected_watch();

    loop {
        if signaling.is_connected() {
            return signaling
                .send(
                    to,
                    SignalPayload::PeerIdOffer {
                        transport_id: transport_id.as_str().to_string(),
                        call_type,
                    },
                )
                .await
                .map_err(|e| {
                    tracing::warn!("Transport id offer not delivered: {:#}", e);
                    CallError::SignalingUnavailable
                });
        }
        if time::Instant::now() >= deadline {
            return Err(CallError::SignalingUnavailable);
        }
        tokio::select! {
            _ = time::sleep(OFFER_RETRY_INTERVAL) => {}
            res = ready.changed() => {
                if res.is_err() {
                    // Transport is gone for good; run out the clock.
                    time::sleep_until(deadline).await;
                    return Err(CallError::SignalingUnavailable);
                }
            }
            _ = time::sleep_until(deadline) => {
                return Err(CallError::SignalingUnavailable);
            }
        }
    }
}

/// Receiver side: wait for the caller's transport id, bounded by
/// [`REMOTE_ID_WAIT`]. `Ok(None)` means the session went away.
async fn wait_for_remote_tid(
    rx: &mut watch::Receiver<Option<TransportId>>,
) -> Result<Option<TransportId>, time::error::Elapsed> {
    time::timeout(REMOTE_ID_WAIT, async {
        loop {
            let current = rx.borrow().clone();
            if let Some(tid) = current {
                return Some(tid);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::media::MediaErrorKind;
    use crate::call::testutil::*;

    fn harness() -> (Arc<TestRelayHub>, Arc<TestMesh>) {
        (TestRelayHub::new(), TestMesh::new())
    }

    async fn connect_pair(
        hub: &Arc<TestRelayHub>,
        mesh: &Arc<TestMesh>,
        call_type: CallType,
    ) -> (TestActor, TestActor) {
        let aiko = TestActor::start(hub, mesh, "aiko");
        let ben = TestActor::start(hub, mesh, "ben");

        aiko.controller.initiate("ben", call_type).await.expect("initiate");
        wait_for_phase(&ben.controller, CallPhase::RingingAsReceiver).await;
        ben.controller.accept_incoming_call().await.expect("accept");
        wait_for_phase(&aiko.controller, CallPhase::InCall).await;
        wait_for_phase(&ben.controller, CallPhase::InCall).await;
        (aiko, ben)
    }

    #[tokio::test(start_paused = true)]
    async fn video_call_reaches_in_call_on_both_sides() {
        let (hub, mesh) = harness();
        let aiko = TestActor::start(&hub, &mesh, "aiko");
        let ben = TestActor::start(&hub, &mesh, "ben");
        let mut ben_events = ben.controller.subscribe();

        aiko.controller
            .initiate("ben", CallType::Video)
            .await
            .expect("initiate");
        assert_eq!(aiko.controller.phase(), CallPhase::RingingAsCaller);

        wait_for_phase(&ben.controller, CallPhase::RingingAsReceiver).await;
        match ben_events.recv().await.expect("incoming event") {
            SessionEvent::IncomingCall { from, call_type } => {
                assert_eq!(from, "aiko");
                assert_eq!(call_type, CallType::Video);
            }
            other => panic!("expected IncomingCall, got {:?}", other),
        }

        ben.controller.accept_incoming_call().await.expect("accept");
        assert_eq!(ben.controller.phase(), CallPhase::ConnectingAsReceiver);

        wait_for_phase(&aiko.controller, CallPhase::InCall).await;
        wait_for_phase(&ben.controller, CallPhase::InCall).await;

        let snap = aiko.controller.snapshot().await.expect("snapshot");
        assert!(snap.has_local_stream);
        assert!(snap.has_remote_stream);
        assert_eq!(snap.remote_user.as_deref(), Some("ben"));

        // Both sides captured audio+video; the receiver saw the caller's
        // video track in its remote stream.
        assert!(aiko.media.created_tracks().len() >= 2);
        assert!(ben.media.created_tracks().len() >= 2);

        // Signaling ordering for the attempt: request, answer, then offer.
        let events: Vec<&str> = hub
            .sent()
            .iter()
            .map(|(_, _, p)| match p {
                SignalPayload::CallRequest { .. } => "request",
                SignalPayload::CallAnswer { .. } => "answer",
                SignalPayload::PeerIdOffer { .. } => "offer",
                SignalPayload::CallEnded { .. } => "ended",
            })
            .collect();
        assert_eq!(events, vec!["request", "answer", "offer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_unwinds_both_sides_without_media() {
        let (hub, mesh) = harness();
        let aiko = TestActor::start(&hub, &mesh, "aiko");
        let ben = TestActor::start(&hub, &mesh, "ben");
        let mut aiko_events = aiko.controller.subscribe();

        aiko.controller
            .initiate("ben", CallType::Video)
            .await
            .expect("initiate");
        wait_for_phase(&ben.controller, CallPhase::RingingAsReceiver).await;
        ben.controller.reject_incoming_call().await.expect("reject");

        wait_for_phase(&aiko.controller, CallPhase::Idle).await;
        wait_for_phase(&ben.controller, CallPhase::Idle).await;

        // Neither side ever touched a capture device.
        assert_eq!(aiko.media.call_count(), 0);
        assert_eq!(ben.media.call_count(), 0);

        let reasons = drain_events(&mut aiko_events);
        assert!(reasons.iter().any(|e| matches!(
            e,
            SessionEvent::Ended {
                reason: EndReason::RemoteDeclined
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn offer_waits_for_reconnect_and_sends_exactly_once() {
        let (hub, _mesh) = harness();
        let signaling = hub.client("aiko");
        signaling.set_connected(false);

        let tid = TransportId::new_for_attempt("aiko");
        let task = tokio::spawn({
            let signaling = signaling.clone();
            let tid = tid.clone();
            async move {
                send_offer_when_ready(signaling.as_ref(), "ben", &tid, CallType::Audio).await
            }
        });

        // Relay comes back three seconds in.
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(hub.count_offers(), 0);
        signaling.set_connected(true);

        task.await.expect("join").expect("offer delivered");
        assert_eq!(hub.count_offers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn offer_gives_up_after_the_retry_window() {
        let (hub, _mesh) = harness();
        let signaling = hub.client("aiko");
        signaling.set_connected(false);

        let tid = TransportId::new_for_attempt("aiko");
        let started = time::Instant::now();
        let err = send_offer_when_ready(signaling.as_ref(), "ben", &tid, CallType::Audio)
            .await
            .expect_err("must give up");
        assert!(matches!(err, CallError::SignalingUnavailable));
        assert!(started.elapsed() >= OFFER_RETRY_WINDOW);
        assert_eq!(hub.count_offers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_is_classified_and_unwinds_both_sides() {
        let (hub, mesh) = harness();
        let aiko = TestActor::start_with_media(
            &hub,
            &mesh,
            "aiko",
            MockMediaRuntime::failing(MediaErrorKind::PermissionDenied),
        );
        let ben = TestActor::start(&hub, &mesh, "ben");
        let mut aiko_events = aiko.controller.subscribe();

        aiko.controller
            .initiate("ben", CallType::Audio)
            .await
            .expect("initiate");
        wait_for_phase(&ben.controller, CallPhase::RingingAsReceiver).await;
        ben.controller.accept_incoming_call().await.expect("accept");

        wait_for_phase(&aiko.controller, CallPhase::Idle).await;
        wait_for_phase(&ben.controller, CallPhase::Idle).await;

        let events = drain_events(&mut aiko_events);
        let failure = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::Failed { error: CallError::Media(m) } => Some(m.kind),
                _ => None,
            })
            .expect("classified failure event");
        assert_eq!(failure, MediaErrorKind::PermissionDenied);

        let snap = aiko.controller.snapshot().await.expect("snapshot");
        assert_eq!(snap.phase, CallPhase::Idle);
        assert!(!snap.has_local_stream);

        // The receiver's capture (if it got that far) was released too.
        assert!(ben.media.all_tracks_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn second_caller_gets_busy_decline() {
        let (hub, mesh) = harness();
        let (aiko, _ben) = connect_pair(&hub, &mesh, CallType::Audio).await;

        // A third user rings aiko mid-call.
        let carol = hub.client("carol");
        carol
            .send(
                "aiko",
                SignalPayload::CallRequest {
                    call_type: CallType::Audio,
                },
            )
            .await
            .expect("send");

        hub.wait_for_sent("aiko", "carol", |p| {
            matches!(p, SignalPayload::CallAnswer { accepted: false })
        })
        .await;

        // The active call is untouched.
        assert_eq!(aiko.controller.phase(), CallPhase::InCall);
    }

    #[tokio::test(start_paused = true)]
    async fn end_call_is_idempotent_and_releases_everything() {
        let (hub, mesh) = harness();
        let (aiko, ben) = connect_pair(&hub, &mesh, CallType::Audio).await;

        aiko.controller.end_call().await;
        aiko.controller.end_call().await;
        assert_eq!(aiko.controller.phase(), CallPhase::Idle);

        let snap = aiko.controller.snapshot().await.expect("snapshot");
        assert!(!snap.has_local_stream);
        assert!(!snap.has_remote_stream);
        assert!(aiko.media.all_tracks_stopped());

        // The counterpart sees the hangup and unwinds as well.
        wait_for_phase(&ben.controller, CallPhase::Idle).await;
        assert!(ben.media.all_tracks_stopped());

        // End from Idle is a no-op too.
        ben.controller.end_call().await;
        assert_eq!(ben.controller.phase(), CallPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn call_ended_unwinds_ringing_caller() {
        let (hub, mesh) = harness();
        let aiko = TestActor::start(&hub, &mesh, "aiko");
        let ben = hub.client("ben");
        let mut events = aiko.controller.subscribe();

        aiko.controller
            .initiate("ben", CallType::Audio)
            .await
            .expect("initiate");
        ben.send("aiko", SignalPayload::CallEnded { reason: None })
            .await
            .expect("send");

        wait_for_phase(&aiko.controller, CallPhase::Idle).await;
        assert_eq!(count_ended(&drain_events(&mut events)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn call_ended_unwinds_connecting_caller() {
        let (hub, mesh) = harness();
        let aiko = TestActor::start(&hub, &mesh, "aiko");
        let ben = hub.client("ben");
        let mut events = aiko.controller.subscribe();

        aiko.controller
            .initiate("ben", CallType::Audio)
            .await
            .expect("initiate");
        ben.send("aiko", SignalPayload::CallAnswer { accepted: true })
            .await
            .expect("send");
        wait_for_phase(&aiko.controller, CallPhase::ConnectingAsCaller).await;
        // Let capture and transport registration finish.
        hub.wait_for_sent("aiko", "ben", |p| matches!(p, SignalPayload::PeerIdOffer { .. }))
            .await;

        ben.send("aiko", SignalPayload::CallEnded { reason: None })
            .await
            .expect("send");
        wait_for_phase(&aiko.controller, CallPhase::Idle).await;

        assert_eq!(count_ended(&drain_events(&mut events)), 1);
        assert!(aiko.media.all_tracks_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn call_ended_unwinds_connecting_receiver() {
        let (hub, mesh) = harness();
        let ben = TestActor::start(&hub, &mesh, "ben");
        let aiko = hub.client("aiko");
        let mut events = ben.controller.subscribe();

        aiko.send(
            "ben",
            SignalPayload::CallRequest {
                call_type: CallType::Audio,
            },
        )
        .await
        .expect("send");
        wait_for_phase(&ben.controller, CallPhase::RingingAsReceiver).await;
        ben.controller.accept_incoming_call().await.expect("accept");
        wait_for_phase(&ben.controller, CallPhase::ConnectingAsReceiver).await;

        // Hangup lands while the receiver still waits for the caller's
        // transport id.
        aiko.send("ben", SignalPayload::CallEnded { reason: None })
            .await
            .expect("send");
        wait_for_phase(&ben.controller, CallPhase::Idle).await;

        assert_eq!(count_ended(&drain_events(&mut events)), 1);
        assert!(ben.media.all_tracks_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn call_ended_unwinds_in_call() {
        let (hub, mesh) = harness();
        let (aiko, ben) = connect_pair(&hub, &mesh, CallType::Audio).await;
        let mut events = aiko.controller.subscribe();

        ben.controller.end_call().await;
        wait_for_phase(&aiko.controller, CallPhase::Idle).await;

        assert_eq!(count_ended(&drain_events(&mut events)), 1);
        assert!(aiko.media.all_tracks_stopped());
        assert!(ben.media.all_tracks_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out() {
        let (hub, mesh) = harness();
        let aiko = TestActor::start(&hub, &mesh, "aiko");
        let mut events = aiko.controller.subscribe();
        // "ghost" never registers a relay channel, so the ring goes nowhere.
        aiko.controller
            .initiate("ghost", CallType::Audio)
            .await
            .expect("initiate");

        time::sleep(RING_TIMEOUT + Duration::from_secs(1)).await;
        wait_for_phase(&aiko.controller, CallPhase::Idle).await;

        let drained = drain_events(&mut events);
        assert!(drained.iter().any(|e| matches!(
            e,
            SessionEvent::Ended {
                reason: EndReason::RingTimeout
            }
        )));
        hub.wait_for_sent("aiko", "ghost", |p| {
            matches!(p, SignalPayload::CallEnded { reason: Some(r) } if r == "timeout")
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_attempts_use_fresh_transport_ids() {
        let (hub, mesh) = harness();
        let (aiko, ben) = connect_pair(&hub, &mesh, CallType::Audio).await;
        aiko.controller.end_call().await;
        wait_for_phase(&ben.controller, CallPhase::Idle).await;

        // Second call between the same pair.
        aiko.controller
            .initiate("ben", CallType::Audio)
            .await
            .expect("second call");
        wait_for_phase(&ben.controller, CallPhase::RingingAsReceiver).await;
        ben.controller.accept_incoming_call().await.expect("accept");
        wait_for_phase(&aiko.controller, CallPhase::InCall).await;

        let offers: Vec<String> = hub
            .sent()
            .iter()
            .filter_map(|(_, _, p)| match p {
                SignalPayload::PeerIdOffer { transport_id, .. } => Some(transport_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(offers.len(), 2);
        assert_ne!(offers[0], offers[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn toggles_flip_tracks_only_in_a_live_call() {
        let (hub, mesh) = harness();
        let (aiko, _ben) = connect_pair(&hub, &mesh, CallType::Audio).await;

        let mic = aiko
            .media
            .created_tracks()
            .into_iter()
            .find(|t| t.kind() == TrackKind::Audio)
            .expect("mic track");
        assert!(mic.is_enabled());

        aiko.controller.toggle_mic(None).await.expect("toggle");
        assert!(!mic.is_enabled());
        aiko.controller.toggle_mic(None).await.expect("toggle");
        assert!(mic.is_enabled());
        aiko.controller
            .toggle_mic(Some(false))
            .await
            .expect("toggle");
        assert!(!mic.is_enabled());

        // Audio-only call: camera toggle is a no-op, not an error.
        aiko.controller.toggle_camera(None).await.expect("no-op");

        aiko.controller.end_call().await;
        let err = aiko.controller.toggle_mic(None).await.expect_err("idle");
        assert!(matches!(err, CallError::InvalidState { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn initiate_refused_while_busy_or_disconnected() {
        let (hub, mesh) = harness();
        let (aiko, _ben) = connect_pair(&hub, &mesh, CallType::Audio).await;

        let err = aiko
            .controller
            .initiate("carol", CallType::Audio)
            .await
            .expect_err("busy");
        assert!(matches!(err, CallError::InvalidState { .. }));
        assert_eq!(aiko.controller.phase(), CallPhase::InCall);

        aiko.controller.end_call().await;
        aiko.signaling.set_connected(false);
        let err = aiko
            .controller
            .initiate("carol", CallType::Audio)
            .await
            .expect_err("relay down");
        assert!(matches!(err, CallError::SignalingUnavailable));
        assert_eq!(aiko.controller.phase(), CallPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn negotiation_failure_unwinds_with_classified_error() {
        let (hub, mesh) = harness();
        let aiko = TestActor::start(&hub, &mesh, "aiko");
        let ben = TestActor::start(&hub, &mesh, "ben");
        let mut ben_events = ben.controller.subscribe();

        mesh.fail_dials("relay allocation refused");

        aiko.controller
            .initiate("ben", CallType::Audio)
            .await
            .expect("initiate");
        wait_for_phase(&ben.controller, CallPhase::RingingAsReceiver).await;
        ben.controller.accept_incoming_call().await.expect("accept");

        wait_for_phase(&ben.controller, CallPhase::Idle).await;
        wait_for_phase(&aiko.controller, CallPhase::Idle).await;

        let events = drain_events(&mut ben_events);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Failed { error: CallError::Negotiation(_) })));
        assert!(ben.media.all_tracks_stopped());
        assert!(aiko.media.all_tracks_stopped());
    }

    fn count_ended(events: &[SessionEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Ended { .. }))
            .count()
    }
}
