//! Peer relay client — the production [`Rendezvous`] implementation.
//!
//! Talks to the Kaiwa peer relay service: a transport identity is claimed
//! over HTTP, then held open on a WebSocket where dials, answers, and media
//! frames are exchanged. NAT traversal is the service's problem; this client
//! always uses the relayed media path.
//!
//! Wire shape: JSON text frames for control (`open`, `dial`, `answer`,
//! `dial-failed`, `leave`, `error`), binary frames for media (one-byte kind
//! tag, then PCM samples or a video frame).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::media::{FrameSource, LocalStream, RemoteFrame, RemoteStream, TrackKind, VideoFrame};
use super::peer::{
    PeerEndpoint, PeerError, PeerEvent, RegisteredEndpoint, Rendezvous, TransportId,
};

/// How long to wait for the relay to confirm a registration.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a placed dial may wait for the counterpart's answer.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(20);

const FRAME_TAG_AUDIO: u8 = 0x00;
const FRAME_TAG_VIDEO: u8 = 0x01;

/// Client for the peer relay service.
pub struct RelayRendezvous {
    http: reqwest::Client,
    base_url: String,
    key: String,
}

impl RelayRendezvous {
    pub fn new(base_url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key: key.into(),
        }
    }

    /// Claim `id` with the relay over HTTP. The claim must succeed before the
    /// socket is opened; a stale or duplicate id is rejected here.
    async fn claim_identity(&self, id: &TransportId) -> Result<(), PeerError> {
        let url = format!("{}/api/{}/register", self.base_url, self.key);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "id": id.as_str() }))
            .send()
            .await
            .map_err(|e| PeerError::Registration(format!("claim request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PeerError::Registration(format!(
                "claim rejected ({status}): {body}"
            )));
        }
        Ok(())
    }

    fn socket_url(&self, id: &TransportId) -> String {
        let ws_base = self
            .base_url
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        // Fresh token per connection, as the relay requires for replays.
        let token = uuid::Uuid::new_v4();
        format!("{}/peer?key={}&id={}&token={}", ws_base, self.key, id, token)
    }
}

#[async_trait]
impl Rendezvous for RelayRendezvous {
    async fn register(&self, id: &TransportId) -> Result<RegisteredEndpoint, PeerError> {
        self.claim_identity(id).await?;

        let url = self.socket_url(id);
        tracing::info!("Connecting peer relay socket for {}", id);
        let (mut ws, _resp) = connect_async(&url)
            .await
            .map_err(|e| PeerError::Registration(format!("socket connect failed: {e}")))?;

        // The identity is live only once the relay says `open`.
        let opened = tokio::time::timeout(OPEN_TIMEOUT, async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let v: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        match v.get("type").and_then(|t| t.as_str()) {
                            Some("open") => return Ok(()),
                            Some("error") => {
                                let msg = v
                                    .get("message")
                                    .and_then(|m| m.as_str())
                                    .unwrap_or("registration refused");
                                return Err(PeerError::Registration(msg.to_string()));
                            }
                            _ => continue,
                        }
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(PeerError::Registration(format!("socket error: {e}")))
                    }
                    None => {
                        return Err(PeerError::Registration(
                            "socket closed before open".to_string(),
                        ))
                    }
                }
            }
        })
        .await
        .map_err(|_| PeerError::Registration("relay did not confirm registration".to_string()))?;
        opened?;

        tracing::info!("Transport {} open on peer relay", id);

        let (out_tx, out_rx) = mpsc::channel::<Outbound>(64);
        let (events_tx, events_rx) = mpsc::channel::<PeerEvent>(8);
        let state = Arc::new(LinkState::default());

        tokio::spawn(socket_task(ws, out_rx, events_tx, state.clone()));

        Ok(RegisteredEndpoint {
            endpoint: Arc::new(RelayEndpoint {
                id: id.clone(),
                out_tx,
                state,
            }),
            events: events_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

enum Outbound {
    Control(serde_json::Value),
    Media(Vec<u8>),
    Shutdown,
}

/// Identity and track kinds of the party on the other end of a dial.
#[derive(Clone)]
struct DialPeer {
    peer: String,
    kinds: Vec<TrackKind>,
}

#[derive(Default)]
struct LinkState {
    next_dial: AtomicU64,
    /// Dials we placed, waiting for the counterpart's answer.
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<DialPeer, PeerError>>>>,
    /// Dials addressed to us, not yet answered.
    inbound: Mutex<HashMap<u64, DialPeer>>,
    /// Inbound media sink for the (single) live link.
    active: Mutex<Option<mpsc::Sender<RemoteFrame>>>,
    closed: AtomicBool,
}

struct RelayEndpoint {
    id: TransportId,
    out_tx: mpsc::Sender<Outbound>,
    state: Arc<LinkState>,
}

impl RelayEndpoint {
    /// Wire the live link up: inbound frames flow to the returned stream,
    /// outbound pumps drain the local tracks.
    fn open_link(&self, peer: DialPeer, local: &LocalStream) -> RemoteStream {
        let (frames_tx, frames_rx) = mpsc::channel(64);
        *self.state.active.lock().unwrap() = Some(frames_tx);
        start_pumps(local, self.out_tx.clone());
        RemoteStream::new(peer.peer, peer.kinds, Some(frames_rx))
    }
}

#[async_trait]
impl PeerEndpoint for RelayEndpoint {
    fn id(&self) -> &TransportId {
        &self.id
    }

    async fn dial(
        &self,
        remote: &TransportId,
        local: LocalStream,
    ) -> Result<RemoteStream, PeerError> {
        let dial_id = self.state.next_dial.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.state.pending.lock().unwrap().insert(dial_id, reply_tx);

        let msg = serde_json::json!({
            "type": "dial",
            "dial": dial_id,
            "to": remote.as_str(),
            "tracks": kinds_to_wire(&local.kinds()),
        });
        self.out_tx
            .send(Outbound::Control(msg))
            .await
            .map_err(|_| PeerError::Dial("relay socket is gone".into()))?;

        let peer = match tokio::time::timeout(ANSWER_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(PeerError::Dial("relay socket is gone".into())),
            Err(_) => {
                self.state.pending.lock().unwrap().remove(&dial_id);
                return Err(PeerError::Dial("no answer from remote transport".into()));
            }
        };

        Ok(self.open_link(peer, &local))
    }

    async fn answer(&self, dial_id: u64, local: LocalStream) -> Result<RemoteStream, PeerError> {
        let peer = self
            .state
            .inbound
            .lock()
            .unwrap()
            .remove(&dial_id)
            .ok_or_else(|| PeerError::Answer(format!("unknown dial {dial_id}")))?;

        let msg = serde_json::json!({
            "type": "answer",
            "dial": dial_id,
            "tracks": kinds_to_wire(&local.kinds()),
        });
        self.out_tx
            .send(Outbound::Control(msg))
            .await
            .map_err(|_| PeerError::Answer("relay socket is gone".into()))?;

        Ok(self.open_link(peer, &local))
    }

    async fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.active.lock().unwrap().take();
        let _ = self.out_tx.send(Outbound::Shutdown).await;
    }
}

// ---------------------------------------------------------------------------
// Socket task
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn socket_task(
    mut ws: WsStream,
    mut out_rx: mpsc::Receiver<Outbound>,
    events_tx: mpsc::Sender<PeerEvent>,
    state: Arc<LinkState>,
) {
    let reason = loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(Outbound::Control(v)) => {
                        if let Err(e) = ws.send(Message::Text(v.to_string())).await {
                            break format!("send failed: {e}");
                        }
                    }
                    Some(Outbound::Media(buf)) => {
                        if let Err(e) = ws.send(Message::Binary(buf)).await {
                            break format!("send failed: {e}");
                        }
                    }
                    Some(Outbound::Shutdown) | None => {
                        let _ = ws.send(Message::Text(
                            serde_json::json!({ "type": "leave" }).to_string(),
                        )).await;
                        let _ = ws.close(None).await;
                        return;
                    }
                }
            }
            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reason) = handle_control(&text, &events_tx, &state).await {
                            break reason;
                        }
                    }
                    Some(Ok(Message::Binary(buf))) => {
                        if let Some(frame) = decode_frame(&buf) {
                            let sink = state.active.lock().unwrap().clone();
                            if let Some(sink) = sink {
                                // Drop frames if playback is behind.
                                let _ = sink.try_send(frame);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws.send(Message::Pong(data)).await.is_err() {
                            break "pong failed".to_string();
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "socket closed".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("socket error: {e}"),
                }
            }
        }
    };

    tracing::info!("Peer relay socket down: {}", reason);
    // Anyone blocked on a placed dial learns the link is gone.
    for (_, reply) in state.pending.lock().unwrap().drain() {
        let _ = reply.send(Err(PeerError::Closed(reason.clone())));
    }
    let _ = events_tx.send(PeerEvent::Closed { reason }).await;
}

/// Handle one control frame. Returns `Some(reason)` when the link must shut
/// down.
async fn handle_control(
    text: &str,
    events_tx: &mpsc::Sender<PeerEvent>,
    state: &Arc<LinkState>,
) -> Option<String> {
    let v: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!("Non-JSON relay control frame ignored");
            return None;
        }
    };

    match v.get("type").and_then(|t| t.as_str()) {
        Some("dial") => {
            let (Some(dial_id), Some(from)) = (
                v.get("dial").and_then(|d| d.as_u64()),
                v.get("from").and_then(|f| f.as_str()),
            ) else {
                tracing::debug!("Malformed dial frame ignored");
                return None;
            };
            let peer = DialPeer {
                peer: from.to_string(),
                kinds: kinds_from_wire(v.get("tracks")),
            };
            state.inbound.lock().unwrap().insert(dial_id, peer);
            let _ = events_tx
                .send(PeerEvent::IncomingDial {
                    dial_id,
                    from: TransportId::from_wire(from),
                })
                .await;
            None
        }
        Some("answer") => {
            let Some(dial_id) = v.get("dial").and_then(|d| d.as_u64()) else {
                return None;
            };
            if let Some(reply) = state.pending.lock().unwrap().remove(&dial_id) {
                let peer = DialPeer {
                    peer: v
                        .get("from")
                        .and_then(|f| f.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    kinds: kinds_from_wire(v.get("tracks")),
                };
                let _ = reply.send(Ok(peer));
            }
            None
        }
        Some("dial-failed") => {
            let Some(dial_id) = v.get("dial").and_then(|d| d.as_u64()) else {
                return None;
            };
            if let Some(reply) = state.pending.lock().unwrap().remove(&dial_id) {
                let msg = v
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("dial refused")
                    .to_string();
                let _ = reply.send(Err(PeerError::Dial(msg)));
            }
            None
        }
        Some("leave") => Some("remote left".to_string()),
        Some("error") => {
            let msg = v
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("relay error")
                .to_string();
            let _ = events_tx
                .send(PeerEvent::Error(PeerError::Closed(msg.clone())))
                .await;
            Some(msg)
        }
        other => {
            tracing::debug!("Unknown relay control frame {:?} ignored", other);
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Media pumps and framing
// ---------------------------------------------------------------------------

/// Drain each local track's frame source onto the socket. Disabled tracks
/// (muted mic, camera off) skip frames but keep draining so capture does not
/// back up.
fn start_pumps(local: &LocalStream, out_tx: mpsc::Sender<Outbound>) {
    for track in local.tracks() {
        let Some(source) = track.take_source() else {
            continue;
        };
        let track = track.clone();
        let out = out_tx.clone();
        std::thread::spawn(move || match source {
            FrameSource::Audio(rx) => {
                while let Ok(frame) = rx.recv() {
                    if !track.is_enabled() {
                        continue;
                    }
                    if out.blocking_send(Outbound::Media(encode_audio(&frame))).is_err() {
                        break;
                    }
                }
            }
            FrameSource::Video(rx) => {
                while let Ok(frame) = rx.recv() {
                    if !track.is_enabled() {
                        continue;
                    }
                    if out.blocking_send(Outbound::Media(encode_video(&frame))).is_err() {
                        break;
                    }
                }
            }
        });
    }
}

fn kinds_to_wire(kinds: &[TrackKind]) -> Vec<&'static str> {
    kinds
        .iter()
        .map(|k| match k {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        })
        .collect()
}

fn kinds_from_wire(v: Option<&serde_json::Value>) -> Vec<TrackKind> {
    v.and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|k| match k.as_str() {
                    Some("audio") => Some(TrackKind::Audio),
                    Some("video") => Some(TrackKind::Video),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn encode_audio(samples: &[i16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + samples.len() * 2);
    buf.push(FRAME_TAG_AUDIO);
    for s in samples {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    buf
}

fn encode_video(frame: &VideoFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + frame.data.len());
    buf.push(FRAME_TAG_VIDEO);
    buf.extend_from_slice(&frame.width.to_le_bytes());
    buf.extend_from_slice(&frame.height.to_le_bytes());
    buf.extend_from_slice(&frame.data);
    buf
}

fn decode_frame(buf: &[u8]) -> Option<RemoteFrame> {
    match buf.first()? {
        &FRAME_TAG_AUDIO => {
            let payload = &buf[1..];
            if payload.len() % 2 != 0 {
                return None;
            }
            let samples = payload
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect();
            Some(RemoteFrame::Audio(samples))
        }
        &FRAME_TAG_VIDEO => {
            if buf.len() < 9 {
                return None;
            }
            let width = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
            let height = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);
            Some(RemoteFrame::Video(VideoFrame {
                width,
                height,
                data: buf[9..].to_vec(),
            }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_framing_survives_the_wire() {
        let samples: Vec<i16> = vec![0, -1, 32767, -32768, 42];
        let buf = encode_audio(&samples);
        match decode_frame(&buf) {
            Some(RemoteFrame::Audio(out)) => assert_eq!(out, samples),
            other => panic!("unexpected decode: {:?}", other.is_some()),
        }
    }

    #[test]
    fn malformed_frames_are_dropped() {
        // Odd-length audio payload.
        assert!(decode_frame(&[FRAME_TAG_AUDIO, 0x01]).is_none());
        // Video header truncated.
        assert!(decode_frame(&[FRAME_TAG_VIDEO, 0, 0, 0]).is_none());
        // Unknown tag.
        assert!(decode_frame(&[0x7f, 1, 2, 3]).is_none());
        // Empty.
        assert!(decode_frame(&[]).is_none());
    }

    #[test]
    fn unknown_track_kinds_are_ignored() {
        let v = serde_json::json!(["audio", "screen", "video"]);
        assert_eq!(
            kinds_from_wire(Some(&v)),
            vec![TrackKind::Audio, TrackKind::Video]
        );
        assert!(kinds_from_wire(None).is_empty());
    }
}
