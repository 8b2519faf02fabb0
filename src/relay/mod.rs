//! Realtime relay client — the signaling transport for calls.
//!
//! Maintains one persistent WebSocket to the Kaiwa relay, keyed by the
//! authenticated participant identity. Reconnects with exponential backoff on
//! transient errors, re-announcing the identity after every connect. Call
//! control messages are fanned out to subscribers; everything else the relay
//! pushes is ignored here.

pub mod websocket;

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;

use crate::call::{parse_signal_event, signal_envelope, SignalEvent, SignalPayload, Signaling};
use websocket::RelaySocket;

/// Heartbeat interval while connected.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A session that survives this long resets the reconnect backoff.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

/// Why the inner connection loop exited.
enum SessionEnd {
    /// Client handle dropped. Do not reconnect.
    ClientDropped,
    /// Error or server-initiated close. Should reconnect.
    Disconnected(anyhow::Error),
}

/// Handle to the relay connection. Cloning is not needed — wrap in `Arc` to
/// share; dropping the last handle stops the connection task.
pub struct SignalingClient {
    user_id: String,
    connected_rx: watch::Receiver<bool>,
    events_tx: broadcast::Sender<SignalEvent>,
    out_tx: mpsc::Sender<serde_json::Value>,
}

impl SignalingClient {
    /// Spawn the connection task and return the client handle. The
    /// connection is established (and re-established) in the background;
    /// observe readiness via [`Signaling::connected_watch`].
    pub fn connect(relay_url: String, user_id: String, display_name: String) -> Self {
        let (connected_tx, connected_rx) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);

        let events = events_tx.clone();
        let user = user_id.clone();
        tokio::spawn(async move {
            run_with_reconnect(relay_url, user, display_name, connected_tx, events, out_rx).await;
        });

        Self {
            user_id,
            connected_rx,
            events_tx,
            out_tx,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Wait until the relay connection is up, bounded by `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.connected_rx.clone();
        let deadline = time::Instant::now() + timeout;
        while !*rx.borrow() {
            tokio::select! {
                res = rx.changed() => {
                    res.context("relay connection task exited")?;
                }
                _ = time::sleep_until(deadline) => {
                    bail!("relay did not connect within {:?}", timeout);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Signaling for SignalingClient {
    fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    async fn send(&self, to: &str, payload: SignalPayload) -> Result<()> {
        if !self.is_connected() {
            bail!("relay not connected");
        }
        self.out_tx
            .send(signal_envelope(to, &payload))
            .await
            .context("relay connection task is gone")
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.events_tx.subscribe()
    }
}

/// Run the relay connection with automatic reconnection.
///
/// On transient errors, reconnects with exponential backoff (1s, 2s, 4s, ...
/// capped at 64s), resetting after a stable (>60s) session. Exits when the
/// client handle is dropped.
async fn run_with_reconnect(
    relay_url: String,
    user_id: String,
    display_name: String,
    connected_tx: watch::Sender<bool>,
    events_tx: broadcast::Sender<SignalEvent>,
    mut out_rx: mpsc::Receiver<serde_json::Value>,
) {
    let mut backoff = 1u64;

    loop {
        let connected_at = Instant::now();
        let end = run_session(
            &relay_url,
            &user_id,
            &display_name,
            &connected_tx,
            &events_tx,
            &mut out_rx,
        )
        .await;
        let _ = connected_tx.send(false);

        let err = match end {
            Ok(SessionEnd::ClientDropped) => {
                tracing::info!("Relay client dropped, closing connection");
                return;
            }
            Ok(SessionEnd::Disconnected(e)) => e,
            Err(e) => e,
        };

        if connected_at.elapsed() >= STABILITY_THRESHOLD {
            backoff = 1;
        }

        tracing::warn!("Relay disconnected: {:#}. Reconnecting in {}s...", err, backoff);
        time::sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(64);
    }
}

/// One full relay session: connect, announce identity, event loop.
async fn run_session(
    relay_url: &str,
    user_id: &str,
    display_name: &str,
    connected_tx: &watch::Sender<bool>,
    events_tx: &broadcast::Sender<SignalEvent>,
    out_rx: &mut mpsc::Receiver<serde_json::Value>,
) -> Result<SessionEnd> {
    let mut sock = RelaySocket::connect(relay_url).await?;

    // Announce who this channel belongs to; the relay routes by this id.
    sock.send_json(&serde_json::json!({
        "event": "register",
        "data": { "user": user_id, "displayName": display_name }
    }))
    .await
    .context("Failed to register with relay")?;

    let _ = connected_tx.send(true);
    tracing::info!("Relay connected as {}", user_id);

    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            frame = sock.recv_json() => {
                match frame {
                    Ok(Some(v)) => {
                        if let Some(ev) = parse_signal_event(&v) {
                            // No subscribers is fine — events are best-effort.
                            let _ = events_tx.send(ev);
                        } else {
                            tracing::debug!("Ignoring non-call relay frame");
                        }
                    }
                    Ok(None) => {
                        return Ok(SessionEnd::Disconnected(anyhow::anyhow!(
                            "WebSocket closed by server"
                        )));
                    }
                    Err(e) => {
                        return Ok(SessionEnd::Disconnected(e.context("WebSocket recv error")));
                    }
                }
            }
            outbound = out_rx.recv() => {
                match outbound {
                    Some(v) => {
                        if let Err(e) = sock.send_json(&v).await {
                            return Ok(SessionEnd::Disconnected(e.context("Relay send failed")));
                        }
                    }
                    None => return Ok(SessionEnd::ClientDropped),
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = sock.ping().await {
                    return Ok(SessionEnd::Disconnected(e.context("Heartbeat send failed")));
                }
            }
        }
    }
}
