//! Call subsystem — signaling messages, session state machine, peer
//! connections, and media acquisition.
//!
//! The modules here coordinate a one-to-one call between two Kaiwa users:
//! control messages travel over the realtime relay ([`Signaling`]), media
//! flows through the peer rendezvous service ([`peer`]), and the session
//! lifecycle is owned by [`session::CallController`].

pub mod media;
pub mod noise;
pub mod peer;
pub mod rendezvous;
pub mod session;

#[cfg(feature = "audio")]
pub mod audio;
#[cfg(feature = "video-capture")]
pub mod camera;

#[cfg(test)]
pub(crate) mod testutil;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

/// Requested media for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn is_video(self) -> bool {
        matches!(self, CallType::Video)
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallType::Audio => write!(f, "audio"),
            CallType::Video => write!(f, "video"),
        }
    }
}

/// Session lifecycle phase.
///
/// `Ended` is transient: teardown publishes it, releases resources, then
/// returns to `Idle` in the same handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    RingingAsCaller,
    RingingAsReceiver,
    ConnectingAsCaller,
    ConnectingAsReceiver,
    InCall,
    Ended,
}

/// Control messages exchanged through the realtime relay.
///
/// On the wire each message is a JSON envelope `{"event", "to"/"from",
/// "data"}`; the relay fills in `from` on delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Ring the counterpart.
    #[serde(rename_all = "camelCase")]
    CallRequest { call_type: CallType },
    /// Caller's transport identity, sent once its peer endpoint is live.
    #[serde(rename_all = "camelCase")]
    PeerIdOffer {
        transport_id: String,
        call_type: CallType,
    },
    /// Receiver's accept/decline decision.
    #[serde(rename_all = "camelCase")]
    CallAnswer { accepted: bool },
    /// Hangup or fatal error, sent by either side.
    #[serde(rename_all = "camelCase")]
    CallEnded { reason: Option<String> },
}

/// A call-control message delivered by the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEvent {
    /// Participant id of the sender.
    pub from: String,
    pub payload: SignalPayload,
}

/// Build the outbound JSON envelope for a signaling message.
pub fn signal_envelope(to: &str, payload: &SignalPayload) -> serde_json::Value {
    // SignalPayload serializes to {"event": ..., "data": ...}; the relay
    // routes on the sibling "to" field.
    let mut v = serde_json::to_value(payload).expect("signal payload serializes");
    v["to"] = serde_json::Value::String(to.to_string());
    v
}

/// Try to parse a relay frame into a call-control event.
///
/// Accepts either the envelope itself or a wrapper whose `body` field holds
/// the envelope (possibly as a JSON string) — the relay re-wraps frames it
/// forwards from other services.
pub fn parse_signal_event(v: &serde_json::Value) -> Option<SignalEvent> {
    if v.get("event").is_some() {
        let from = v.get("from")?.as_str()?.to_string();
        let payload: SignalPayload = serde_json::from_value(v.clone()).ok()?;
        return Some(SignalEvent { from, payload });
    }

    if let Some(body) = v.get("body") {
        if let Some(body_str) = body.as_str() {
            let inner: serde_json::Value = serde_json::from_str(body_str).ok()?;
            return parse_signal_event(&inner);
        }
        return parse_signal_event(body);
    }

    None
}

/// Signaling transport consumed by the call core.
///
/// Backed by [`crate::relay::SignalingClient`] in production and by an
/// in-memory hub in tests. Delivery is best-effort: `send` refuses when the
/// relay is down, and the session state machine owns all retry policy.
#[async_trait]
pub trait Signaling: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Watch channel that flips on connect/disconnect.
    fn connected_watch(&self) -> watch::Receiver<bool>;

    /// Send a control message addressed to `to`. Fails when disconnected.
    async fn send(&self, to: &str, payload: SignalPayload) -> anyhow::Result<()>;

    /// Subscribe to inbound call-control events.
    fn subscribe(&self) -> broadcast::Receiver<SignalEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let payload = SignalPayload::PeerIdOffer {
            transport_id: "aiko-1718000000000-0".into(),
            call_type: CallType::Video,
        };
        let mut v = signal_envelope("ben", &payload);
        assert_eq!(v["event"], "peer-id-offer");
        assert_eq!(v["to"], "ben");
        assert_eq!(v["data"]["transportId"], "aiko-1718000000000-0");
        assert_eq!(v["data"]["callType"], "video");

        // The relay rewrites to -> from on delivery.
        v.as_object_mut().unwrap().remove("to");
        v["from"] = serde_json::Value::String("aiko".into());
        let ev = parse_signal_event(&v).expect("parses");
        assert_eq!(ev.from, "aiko");
        assert_eq!(ev.payload, payload);
    }

    #[test]
    fn parse_tolerates_body_wrapper() {
        let inner = serde_json::json!({
            "event": "call-request",
            "from": "ben",
            "data": { "callType": "audio" }
        });
        let wrapped = serde_json::json!({ "id": 7, "body": inner.to_string() });
        let ev = parse_signal_event(&wrapped).expect("parses through wrapper");
        assert_eq!(ev.from, "ben");
        assert_eq!(
            ev.payload,
            SignalPayload::CallRequest {
                call_type: CallType::Audio
            }
        );
    }

    #[test]
    fn parse_rejects_non_call_frames() {
        let v = serde_json::json!({ "ping": true });
        assert!(parse_signal_event(&v).is_none());

        let v = serde_json::json!({ "event": "chat-message", "from": "ben", "data": {} });
        assert!(parse_signal_event(&v).is_none());
    }
}
