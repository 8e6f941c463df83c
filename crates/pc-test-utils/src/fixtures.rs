//! Request params fixtures
//!
//! Builders for the params objects clients send, so tests read as the
//! protocol flow rather than JSON literals.

use serde_json::{json, Value};

/// `register` params. `stable_user_id` of `None` asks the server to mint one.
pub fn register(name: &str, stable_user_id: Option<&str>) -> Value {
    match stable_user_id {
        Some(id) => json!({ "name": name, "stableUserId": id }),
        None => json!({ "name": name }),
    }
}

/// `updateStreamState` params going live with camera and microphone.
pub fn go_live(platform: &str) -> Value {
    json!({
        "isStreaming": true,
        "platform": platform,
        "settings": { "camera": true, "microphone": true }
    })
}

/// `updateStreamState` params stopping the stream.
pub fn go_offline() -> Value {
    json!({ "isStreaming": false })
}

pub fn open_transport(direction: &str) -> Value {
    json!({ "direction": direction })
}

pub fn connect_transport(transport_id: &str) -> Value {
    json!({
        "transportId": transport_id,
        "dtlsParameters": { "role": "client", "fingerprints": [] }
    })
}

/// `produce` params for a minimal RTP send description.
pub fn produce(kind: &str) -> Value {
    json!({
        "kind": kind,
        "rtpParameters": { "codecs": [], "encodings": [{ "ssrc": 1111 }] }
    })
}

/// `consume` params with receive capabilities matching the server's codecs.
pub fn consume(producer_id: &str) -> Value {
    json!({
        "producerId": producer_id,
        "rtpCapabilities": {
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
                { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
            ],
            "headerExtensions": []
        }
    })
}

pub fn producer_ref(producer_id: &str) -> Value {
    json!({ "producerId": producer_id })
}

pub fn consumer_ref(consumer_id: &str) -> Value {
    json!({ "consumerId": consumer_id })
}

pub fn peer_ref(connection_id: &str) -> Value {
    json!({ "connectionId": connection_id })
}
