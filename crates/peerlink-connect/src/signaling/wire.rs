//! Relay wire format.
//!
//! Outbound frames carry one sealed primitive for a target peer. Inbound
//! frames are discriminated by their `info` field.

use peerlink_crypto::LinkKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LinkError, RelayErrorCode};
use crate::types::{IceCandidate, PeerConnectivity, PeerId, Primitive, RequestId, SessionDescription};

/// RPC method named in an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    SendOffer,
    SendAnswer,
    SendIceCandidate,
}

impl Method {
    pub const fn for_primitive(primitive: &Primitive) -> Self {
        match primitive {
            Primitive::Offer(_) => Self::SendOffer,
            Primitive::Answer(_) => Self::SendAnswer,
            Primitive::Candidate(_) => Self::SendIceCandidate,
        }
    }
}

/// Frame sent to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEnvelope {
    pub request_id: RequestId,
    pub method: Method,
    pub target_peer_id: PeerId,
    pub encrypted_payload: String,
}

impl OutgoingEnvelope {
    /// Seal `primitive` for `target` under a fresh request id.
    pub fn seal(key: &LinkKey, primitive: &Primitive, target: PeerId) -> Result<Self, LinkError> {
        let plaintext = encode_primitive(primitive)?;
        Ok(Self {
            request_id: RequestId::generate(),
            method: Method::for_primitive(primitive),
            target_peer_id: target,
            encrypted_payload: key.seal_hex(&plaintext)?,
        })
    }
}

/// Method and payload of a frame forwarded from the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteData {
    pub method: Method,
    pub encrypted_payload: String,
}

/// Frame received from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "info", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum IncomingFrame {
    Confirmation {
        request_id: RequestId,
    },
    MissingRemoteClientError {
        request_id: RequestId,
    },
    ValidationError {
        request_id: RequestId,
        #[serde(default)]
        error: Value,
    },
    InvalidMessageError {
        #[serde(default)]
        error: Value,
        #[serde(default)]
        data: Value,
    },
    RemoteData {
        request_id: RequestId,
        source_peer_id: PeerId,
        data: RemoteData,
    },
    RemoteClientJustConnected {
        source_peer_id: PeerId,
    },
    RemoteClientIsAlreadyConnected {
        source_peer_id: PeerId,
    },
    RemoteClientDisconnected {
        source_peer_id: PeerId,
    },
}

/// What an inbound frame means once classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ack {
        request_id: RequestId,
        result: Result<(), RelayErrorCode>,
    },
    /// A relay error that cannot be tied to a request.
    Uncorrelated(RelayErrorCode),
    Remote {
        source: PeerId,
        data: RemoteData,
    },
    Connectivity {
        peer: PeerId,
        status: PeerConnectivity,
    },
}

impl IncomingFrame {
    pub fn parse(text: &str) -> Result<Self, LinkError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn classify(self) -> Inbound {
        match self {
            Self::Confirmation { request_id } => Inbound::Ack {
                request_id,
                result: Ok(()),
            },
            Self::MissingRemoteClientError { request_id } => Inbound::Ack {
                request_id,
                result: Err(RelayErrorCode::RemotePeerUnreachable),
            },
            Self::ValidationError { request_id, error } => Inbound::Ack {
                request_id,
                result: Err(RelayErrorCode::Validation(render_reason(&error))),
            },
            Self::InvalidMessageError { error, data } => {
                let code = RelayErrorCode::InvalidMessage(render_reason(&error));
                match data.get("requestId").and_then(Value::as_str) {
                    Some(id) => Inbound::Ack {
                        request_id: RequestId::from(id),
                        result: Err(code),
                    },
                    None => Inbound::Uncorrelated(code),
                }
            }
            Self::RemoteData {
                source_peer_id,
                data,
                ..
            } => Inbound::Remote {
                source: source_peer_id,
                data,
            },
            Self::RemoteClientJustConnected { source_peer_id } => Inbound::Connectivity {
                peer: source_peer_id,
                status: PeerConnectivity::JustConnected,
            },
            Self::RemoteClientIsAlreadyConnected { source_peer_id } => Inbound::Connectivity {
                peer: source_peer_id,
                status: PeerConnectivity::AlreadyConnected,
            },
            Self::RemoteClientDisconnected { source_peer_id } => Inbound::Connectivity {
                peer: source_peer_id,
                status: PeerConnectivity::Disconnected,
            },
        }
    }
}

fn render_reason(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Null => "unspecified".to_string(),
        other => other.to_string(),
    }
}

/// Plaintext JSON for a primitive, before sealing.
pub fn encode_primitive(primitive: &Primitive) -> Result<Vec<u8>, LinkError> {
    let bytes = match primitive {
        Primitive::Offer(d) | Primitive::Answer(d) => serde_json::to_vec(d)?,
        Primitive::Candidate(c) => serde_json::to_vec(c)?,
    };
    Ok(bytes)
}

/// Open and decode the payload of a remote frame.
pub fn decode_remote(key: &LinkKey, data: &RemoteData) -> Result<Primitive, LinkError> {
    let plaintext = key.open_hex(&data.encrypted_payload)?;
    let primitive = match data.method {
        Method::SendOffer => Primitive::Offer(serde_json::from_slice::<SessionDescription>(&plaintext)?),
        Method::SendAnswer => {
            Primitive::Answer(serde_json::from_slice::<SessionDescription>(&plaintext)?)
        }
        Method::SendIceCandidate => {
            Primitive::Candidate(serde_json::from_slice::<IceCandidate>(&plaintext)?)
        }
    };
    Ok(primitive)
}
