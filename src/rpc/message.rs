//! Wire messages exchanged by the RPC layer.

use crate::error::{RemoteError, Result};
use crate::topology::CacheTopology;
use crate::types::{CacheStatusReport, Command};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Envelope for everything sent over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcMessage {
    /// A command. `request_id` is `None` for fire-and-forget sends.
    Request {
        request_id: Option<u64>,
        command: Command,
    },

    /// The answer to a request.
    Response { request_id: u64, response: Response },
}

impl RpcMessage {
    /// Create a request expecting a response.
    pub fn request(request_id: u64, command: Command) -> Self {
        RpcMessage::Request {
            request_id: Some(request_id),
            command,
        }
    }

    /// Create a one-way request.
    pub fn one_way(command: Command) -> Self {
        RpcMessage::Request {
            request_id: None,
            command,
        }
    }

    /// Create a response.
    pub fn response(request_id: u64, response: Response) -> Self {
        RpcMessage::Response {
            request_id,
            response,
        }
    }
}

/// One target's answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// The command executed.
    Success(ResponseValue),

    /// The command was not applicable on the target (e.g. not an owner).
    Unsuccessful,

    /// The command failed on the target.
    Exception(RemoteError),

    /// Synthetic: the target left before answering.
    Leaver,
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }

    pub fn is_leaver(&self) -> bool {
        matches!(self, Response::Leaver)
    }

    /// Shortcut for a successful response without a value.
    pub fn empty() -> Self {
        Response::Success(ResponseValue::Empty)
    }
}

/// Payload of a successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseValue {
    Empty,
    /// A value, `None` when the key was absent.
    Value(Option<Bytes>),
    /// A cache topology, answered to a join.
    Topology(Box<CacheTopology>),
    /// Caches run by a member, answered to a status request.
    CacheStatus(Vec<CacheStatusReport>),
}

/// Encode a message to bytes.
pub fn encode_message(msg: &RpcMessage) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<RpcMessage> {
    Ok(bincode::deserialize(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    #[test]
    fn test_request_serialization() {
        let msg = RpcMessage::request(42, Command::put("users", "k1", "v1").with_topology_id(7));
        let encoded = encode_message(&msg).unwrap();

        match decode_message(&encoded).unwrap() {
            RpcMessage::Request {
                request_id,
                command,
            } => {
                assert_eq!(request_id, Some(42));
                assert_eq!(command.topology_id, Some(7));
                assert_eq!(command.kind_name(), "put");
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_exception_response_keeps_cause_chain() {
        let error = RemoteError::wrapping(
            Some(Address::new(2)),
            "put failed",
            RemoteError::new(Some(Address::new(3)), "write skew"),
        );
        let msg = RpcMessage::response(1, Response::Exception(error.clone()));
        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();

        match decoded {
            RpcMessage::Response { response, .. } => {
                assert_eq!(response, Response::Exception(error));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        let err = decode_message(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, crate::error::Error::Serialization(_)));
    }
}
