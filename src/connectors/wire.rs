//! Message envelope for tunnel-backed query streams.
//!
//! Requests and result messages crossing the bridge are opaque binary blobs
//! to the transport layer. This module pins down their encoding (MessagePack
//! via rmp-serde) so the tunnel connectors and the streaming reader agree on
//! the frame contents.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{QueryProgress, RowBatch, Schema};

/// A database attached for the duration of one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedDatabase {
    pub path: String,
    pub alias: Option<String>,
}

/// The serialized request for the query-execution RPC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteQueryRequest {
    pub query: String,
    /// Recomputed per call; attachment changes apply to the next query.
    pub attached_databases: Vec<AttachedDatabase>,
}

/// One message of a query result stream, routed by tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultMessage {
    /// The schema/header message. Sent once, before any data.
    Header(Schema),
    /// A non-data progress update.
    Progress(QueryProgress),
    /// A data-bearing record batch.
    Data(RowBatch),
}

pub fn encode_request(request: &ExecuteQueryRequest) -> EngineResult<Bytes> {
    let buf = rmp_serde::to_vec(request)
        .map_err(|e| EngineError::internal(format!("failed to encode query request: {e}")))?;
    Ok(Bytes::from(buf))
}

pub fn decode_request(bytes: &[u8]) -> EngineResult<ExecuteQueryRequest> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| EngineError::execution_error(format!("malformed query request: {e}")))
}

pub fn encode_result_message(message: &ResultMessage) -> EngineResult<Bytes> {
    let buf = rmp_serde::to_vec(message)
        .map_err(|e| EngineError::internal(format!("failed to encode result message: {e}")))?;
    Ok(Bytes::from(buf))
}

pub fn decode_result_message(bytes: &[u8]) -> EngineResult<ResultMessage> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| EngineError::execution_error(format!("malformed result message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{ColumnInfo, Row, Value};

    #[test]
    fn request_round_trips() {
        let request = ExecuteQueryRequest {
            query: "SELECT 1".to_string(),
            attached_databases: vec![AttachedDatabase {
                path: "s3://bucket/db.file".to_string(),
                alias: Some("analytics".to_string()),
            }],
        };
        let decoded = decode_request(&encode_request(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn result_messages_route_by_tag() {
        let header = ResultMessage::Header(Schema {
            columns: vec![ColumnInfo {
                name: "id".to_string(),
                data_type: "bigint".to_string(),
                nullable: false,
            }],
        });
        let data = ResultMessage::Data(RowBatch {
            rows: vec![Row {
                values: vec![Value::Int(1)],
            }],
            data_bytes: 0,
        });
        let roundtrip =
            |m: &ResultMessage| decode_result_message(&encode_result_message(m).unwrap()).unwrap();
        assert_eq!(roundtrip(&header), header);
        assert_eq!(roundtrip(&data), data);
    }

    #[test]
    fn garbage_bytes_are_an_execution_error() {
        let err = decode_result_message(b"\xff\xff\xff").unwrap_err();
        assert!(matches!(err, EngineError::ExecutionError { .. }));
    }
}
