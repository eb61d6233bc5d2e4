//! Transport tunnel for gRPC-style streaming calls.
//!
//! The host process exposes a restricted HTTP surface that tunnels channel
//! creation, server-streaming calls and batched reads. This module owns the
//! client side of that surface: framing, flush-event handling and structured
//! transport errors.

pub mod bridge;
pub mod error;
pub mod frame;
pub mod http;

pub use bridge::{
    BridgeChannel, BridgeClient, BridgeStream, ReadOptions, StreamArgs, StreamBatch,
    StreamBatchEvent,
};
pub use error::{TransportError, TransportResult};
pub use http::{BridgeHttp, HttpRequest, HttpResponse, ReqwestBridgeHttp};
