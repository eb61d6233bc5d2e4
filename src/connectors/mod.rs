//! Connector adapters, one per backend family.
//!
//! Each adapter fulfills the engine's `QueryConnector` contract; the variant
//! is selected once per connection at setup, never by inspecting payloads at
//! runtime. Bridge-reachable backends route through `transport`; the
//! distributed SQL engine speaks its native REST protocol directly.

pub mod datacloud;
pub mod demo;
pub mod distsql;
pub mod tunnel;
pub mod wire;

pub use datacloud::{AuthState, DataCloudConfig, DataCloudConnector, TokenProvider};
pub use demo::{DemoConfig, DemoConnector};
pub use distsql::{DistSqlConfig, DistSqlConnector, ReqwestStatementApi, StatementApi};
pub use tunnel::{TunnelConfig, TunnelConnector, TunnelContextProvider};
pub use wire::{AttachedDatabase, ExecuteQueryRequest, ResultMessage};
