//! Query execution engine.
//!
//! Connections, the per-query state machine, streaming result consumption
//! and catalog refresh coordination. Connector adapters plug in through the
//! traits in [`traits`]; everything above them is backend-agnostic.

pub mod catalog;
pub mod error;
pub mod executor;
pub mod reader;
pub mod registry;
pub mod state;
pub mod traits;
pub mod types;

pub use catalog::{CatalogLoader, CatalogSnapshot, CatalogTaskStatus, CatalogUpdateTask};
pub use error::{EngineError, EngineResult};
pub use executor::QueryExecutor;
pub use reader::StreamingResultReader;
pub use registry::{Connection, ConnectionRegistry};
pub use state::{ConnectionState, QueryAction, QueryExecution};
pub use traits::{QueryConnector, ResultStream};
pub use types::{
    ColumnInfo, ConnectionHealth, ConnectionId, ConnectionMetrics, QueryArgs, QueryId, QueryMetadata,
    QueryMetrics, QueryProgress, QueryStatus, Row, RowBatch, Schema, StreamMetrics, UpdateId,
    Value,
};
