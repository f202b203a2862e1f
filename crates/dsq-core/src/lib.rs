//! dsq-core - Core types and pure stages of the datasource query pipeline
//!
//! This crate holds everything that does not need a network or a runtime:
//!
//! - [`models`]: requests, queries, frames, results and health shapes
//! - [`classify`]: turns any failure shape into one [`DataQueryError`]
//! - [`normalize`]: parses a raw `/api/ds/query` response into a [`QueryResult`]
//! - [`live`]: live channel addresses, frame partitioning and buffering options
//! - [`streaming`]: the buffer that applies live updates to a frame
//! - [`backend`]: the transport and live service traits the client crate implements
//! - [`datasource`]: datasource resolution and per-datasource hooks
//!
//! ```text
//! raw response ──▶ normalize ──▶ QueryResult ──▶ live::partition
//!                     │                              │
//!                 classify                 static / channel frames
//! ```

pub mod backend;
pub mod classify;
pub mod datasource;
pub mod decode;
pub mod error;
pub mod live;
pub mod models;
pub mod normalize;
pub mod streaming;

pub use backend::{
    BackendQueryRequest, BackendTransport, LiveDataStreamRequest, LiveService, QueryBody,
    ResourceResponse, ResultStream,
};
pub use classify::{classify, classify_for_health_test, classify_transport};
pub use datasource::{DataSourceHooks, DataSourceInstance, DataSourceRegistry, DataSourceResolver};
pub use error::{DispatchError, DispatchResult, TransportError};
pub use live::{
    partition, standard_stream_options_provider, LiveChannelAddress, StreamOptionsProvider,
    StreamingFrameAction, StreamingFrameOptions,
};
pub use models::*;
pub use normalize::{normalize, RawBackendResponse};
pub use streaming::StreamingFrame;
