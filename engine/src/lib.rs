//! Qlik Engine API client: WebSocket transport negotiation, JSON-RPC
//! correlation, hypercube query compilation, matrix decoding, session
//! object lifecycle and document-structure analysis.

pub mod analyze;
pub mod client;
pub mod decode;
pub mod error;
pub mod query;
pub mod rpc;
pub mod session;
pub mod transport;

pub use client::EngineClient;
pub use decode::{Cell, SelectionState, decode_list_values, decode_rows};
pub use error::EngineError;
pub use query::{DimensionSpec, HypercubeQuery, ListObjectQuery, MeasureSpec, SortRule};
pub use rpc::{Connection, FrameTransport, GLOBAL_HANDLE};
pub use session::{SessionLayout, with_session_layout};
pub use transport::Transport;
