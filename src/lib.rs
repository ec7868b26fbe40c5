//! # markrpc
//!
//! Symmetric, transport-agnostic RPC framework: length-delimited packets
//! prefixed by a per-channel mark, correlated by a per-pipeline serial
//! number, dispatched by a callee-assigned function number.
//!
//! ## Architecture
//!
//! - **Caller** ([`Pipeline`]): pending-call table keyed by serial number,
//!   per-call timeout, name → number discovery over the reserved
//!   `FetchFuncList` call.
//! - **Callee** ([`BaseService`]): read loop that decodes, dispatches to a
//!   handler table, and replies with the request's header plus a status
//!   code.
//! - **Transport** ([`net::Net`]): any duplex conduit that moves one
//!   opaque packet at a time.
//! - **Payloads**: opaque to the core; marshalled through pluggable
//!   [`interceptor`] hooks (JSON and MessagePack ship in the box).
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use markrpc::interceptor::JsonInterceptor;
//! use markrpc::{Client, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> markrpc::Result<()> {
//!     let client = Client::new();
//!     let pipeline = client.add_pipeline(net, 1, 1, "game", 5);
//!     pipeline.set_interceptor(Arc::new(JsonInterceptor));
//!     pipeline.fetch_func_list().await?;
//!
//!     let mut out = Echo::default();
//!     let code = pipeline.call("echo", &req, Some(&mut out)).await?;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod net;
pub mod pipeline;
pub mod proto;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod util;

pub use builder::Builder;
pub use error::{Result, RpcError};
pub use pipeline::Pipeline;
pub use registry::{Client, Server};
pub use service::{BaseService, RpcHandler, Service};
