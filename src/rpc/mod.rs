//! Request/response layer over an external transport.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────── RpcManager ─────────────────────────────┐
//! │  invoke_command / staggered / invoke_commands / send_to*             │
//! │        │                                                             │
//! │        ▼                                                             │
//! │  interceptor chain ── TopologyIdInterceptor, InvocationCounter, ...  │
//! │        │                                                             │
//! │        ▼                                                             │
//! │  RequestRepository ── request_id → MultiTargetRequest ── collector   │
//! │        │                      ▲            ▲                         │
//! │        ▼                      │            │                         │
//! │   Transport::send      handle_response  on_view_change / timeout     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Targets missing from the view answer with a synthetic
//! [`Response::Leaver`] at once. Every request ends exactly once: by
//! short-circuit, by its last response, by failure, or by timeout.

pub mod collector;
pub mod interceptor;
mod manager;
pub mod message;
pub mod request;
pub mod transport;

pub use collector::{
    FirstSuccessCollector, MapResponseCollector, PassthroughResponseCollector, ResponseCollector,
    SingleResponseCollector, VoidResponseCollector,
};
pub use interceptor::{
    InvocationContext, InvocationCounter, RpcInterceptor, TopologyIdInterceptor, TopologyIdSource,
};
pub use manager::{RpcManager, RpcOptions};
pub use message::{decode_message, encode_message, Response, ResponseValue, RpcMessage};
pub use request::{MultiTargetRequest, RequestHandle, RequestRepository, RpcFuture};
pub use transport::{InboundHandler, Transport};
