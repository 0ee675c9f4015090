//! Message bus and adapter boundary.
//!
//! Adapters hand envelopes to [`MessageRuntime::push_incoming`]; the runtime
//! routes them per-stream through hooks and routes, and the reply path sends
//! outbound envelopes through a registered [`AdapterSink`]. Subprocess and
//! WebSocket adapters share the [`frame::WireFrame`] codec.

pub mod frame;
pub mod http;
pub mod runtime;
pub mod sink;
pub mod ws;

pub use frame::{FrameKind, WireFrame};
pub use runtime::{MessageRuntime, Route, RouteClass, RouteHandler};
pub use sink::{AdapterSink, InProcessSink, SubprocessSink};
