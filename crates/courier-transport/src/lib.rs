//! Courier Transport Layer
//!
//! Correlates outbound requests with inbound responses over a duplex message
//! channel, independent of the underlying transport. The layer handles:
//! - Correlation id registration and exactly-once cleanup
//! - Routing inbound traffic into a response stream and an event stream
//! - Connection state tracking with replay-latest subscriptions
//! - Socket, HTTP, and cross-context bindings
//!
//! Bindings are decoupled from the dispatcher via the `ChannelBinding` trait.

pub mod binding;
pub mod channel;
pub mod demux;
pub mod diagnostics;
pub mod dispatch;
mod lifecycle;
pub mod post;
pub mod registry;
pub mod rest;
pub mod socket;
pub mod state;
pub mod transport;

pub use binding::ChannelBinding;
pub use channel::{Channel, ChannelOptions, KindNamer};
pub use demux::{Demultiplexer, Route};
pub use diagnostics::{Diagnostics, LogEntry, LogLevel, MemoryDiagnostics, TracingDiagnostics};
pub use dispatch::{SendOptions, send_request};
pub use post::{MessageBus, PostBinding, PostConfig};
pub use registry::CorrelationRegistry;
pub use rest::{RestBinding, RestConfig, RestRoute, RouteResolver};
pub use socket::{GRACEFUL_CLOSE_CODE, HANDSHAKE_TIMEOUT, SocketBinding, SocketConfig};
pub use state::{StateCell, StateSubscription};
pub use transport::{ErrorPredicate, Transport};
