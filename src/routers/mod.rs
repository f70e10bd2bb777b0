//! Request routing to registered backends.

pub mod error;
pub mod router;
pub mod streaming;

pub use router::{NO_HEALTHY_SERVERS, RequestRouter, RouteError, RouteResult};
pub use streaming::{GatewayStream, StreamError, StreamingRoute};
