//! WebSocket gateway: connection lifecycle, session registry and envelope routing.

pub mod connection;
pub mod error;
pub mod images;
pub mod profiles;
pub mod registry;
pub mod router;

pub use registry::{SessionHandle, SessionRegistry};
pub use router::MessageRouter;
