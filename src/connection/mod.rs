//! Transport and connection lifecycle.

pub mod engine;
pub mod transport;

pub use engine::ConnectionStatus;
pub use transport::ConnectionId;
