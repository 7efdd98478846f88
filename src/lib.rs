//! Async Redis client core.
//!
//! One connection, many outstanding commands: requests are framed and
//! pipelined over a single duplex transport, replies are matched back
//! first-in first-out, pub/sub pushes are routed to an event stream,
//! and lost connections reconnect with exponential backoff while
//! queued work waits in an offline queue.
//!
//! ```no_run
//! use redlink::{create_client, ClientOptions, Endpoint};
//!
//! # async fn demo() -> redlink::Result<()> {
//! let client = create_client(Endpoint::tcp("127.0.0.1", 6379), ClientOptions::default());
//! client.set("foo", "bar").await?;
//! let reply = client.get("foo").await?;
//! assert_eq!(reply.as_str(), Some("bar"));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub(crate) mod pubsub;
pub(crate) mod queue;
pub mod resp;
pub mod server_info;

pub use client::{create_client, Client};
pub use command::{lookup, Arg, CommandInfo, COMMANDS};
pub use config::{ClientOptions, Endpoint, IpFamily};
pub use connection::{ConnectionId, ConnectionStatus};
pub use error::{RedlinkError, Result};
pub use events::Event;
pub use resp::parser::ParserKind;
pub use resp::types::Reply;
pub use server_info::ServerInfo;
