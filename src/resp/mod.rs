//! RESP wire protocol: reply parsing and request serialization.

pub mod parser;
pub mod types;
pub mod writer;

pub use parser::{ParserEvent, ParserKind, ReplyParser};
pub use types::Reply;
