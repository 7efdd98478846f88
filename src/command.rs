//! Command records and the static command catalog.
//!
//! A [`Command`] is created when the user submits a request and is
//! owned by exactly one queue (offline or pending) until its reply is
//! dispatched or it is flushed with an error. The catalog replaces a
//! load-time generated registry: a sorted static table with the
//! per-command metadata the client surface needs.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{RedlinkError, Result};
use crate::resp::types::Reply;

/// One command argument: text, or a raw byte payload.
///
/// Blob arguments force the segmented encoding path so large payloads
/// are handed to the transport without an intermediate copy.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Text(String),
    Blob(Bytes),
}

impl Arg {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Blob(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Blob(b) => b,
        }
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, Self::Blob(_))
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<u64> for Arg {
    fn from(value: u64) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<usize> for Arg {
    fn from(value: usize) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Bytes> for Arg {
    fn from(value: Bytes) -> Self {
        Self::Blob(value)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(Bytes::from(value))
    }
}

impl From<&[u8]> for Arg {
    fn from(value: &[u8]) -> Self {
        Self::Blob(Bytes::copy_from_slice(value))
    }
}

/// Where a reply (or failure) for a command record is delivered.
#[derive(Debug)]
pub(crate) enum Completion {
    /// Fire-and-forget: success is discarded, failure goes to the
    /// error event.
    Discard,
    /// One-shot completion handed back to the submitting caller.
    Reply(oneshot::Sender<Result<Reply>>),
    /// The reply feeds the engine's own state machine.
    Internal(InternalOp),
}

impl Completion {
    /// Resolve with a result. Dropped receivers are fine; internal
    /// completions must be routed by the engine before calling this.
    pub(crate) fn resolve(self, result: Result<Reply>) {
        match self {
            Self::Discard | Self::Internal(_) => {}
            Self::Reply(tx) => {
                let _ = tx.send(result);
            }
        }
    }

    pub(crate) fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// Engine-issued commands whose replies drive lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalOp {
    /// AUTH handshake reply.
    Auth,
    /// INFO readiness probe reply.
    ReadyCheck,
    /// SELECT issued while restoring state after a reconnect.
    RestoreSelect,
    /// MONITOR re-issued while restoring state after a reconnect.
    RestoreMonitor,
    /// SUBSCRIBE/PSUBSCRIBE re-issued after a reconnect; readiness is
    /// announced once every confirmation has arrived.
    Resubscribe,
}

/// A submitted command travelling through the engine.
#[derive(Debug)]
pub(crate) struct Command {
    /// Lowercase command name.
    pub name: String,
    pub args: Vec<Arg>,
    pub completion: Completion,
    /// Reply is a pub/sub control confirmation, not a pipeline reply.
    pub sub_command: bool,
    /// Bypass the readiness gate (handshake traffic).
    pub send_anyway: bool,
}

impl Command {
    pub(crate) fn new(name: impl Into<String>, args: Vec<Arg>, completion: Completion) -> Self {
        let mut name = name.into();
        name.make_ascii_lowercase();
        Self {
            name,
            args,
            completion,
            sub_command: false,
            send_anyway: false,
        }
    }

    /// Engine-internal command bypassing the readiness gate.
    pub(crate) fn internal(name: &str, args: Vec<Arg>, op: InternalOp) -> Self {
        let mut cmd = Self::new(name, args, Completion::Internal(op));
        cmd.send_anyway = true;
        cmd
    }

    /// True when any argument is a raw byte payload.
    pub(crate) fn buffer_args(&self) -> bool {
        self.args.iter().any(Arg::is_blob)
    }

    /// Fail the command, consuming it.
    pub(crate) fn fail(self, err: RedlinkError) -> Option<RedlinkError> {
        match self.completion {
            Completion::Reply(tx) => {
                if let Err(unsent) = tx.send(Err(err)) {
                    // Caller went away; nobody to tell.
                    drop(unsent);
                }
                None
            }
            // No callback: the caller expects the error event instead.
            Completion::Discard | Completion::Internal(_) => Some(err),
        }
    }
}

// ── Catalog ────────────────────────────────────────────────────────

/// Static metadata for one server command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub name: &'static str,
    /// Command does not modify the keyspace.
    pub readonly: bool,
    /// Position of the first key argument (0 = command takes no keys).
    pub first_key: usize,
}

const fn cmd(name: &'static str, readonly: bool, first_key: usize) -> CommandInfo {
    CommandInfo {
        name,
        readonly,
        first_key,
    }
}

/// The command catalog, sorted by name for binary-search lookup.
pub static COMMANDS: &[CommandInfo] = &[
    cmd("append", false, 1),
    cmd("auth", false, 0),
    cmd("bgrewriteaof", false, 0),
    cmd("bgsave", false, 0),
    cmd("bitcount", true, 1),
    cmd("blpop", false, 1),
    cmd("brpop", false, 1),
    cmd("dbsize", true, 0),
    cmd("decr", false, 1),
    cmd("decrby", false, 1),
    cmd("del", false, 1),
    cmd("echo", true, 0),
    cmd("eval", false, 0),
    cmd("evalsha", false, 0),
    cmd("exists", true, 1),
    cmd("expire", false, 1),
    cmd("expireat", false, 1),
    cmd("flushall", false, 0),
    cmd("flushdb", false, 0),
    cmd("get", true, 1),
    cmd("getrange", true, 1),
    cmd("getset", false, 1),
    cmd("hdel", false, 1),
    cmd("hexists", true, 1),
    cmd("hget", true, 1),
    cmd("hgetall", true, 1),
    cmd("hincrby", false, 1),
    cmd("hkeys", true, 1),
    cmd("hlen", true, 1),
    cmd("hmget", true, 1),
    cmd("hmset", false, 1),
    cmd("hset", false, 1),
    cmd("hsetnx", false, 1),
    cmd("hvals", true, 1),
    cmd("incr", false, 1),
    cmd("incrby", false, 1),
    cmd("incrbyfloat", false, 1),
    cmd("info", true, 0),
    cmd("keys", true, 0),
    cmd("lindex", true, 1),
    cmd("llen", true, 1),
    cmd("lpop", false, 1),
    cmd("lpush", false, 1),
    cmd("lrange", true, 1),
    cmd("lrem", false, 1),
    cmd("lset", false, 1),
    cmd("ltrim", false, 1),
    cmd("mget", true, 1),
    cmd("monitor", true, 0),
    cmd("mset", false, 1),
    cmd("msetnx", false, 1),
    cmd("persist", false, 1),
    cmd("pexpire", false, 1),
    cmd("ping", true, 0),
    cmd("psetex", false, 1),
    cmd("psubscribe", true, 0),
    cmd("pttl", true, 1),
    cmd("publish", false, 0),
    cmd("punsubscribe", true, 0),
    cmd("quit", true, 0),
    cmd("randomkey", true, 0),
    cmd("rename", false, 1),
    cmd("renamenx", false, 1),
    cmd("rpop", false, 1),
    cmd("rpoplpush", false, 1),
    cmd("rpush", false, 1),
    cmd("sadd", false, 1),
    cmd("scard", true, 1),
    cmd("script", false, 0),
    cmd("sdiff", true, 1),
    cmd("select", false, 0),
    cmd("set", false, 1),
    cmd("setex", false, 1),
    cmd("setnx", false, 1),
    cmd("setrange", false, 1),
    cmd("sinter", true, 1),
    cmd("sismember", true, 1),
    cmd("smembers", true, 1),
    cmd("spop", false, 1),
    cmd("srandmember", true, 1),
    cmd("srem", false, 1),
    cmd("strlen", true, 1),
    cmd("subscribe", true, 0),
    cmd("sunion", true, 1),
    cmd("ttl", true, 1),
    cmd("type", true, 1),
    cmd("unsubscribe", true, 0),
    cmd("zadd", false, 1),
    cmd("zcard", true, 1),
    cmd("zincrby", false, 1),
    cmd("zrange", true, 1),
    cmd("zrangebyscore", true, 1),
    cmd("zrank", true, 1),
    cmd("zrem", false, 1),
    cmd("zscore", true, 1),
];

/// Look a command up by lowercase name.
pub fn lookup(name: &str) -> Option<&'static CommandInfo> {
    COMMANDS
        .binary_search_by(|info| info.name.cmp(name))
        .ok()
        .map(|idx| &COMMANDS[idx])
}

/// True for the four subscription-management commands.
pub fn is_subscribe_family(name: &str) -> bool {
    matches!(
        name,
        "subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe"
    )
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_sorted_and_unique() {
        for pair in COMMANDS.windows(2) {
            assert!(
                pair[0].name < pair[1].name,
                "catalog out of order at {}",
                pair[1].name
            );
        }
    }

    #[test]
    fn lookup_hits() {
        let get = lookup("get").unwrap();
        assert!(get.readonly);
        assert_eq!(get.first_key, 1);

        let set = lookup("set").unwrap();
        assert!(!set.readonly);

        assert_eq!(lookup("info").unwrap().first_key, 0);
        assert!(lookup("nosuchcommand").is_none());
    }

    #[test]
    fn subscribe_family() {
        assert!(is_subscribe_family("subscribe"));
        assert!(is_subscribe_family("punsubscribe"));
        assert!(!is_subscribe_family("publish"));
        assert!(!is_subscribe_family("get"));
    }

    #[test]
    fn arg_conversions() {
        assert_eq!(Arg::from("hi"), Arg::Text("hi".into()));
        assert_eq!(Arg::from(42i64), Arg::Text("42".into()));
        assert_eq!(Arg::from(7usize), Arg::Text("7".into()));
        assert_eq!(
            Arg::from(Bytes::from_static(b"\x00\x01")),
            Arg::Blob(Bytes::from_static(b"\x00\x01"))
        );
        assert!(Arg::from(vec![1u8, 2]).is_blob());
        assert!(!Arg::from("text").is_blob());
    }

    #[test]
    fn command_name_lowercased() {
        let cmd = Command::new("GET", vec![Arg::from("key")], Completion::Discard);
        assert_eq!(cmd.name, "get");
        assert!(!cmd.buffer_args());
        assert!(!cmd.send_anyway);
    }

    #[test]
    fn buffer_args_detection() {
        let cmd = Command::new(
            "set",
            vec![Arg::from("key"), Arg::from(vec![0u8, 1])],
            Completion::Discard,
        );
        assert!(cmd.buffer_args());
    }

    #[test]
    fn internal_commands_bypass_gate() {
        let cmd = Command::internal("auth", vec![Arg::from("pw")], InternalOp::Auth);
        assert!(cmd.send_anyway);
        assert!(cmd.completion.is_internal());
    }

    #[test]
    fn fail_without_callback_returns_error() {
        let cmd = Command::new("get", vec![], Completion::Discard);
        let err = cmd.fail(RedlinkError::NotWritable);
        assert!(matches!(err, Some(RedlinkError::NotWritable)));
    }

    #[tokio::test]
    async fn fail_with_callback_delivers_error() {
        let (tx, rx) = oneshot::channel();
        let cmd = Command::new("get", vec![], Completion::Reply(tx));
        assert!(cmd.fail(RedlinkError::NotWritable).is_none());
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(RedlinkError::NotWritable)));
    }
}
