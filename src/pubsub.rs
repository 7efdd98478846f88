//! Pub/sub modal overlay.
//!
//! While any subscription exists the connection is in subscriber mode:
//! the server pushes unsolicited frames, and the dispatcher must route
//! them to the event stream instead of pairing them with pending
//! commands. The subscription set survives reconnects and is replayed
//! before the connection is announced ready again.

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::resp::types::Reply;

/// How incoming replies are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum DispatchMode {
    /// Every reply pairs with the head of the pending queue.
    #[default]
    Pipeline,
    /// Pushes bypass the pending queue; only subscriber-family
    /// commands may be submitted.
    PubSub,
}

impl DispatchMode {
    pub fn is_pub_sub(self) -> bool {
        matches!(self, Self::PubSub)
    }
}

/// Subscription target kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubKind {
    Channel,
    Pattern,
}

impl SubKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Channel => "sub",
            Self::Pattern => "psub",
        }
    }
}

/// The set of live subscriptions, keyed `"sub <channel>"` /
/// `"psub <pattern>"`.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionSet {
    entries: BTreeSet<String>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: SubKind, target: &str) {
        self.entries.insert(format!("{} {}", kind.prefix(), target));
    }

    pub fn remove(&mut self, kind: SubKind, target: &str) {
        self.entries.remove(&format!("{} {}", kind.prefix(), target));
    }

    /// Drop every entry of one kind (argument-less unsubscribe).
    pub fn remove_all(&mut self, kind: SubKind) {
        let prefix = format!("{} ", kind.prefix());
        self.entries.retain(|entry| !entry.starts_with(&prefix));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Targets to replay after a reconnect, split by kind.
    pub fn split_targets(&self) -> (Vec<String>, Vec<String>) {
        let mut channels = Vec::new();
        let mut patterns = Vec::new();
        for entry in &self.entries {
            if let Some(target) = entry.strip_prefix("sub ") {
                channels.push(target.to_owned());
            } else if let Some(target) = entry.strip_prefix("psub ") {
                patterns.push(target.to_owned());
            }
        }
        (channels, patterns)
    }
}

// ── Push classification ────────────────────────────────────────────

/// The four subscription-control reply kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

impl ControlKind {
    fn from_bytes(name: &[u8]) -> Option<Self> {
        match name {
            b"subscribe" => Some(Self::Subscribe),
            b"unsubscribe" => Some(Self::Unsubscribe),
            b"psubscribe" => Some(Self::PSubscribe),
            b"punsubscribe" => Some(Self::PUnsubscribe),
            _ => None,
        }
    }

    pub fn sub_kind(self) -> SubKind {
        match self {
            Self::Subscribe | Self::Unsubscribe => SubKind::Channel,
            Self::PSubscribe | Self::PUnsubscribe => SubKind::Pattern,
        }
    }

    pub fn is_unsubscribe(self) -> bool {
        matches!(self, Self::Unsubscribe | Self::PUnsubscribe)
    }
}

/// A server push decoded from an array reply.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PubSubPush {
    Message {
        channel: String,
        payload: Bytes,
    },
    PMessage {
        pattern: String,
        channel: String,
        payload: Bytes,
    },
    Control {
        kind: ControlKind,
        target: Option<String>,
        count: i64,
    },
}

/// Decode an array reply into a pub/sub push, when it is one.
pub(crate) fn classify(reply: &Reply) -> Option<PubSubPush> {
    let Reply::Array(items) = reply else {
        return None;
    };
    let head = items.first()?.as_bytes()?;

    match head {
        b"message" if items.len() == 3 => Some(PubSubPush::Message {
            channel: stringify(&items[1])?,
            payload: payload_bytes(&items[2]),
        }),
        b"pmessage" if items.len() == 4 => Some(PubSubPush::PMessage {
            pattern: stringify(&items[1])?,
            channel: stringify(&items[2])?,
            payload: payload_bytes(&items[3]),
        }),
        _ => {
            let kind = ControlKind::from_bytes(head)?;
            if items.len() != 3 {
                return None;
            }
            let target = match &items[1] {
                Reply::Nil => None,
                other => Some(stringify(other)?),
            };
            let count = items[2].as_int()?;
            Some(PubSubPush::Control {
                kind,
                target,
                count,
            })
        }
    }
}

/// True for the message kinds that never consume a pending command.
pub(crate) fn is_async_push(reply: &Reply) -> bool {
    match reply {
        Reply::Array(items) => items
            .first()
            .and_then(Reply::as_bytes)
            .is_some_and(|head| head == b"message" || head == b"pmessage"),
        _ => false,
    }
}

fn stringify(reply: &Reply) -> Option<String> {
    reply
        .as_bytes()
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

/// Payload delivered exactly as received; non-bulk carriers (nil) map
/// to empty bytes.
fn payload_bytes(reply: &Reply) -> Bytes {
    match reply {
        Reply::Bulk(b) => b.clone(),
        Reply::Simple(s) | Reply::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
        _ => Bytes::new(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────
