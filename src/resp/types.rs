use bytes::Bytes;

/// A decoded server reply.
///
/// The parser produces the five wire frames (`Simple`, `Error`, `Int`,
/// `Bulk`, `Array`, with `Nil` standing in for `$-1` and `*-1`). The
/// dispatcher may rewrite `Bulk` into `Text` when string conversion is
/// enabled for the command, and an HGETALL array into `Map`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:1000\r\n`
    Int(i64),
    /// `$6\r\nfoobar\r\n` (raw payload bytes)
    Bulk(Bytes),
    /// A bulk payload converted to a string at dispatch time.
    Text(String),
    /// `*2\r\n…`
    Array(Vec<Reply>),
    /// Field/value mapping built from an even-length HGETALL array.
    Map(Vec<(String, Reply)>),
    /// `$-1\r\n` or `*-1\r\n`
    Nil,
}

impl Reply {
    /// Interpret as a UTF-8 string, whatever the carrier variant.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Simple(s) | Self::Text(s) | Self::Error(s) => Some(s),
            Self::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Interpret as raw bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bulk(b) => Some(b),
            Self::Simple(s) | Self::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Consume as an array.
    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Consume as a field/value mapping.
    pub fn into_map(self) -> Option<Vec<(String, Reply)>> {
        match self {
            Self::Map(pairs) => Some(pairs),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Variant name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Simple(_) => "simple_string",
            Self::Error(_) => "error",
            Self::Int(_) => "integer",
            Self::Bulk(_) => "bulk_string",
            Self::Text(_) => "string",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Nil => "nil",
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
