//! Parsed `INFO` reply.
//!
//! The readiness probe sends `INFO` and inspects the result before the
//! connection is declared usable: a server still loading its dataset
//! postpones readiness by its advertised ETA.

use std::collections::HashMap;

/// `key:value` fields from an `INFO` reply.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    fields: HashMap<String, String>,
    /// `redis_version` as a numeric triple, when present and parseable.
    pub version: Option<(u64, u64, u64)>,
}

impl ServerInfo {
    /// Parse the CRLF-separated `key:value` lines of an INFO reply.
    /// Comment lines (`#`) and malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut fields = HashMap::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.to_owned(), value.to_owned());
            }
        }

        let version = fields.get("redis_version").and_then(|v| {
            let mut parts = v.split('.').map(|p| p.parse::<u64>().ok());
            Some((parts.next()??, parts.next()??, parts.next().flatten().unwrap_or(0)))
        });

        Self { fields, version }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// True while the server reports `loading:1`.
    pub fn is_loading(&self) -> bool {
        matches!(self.get("loading"), Some(v) if v != "0")
    }

    /// Advertised seconds until loading completes.
    pub fn loading_eta_seconds(&self) -> Option<u64> {
        self.get("loading_eta_seconds")?.parse().ok()
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# Server\r\nredis_version:3.2.11\r\nredis_mode:standalone\r\n\r\n# Persistence\r\nloading:0\r\n";

    #[test]
    fn parses_fields_and_version() {
        let info = ServerInfo::parse(SAMPLE);
        assert_eq!(info.get("redis_mode"), Some("standalone"));
        assert_eq!(info.version, Some((3, 2, 11)));
        assert!(!info.is_loading());
        assert_eq!(info.get("# Server"), None);
    }

    #[test]
    fn loading_with_eta() {
        let info =
            ServerInfo::parse("redis_version:2.8.0\r\nloading:1\r\nloading_eta_seconds:42\r\n");
        assert!(info.is_loading());
        assert_eq!(info.loading_eta_seconds(), Some(42));
    }

    #[test]
    fn missing_or_bad_version() {
        let info = ServerInfo::parse("loading:0\r\n");
        assert_eq!(info.version, None);
        let info = ServerInfo::parse("redis_version:unstable\r\n");
        assert_eq!(info.version, None);
    }

    #[test]
    fn two_part_version_gets_zero_patch() {
        let info = ServerInfo::parse("redis_version:2.4\r\n");
        assert_eq!(info.version, Some((2, 4, 0)));
    }

    #[test]
    fn empty_input() {
        let info = ServerInfo::parse("");
        assert!(!info.is_loading());
        assert_eq!(info.version, None);
    }
}
