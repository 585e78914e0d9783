//! Canonicalization of the well-known rack environment keys.
//!
//! Every key string the rack contract mandates maps to a compact
//! [`RackKey`] tag, which the [`Environment`] uses to index its fixed
//! slot array instead of hashing the key string on every access.
//! Key strings outside this set take the generic overflow path.
//!
//! [`Environment`]: crate::Environment

use std::collections::HashMap;

/// Compact tag for one of the well-known rack environment keys.
///
/// `rack.hijack_io` is deliberately not part of this set: it only ever
/// exists after a hijack and is installed through the overflow map,
/// so it never needs a reserved slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RackKey {
    Input,
    Errors,
    RequestMethod,
    ScriptName,
    PathInfo,
    QueryString,
    ServerName,
    ServerPort,
    ContentType,
    RequestUri,
    RemoteAddr,
    UrlScheme,
    Version,
    Multithread,
    Multiprocess,
    RunOnce,
    ContentLength,
    Https,
    HttpVersion,
    HijackCheck,
    Hijack,
}

impl RackKey {
    /// Number of well-known keys, and thus the size of the slot array.
    pub const COUNT: usize = 21;

    /// All well-known keys, in slot order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Input,
        Self::Errors,
        Self::RequestMethod,
        Self::ScriptName,
        Self::PathInfo,
        Self::QueryString,
        Self::ServerName,
        Self::ServerPort,
        Self::ContentType,
        Self::RequestUri,
        Self::RemoteAddr,
        Self::UrlScheme,
        Self::Version,
        Self::Multithread,
        Self::Multiprocess,
        Self::RunOnce,
        Self::ContentLength,
        Self::Https,
        Self::HttpVersion,
        Self::HijackCheck,
        Self::Hijack,
    ];

    /// The canonical external key string for this tag.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Input => "rack.input",
            Self::Errors => "rack.errors",
            Self::RequestMethod => "REQUEST_METHOD",
            Self::ScriptName => "SCRIPT_NAME",
            Self::PathInfo => "PATH_INFO",
            Self::QueryString => "QUERY_STRING",
            Self::ServerName => "SERVER_NAME",
            Self::ServerPort => "SERVER_PORT",
            Self::ContentType => "CONTENT_TYPE",
            Self::RequestUri => "REQUEST_URI",
            Self::RemoteAddr => "REMOTE_ADDR",
            Self::UrlScheme => "rack.url_scheme",
            Self::Version => "rack.version",
            Self::Multithread => "rack.multithread",
            Self::Multiprocess => "rack.multiprocess",
            Self::RunOnce => "rack.run_once",
            Self::ContentLength => "CONTENT_LENGTH",
            Self::Https => "HTTPS",
            Self::HttpVersion => "HTTP_VERSION",
            Self::HijackCheck => "rack.hijack?",
            Self::Hijack => "rack.hijack",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// Immutable registry resolving well-known key strings to [`RackKey`] tags.
///
/// Built once at server startup and shared (behind an [`Arc`]) with every
/// [`EnvironmentBuilder`] and [`Environment`]. It is never mutated after
/// construction, which is what makes unsynchronized concurrent reads from
/// request workers sound.
///
/// [`Arc`]: std::sync::Arc
/// [`EnvironmentBuilder`]: crate::EnvironmentBuilder
/// [`Environment`]: crate::Environment
#[derive(Debug)]
pub struct KeyRegistry {
    map: HashMap<&'static str, RackKey>,
}

impl KeyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: RackKey::ALL.iter().map(|key| (key.name(), *key)).collect(),
        }
    }

    /// Resolve a key string to its tag.
    ///
    /// `None` is a normal outcome, not an error: it routes the key
    /// to the environment's overflow map.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<RackKey> {
        self.map.get(key).copied()
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
