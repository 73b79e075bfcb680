//! What the edge reports about an object's cache presence.

use std::fmt;

/// Value of the edge's cache-status response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Stale,
    Updating,
    Revalidated,
    Miss,
    Unknown,
}

impl CacheStatus {
    /// Parse a `CF-Cache-Status` style header value. Empty means MISS.
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "HIT" => Self::Hit,
            "STALE" => Self::Stale,
            "UPDATING" => Self::Updating,
            "REVALIDATED" => Self::Revalidated,
            "" | "MISS" | "EXPIRED" | "BYPASS" | "DYNAMIC" => Self::Miss,
            _ => Self::Unknown,
        }
    }

    /// HIT, STALE, UPDATING and REVALIDATED all mean the edge holds a copy.
    pub fn is_cached(self) -> bool {
        matches!(
            self,
            Self::Hit | Self::Stale | Self::Updating | Self::Revalidated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Stale => "STALE",
            Self::Updating => "UPDATING",
            Self::Revalidated => "REVALIDATED",
            Self::Miss => "MISS",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single probe against the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheProbeResult {
    pub cached: bool,
    pub status: CacheStatus,
}

impl CacheProbeResult {
    pub fn miss() -> Self {
        Self {
            cached: false,
            status: CacheStatus::Miss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_edge_labels() {
        assert_eq!(CacheStatus::from_header("hit"), CacheStatus::Hit);
        assert_eq!(CacheStatus::from_header(" REVALIDATED "), CacheStatus::Revalidated);
        assert_eq!(CacheStatus::from_header(""), CacheStatus::Miss);
        assert_eq!(CacheStatus::from_header("weird"), CacheStatus::Unknown);
    }

    #[test]
    fn only_edge_copies_count_as_cached() {
        assert!(CacheStatus::Stale.is_cached());
        assert!(CacheStatus::Updating.is_cached());
        assert!(!CacheStatus::Miss.is_cached());
        assert!(!CacheStatus::Unknown.is_cached());
    }
}
