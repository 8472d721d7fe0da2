//! Code version tracking.
//!
//! Every worker captures the version current at its creation and presents it
//! on each poll. Advancing the version makes every existing worker's next poll
//! fail, so old workers finish what they hold and then stop.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use tokio::sync::watch;

/// Opaque build token. Compared only for equality and only ever increases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeVersion(u64);

impl CodeVersion {
    /// Version published when a pool starts.
    pub const INITIAL: CodeVersion = CodeVersion(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for CodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CodeVersion {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(CodeVersion)
    }
}

/// Holds the current [`CodeVersion`] and lets observers follow changes.
#[derive(Debug)]
pub struct VersionTracker {
    tx: watch::Sender<CodeVersion>,
}

impl VersionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CodeVersion::INITIAL);
        Self { tx }
    }

    /// The version new workers are bound to.
    pub fn current(&self) -> CodeVersion {
        *self.tx.borrow()
    }

    pub fn is_current(&self, version: CodeVersion) -> bool {
        self.current() == version
    }

    /// Publish the next version and return it.
    pub fn advance(&self) -> CodeVersion {
        let mut published = CodeVersion::INITIAL;
        self.tx.send_modify(|version| {
            *version = version.next();
            published = *version;
        });
        published
    }

    /// Receive every published version.
    pub fn subscribe(&self) -> watch::Receiver<CodeVersion> {
        self.tx.subscribe()
    }
}

impl Default for VersionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let tracker = VersionTracker::new();
        assert_eq!(tracker.current(), CodeVersion::INITIAL);

        let v2 = tracker.advance();
        let v3 = tracker.advance();
        assert!(v3 > v2);
        assert!(tracker.is_current(v3));
        assert!(!tracker.is_current(v2));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!("7".parse::<CodeVersion>().unwrap(), CodeVersion::new(7));
        assert!("seven".parse::<CodeVersion>().is_err());
        assert_eq!(CodeVersion::new(7).to_string(), "7");
    }

    #[tokio::test]
    async fn test_subscribers_see_new_versions() {
        let tracker = VersionTracker::new();
        let mut rx = tracker.subscribe();

        let published = tracker.advance();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), published);
    }
}
