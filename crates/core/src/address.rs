//! Destination addressing: `<protocol>://<host>:<port>/<queue>[/<subqueue>]`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;
use crate::result::Result;
use crate::types::{Endpoint, QueueKey};

/// A remote queue manager plus the queue to deliver into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Remote listener.
    pub endpoint: Endpoint,
    /// Target queue on the remote manager.
    pub queue: QueueKey,
}

impl Destination {
    /// Create a destination from its parts.
    #[must_use]
    pub const fn new(endpoint: Endpoint, queue: QueueKey) -> Self {
        Self { endpoint, queue }
    }

    /// Parse a destination URI. The protocol is accepted as-is.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAddress` when the host, port, or queue is missing, or
    /// when there are more than two path segments.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| Error::invalid_address(uri, e.to_string()))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::invalid_address(uri, "missing host"))?;
        let port = url
            .port()
            .ok_or_else(|| Error::invalid_address(uri, "missing port"))?;

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        let queue = match segments.as_slice() {
            [queue] => QueueKey::new(*queue),
            [queue, subqueue] => QueueKey::new(*queue)?.with_subqueue(*subqueue),
            [] => return Err(Error::invalid_address(uri, "missing queue")),
            _ => {
                return Err(Error::invalid_address(
                    uri,
                    "expected /<queue> or /<queue>/<subqueue>",
                ));
            }
        }
        .map_err(|e| Error::invalid_address(uri, e.to_string()))?;

        Ok(Self {
            endpoint: Endpoint::new(host, port),
            queue,
        })
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "quay://{}/{}", self.endpoint, self.queue)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_queue_uri() {
        let dest = Destination::parse("rhino.queues://localhost:23457/h").unwrap();
        assert_eq!(dest.endpoint, Endpoint::new("localhost", 23457));
        assert_eq!(dest.queue.queue(), "h");
        assert_eq!(dest.queue.subqueue(), None);
    }

    #[test]
    fn test_parse_subqueue_uri() {
        let dest: Destination = "quay://10.0.0.7:2200/orders/retry".parse().unwrap();
        assert_eq!(dest.endpoint.host, "10.0.0.7");
        assert_eq!(dest.queue.queue(), "orders");
        assert_eq!(dest.queue.subqueue(), Some("retry"));
    }

    #[test]
    fn test_trailing_slash_is_ignored() {
        let dest = Destination::parse("quay://localhost:2200/h/").unwrap();
        assert_eq!(dest.queue.to_string(), "h");
    }

    #[test]
    fn test_rejects_incomplete_uris() {
        assert!(Destination::parse("quay://localhost/h").is_err());
        assert!(Destination::parse("quay://localhost:2200").is_err());
        assert!(Destination::parse("quay://localhost:2200/a/b/c").is_err());
        assert!(Destination::parse("not a uri").is_err());
    }

    #[test]
    fn test_display_round_trips() {
        let dest = Destination::parse("rhino.queues://localhost:23457/h/sub").unwrap();
        let again = Destination::parse(&dest.to_string()).unwrap();
        assert_eq!(again, dest);
    }
}
