//! Consumer subscriptions: which topics a group consumes.
//!
//! A subscription is either a static list of topic names or a regular
//! expression, tagged white-list (matching topics are consumed) or
//! black-list (matching topics are excluded). The serialized form is the
//! version-1 payload the legacy consumer protocol stores in each instance's
//! registration node.

use std::collections::BTreeMap;

use chrono::Utc;
use regex::Regex;

use crate::cluster::{Cluster, Partition, Topic};
use crate::error::{Error, Result};

/// How a pattern subscription treats a matching topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Matching topics are included.
    WhiteList,
    /// Matching topics are excluded.
    BlackList,
}

#[derive(Debug, Clone)]
enum Kind {
    Static {
        topics: Vec<String>,
    },
    Pattern {
        /// Original expression(s); multiple alternatives are comma-joined.
        source: String,
        regex: Regex,
        kind: PatternKind,
    },
}

/// A predicate over topic names, with versioned serialization.
///
/// Equality compares the kind tag and the subscription body; the creation
/// timestamp is deliberately excluded, so a deserialized subscription equals
/// the one it was serialized from.
#[derive(Debug, Clone)]
pub struct Subscription {
    kind: Kind,
    timestamp_ms: i64,
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.label() == other.label() && self.body() == other.body()
    }
}

impl Eq for Subscription {}

impl Subscription {
    /// A subscription for an explicit set of topic names.
    pub fn static_topics<I, S>(topics: I) -> Result<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(Error::InvalidSubscription(
                "a static subscription needs at least one topic".to_string(),
            ));
        }
        Ok(Subscription {
            kind: Kind::Static { topics },
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    /// A subscription driven by a regular expression. Multiple alternative
    /// expressions can be given comma-joined, as the wire format does.
    pub fn pattern(expression: impl Into<String>, kind: PatternKind) -> Result<Subscription> {
        let source = expression.into();
        let regex = compile(&source)?;
        Ok(Subscription {
            kind: Kind::Pattern {
                source,
                regex,
                kind,
            },
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    /// The white-list pattern that matches every topic.
    pub fn everything() -> Subscription {
        Subscription::pattern(".*", PatternKind::WhiteList)
            .unwrap_or_else(|_| unreachable!("the catch-all pattern always compiles"))
    }

    /// Milliseconds since the epoch at which this subscription was created
    /// or deserialized.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// The wire tag: `static`, `white_list` or `black_list`.
    pub fn label(&self) -> &'static str {
        match &self.kind {
            Kind::Static { .. } => "static",
            Kind::Pattern {
                kind: PatternKind::WhiteList,
                ..
            } => "white_list",
            Kind::Pattern {
                kind: PatternKind::BlackList,
                ..
            } => "black_list",
        }
    }

    /// Whether a topic with this name is consumed under this subscription.
    pub fn has_topic(&self, name: &str) -> bool {
        match &self.kind {
            Kind::Static { topics } => topics.iter().any(|t| t == name),
            Kind::Pattern {
                regex,
                kind: PatternKind::WhiteList,
                ..
            } => regex.is_match(name),
            Kind::Pattern {
                regex,
                kind: PatternKind::BlackList,
                ..
            } => !regex.is_match(name),
        }
    }

    /// The cluster's topics that fall under this subscription.
    pub async fn topics(&self, cluster: &Cluster) -> Result<Vec<Topic>> {
        let mut matched: Vec<Topic> = cluster
            .topics()
            .await?
            .into_values()
            .filter(|topic| self.has_topic(topic.name()))
            .collect();
        matched.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(matched)
    }

    /// All partitions of the subscribed topics.
    pub async fn partitions(&self, cluster: &Cluster) -> Result<Vec<Partition>> {
        let mut partitions = Vec::new();
        for topic in self.topics(cluster).await? {
            partitions.extend(topic.partitions(cluster).await?);
        }
        Ok(partitions)
    }

    /// Serializes to the version-1 registration payload.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let payload = serde_json::json!({
            "version": 1,
            "pattern": self.label(),
            "timestamp": self.timestamp_ms.to_string(),
            "subscription": self.body(),
        });
        Ok(serde_json::to_vec(&payload)?)
    }

    /// Parses a version-1 registration payload.
    ///
    /// The accepted shape is strict: schema version 1, a known pattern tag,
    /// exactly one stream per topic entry, and exactly one expression entry
    /// for pattern subscriptions.
    pub fn from_json(payload: &[u8]) -> Result<Subscription> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;

        let version = value.get("version").and_then(|v| v.as_i64());
        if version != Some(1) {
            return Err(Error::InvalidSubscription(format!(
                "unsupported subscription version {:?}",
                version
            )));
        }

        let timestamp_ms = match value.get("timestamp") {
            Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(serde_json::Value::String(s)) => s.parse().map_err(|_| {
                Error::InvalidSubscription(format!("invalid timestamp {:?}", s))
            })?,
            _ => 0,
        };

        let body = value
            .get("subscription")
            .and_then(|v| v.as_object())
            .ok_or_else(|| {
                Error::InvalidSubscription("missing subscription body".to_string())
            })?;
        for (entry, streams) in body {
            if streams.as_i64() != Some(1) {
                return Err(Error::InvalidSubscription(format!(
                    "only one stream per topic is supported, {:?} has {}",
                    entry, streams
                )));
            }
        }

        let pattern = value.get("pattern").and_then(|v| v.as_str());
        let kind = match pattern {
            Some("static") => Kind::Static {
                topics: body.keys().cloned().collect(),
            },
            Some(tag @ ("white_list" | "black_list")) => {
                if body.len() != 1 {
                    return Err(Error::InvalidSubscription(format!(
                        "a pattern subscription must carry exactly one expression, found {}",
                        body.len()
                    )));
                }
                let source = body.keys().next().cloned().unwrap_or_default();
                let regex = compile(&source)?;
                Kind::Pattern {
                    source,
                    regex,
                    kind: if tag == "white_list" {
                        PatternKind::WhiteList
                    } else {
                        PatternKind::BlackList
                    },
                }
            }
            other => {
                return Err(Error::InvalidSubscription(format!(
                    "unknown pattern tag {:?}",
                    other
                )))
            }
        };

        Ok(Subscription { kind, timestamp_ms })
    }

    fn body(&self) -> BTreeMap<String, u32> {
        match &self.kind {
            Kind::Static { topics } => topics.iter().map(|t| (t.clone(), 1)).collect(),
            Kind::Pattern { source, .. } => BTreeMap::from([(source.clone(), 1)]),
        }
    }
}

fn compile(source: &str) -> Result<Regex> {
    let alternated = source.split(',').collect::<Vec<_>>().join("|");
    Regex::new(&alternated).map_err(|e| {
        Error::InvalidSubscription(format!("invalid pattern {:?}: {}", source, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_subscription_matches_exactly_its_topics() {
        let sub = Subscription::static_topics(["t1", "t4"]).unwrap();
        assert!(sub.has_topic("t1"));
        assert!(sub.has_topic("t4"));
        assert!(!sub.has_topic("t2"));
        assert!(!sub.has_topic("t11"));
        assert_eq!(sub.label(), "static");
    }

    #[test]
    fn test_white_list_matches_pattern() {
        let sub = Subscription::pattern(r"^test\.\d+", PatternKind::WhiteList).unwrap();
        assert!(sub.has_topic("test.1"));
        assert!(sub.has_topic("test.4"));
        assert!(!sub.has_topic("other.1"));
    }

    #[test]
    fn test_black_list_matches_complement() {
        let sub = Subscription::pattern(r"^test\.\d+", PatternKind::BlackList).unwrap();
        assert!(!sub.has_topic("test.1"));
        assert!(sub.has_topic("other.1"));
    }

    #[test]
    fn test_comma_joined_alternatives() {
        let sub = Subscription::pattern("^foo$,^bar$", PatternKind::WhiteList).unwrap();
        assert!(sub.has_topic("foo"));
        assert!(sub.has_topic("bar"));
        assert!(!sub.has_topic("baz"));
    }

    #[test]
    fn test_round_trip_static() {
        let sub = Subscription::static_topics(["events", "logs"]).unwrap();
        let parsed = Subscription::from_json(&sub.to_json().unwrap()).unwrap();
        assert_eq!(parsed, sub);
    }

    #[test]
    fn test_round_trip_pattern() {
        for kind in [PatternKind::WhiteList, PatternKind::BlackList] {
            let sub = Subscription::pattern(r"^test\..*", kind).unwrap();
            let parsed = Subscription::from_json(&sub.to_json().unwrap()).unwrap();
            assert_eq!(parsed, sub);
        }
    }

    #[test]
    fn test_equality_ignores_timestamp() {
        let a = Subscription::static_topics(["events"]).unwrap();
        let mut b = Subscription::static_topics(["events"]).unwrap();
        b.timestamp_ms = a.timestamp_ms + 12345;
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_json_rejects_wrong_version() {
        let payload = br#"{"version":2,"pattern":"static","subscription":{"t":1}}"#;
        assert!(matches!(
            Subscription::from_json(payload),
            Err(Error::InvalidSubscription(_))
        ));
    }

    #[test]
    fn test_from_json_rejects_multiple_streams() {
        let payload = br#"{"version":1,"pattern":"static","subscription":{"t":2}}"#;
        assert!(matches!(
            Subscription::from_json(payload),
            Err(Error::InvalidSubscription(_))
        ));
    }

    #[test]
    fn test_from_json_rejects_multiple_pattern_entries() {
        let payload =
            br#"{"version":1,"pattern":"white_list","subscription":{"a.*":1,"b.*":1}}"#;
        assert!(matches!(
            Subscription::from_json(payload),
            Err(Error::InvalidSubscription(_))
        ));
    }

    #[test]
    fn test_from_json_accepts_numeric_timestamp() {
        let payload =
            br#"{"version":1,"pattern":"static","timestamp":1700000000000,"subscription":{"t":1}}"#;
        let sub = Subscription::from_json(payload).unwrap();
        assert_eq!(sub.timestamp_ms(), 1_700_000_000_000);
    }

    #[test]
    fn test_everything_matches_any_topic() {
        let sub = Subscription::everything();
        assert!(sub.has_topic("anything.at.all"));
        assert_eq!(sub.label(), "white_list");
    }
}
