//! Canonical event envelope carried through the log.
//!
//! The envelope (`id`, `source`, `match_id`, `fingerprint`, `received_at`) is
//! strongly typed; the payload is a tagged union that only the adapter which
//! produced it and the knowledge sink look into.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseSourceError;

/// Origin of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rss,
    Social,
    Odds,
    Fixture,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [Self::Rss, Self::Social, Self::Odds, Self::Fixture];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rss => "rss",
            Self::Social => "social",
            Self::Odds => "odds",
            Self::Fixture => "fixture",
        }
    }

    /// Sources that can carry breaking news go through the urgency classifier.
    /// Structural sources (odds, fixtures) bypass it.
    pub fn requires_classification(&self) -> bool {
        matches!(self, Self::Rss | Self::Social)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ParseSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rss" | "news" => Ok(Self::Rss),
            "social" | "twitter" => Ok(Self::Social),
            "odds" => Ok(Self::Odds),
            "fixture" | "fixtures" => Ok(Self::Fixture),
            other => Err(ParseSourceError(other.to_string())),
        }
    }
}

/// Log position assigned at append time. Strictly increasing in log order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evt-{}", self.0)
    }
}

/// An event as produced by an adapter, before the log assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub source: SourceKind,
    pub match_id: Option<i64>,
    pub fingerprint: String,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(source: SourceKind, fingerprint: impl Into<String>, payload: Payload) -> Self {
        Self {
            source,
            match_id: None,
            fingerprint: fingerprint.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn with_match(mut self, match_id: Option<i64>) -> Self {
        self.match_id = match_id;
        self
    }
}

/// A logged event. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub source: SourceKind,
    pub match_id: Option<i64>,
    pub fingerprint: String,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn from_new(id: EventId, new: NewEvent) -> Self {
        Self {
            id,
            source: new.source,
            match_id: new.match_id,
            fingerprint: new.fingerprint,
            payload: new.payload,
            received_at: new.received_at,
        }
    }

    /// Text handed to the classifier and the knowledge sink.
    pub fn text(&self) -> String {
        self.payload.text()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Article(ArticlePayload),
    Post(SocialPost),
    OddsMove(OddsDelta),
    Fixture(FixtureInfo),
}

impl Payload {
    pub fn text(&self) -> String {
        match self {
            Payload::Article(a) => {
                if a.body.is_empty() || a.body == a.title {
                    a.title.clone()
                } else {
                    format!("{}. {}", a.title, a.body)
                }
            }
            Payload::Post(p) => p.text.clone(),
            Payload::OddsMove(o) => format!(
                "{} vs {}: {} {} price for {} moved {:.2} -> {:.2}",
                o.home, o.away, o.bookmaker, o.market, o.outcome, o.previous, o.current
            ),
            Payload::Fixture(f) => format!(
                "{} vs {} (league {}) kicks off {}",
                f.home,
                f.away,
                f.league_id,
                f.kickoff.to_rfc3339()
            ),
        }
    }

    pub fn author(&self) -> Option<&str> {
        match self {
            Payload::Article(a) => Some(a.feed.as_str()),
            Payload::Post(p) => Some(p.author.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticlePayload {
    pub title: String,
    pub summary: Option<String>,
    pub url: String,
    pub body: String,
    pub feed: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementMetrics {
    pub likes: u64,
    pub reposts: u64,
    pub replies: u64,
    pub quotes: u64,
    pub views: u64,
    pub bookmarks: u64,
}

impl EngagementMetrics {
    /// Weighted engagement: reposts count more than likes, views barely count.
    pub fn score(&self) -> f64 {
        let raw = self.likes as f64 * 1.0
            + self.reposts as f64 * 3.0
            + self.replies as f64 * 2.0
            + self.quotes as f64 * 2.5
            + self.views as f64 * 0.01
            + self.bookmarks as f64 * 1.5;
        (raw * 100.0).round() / 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialPost {
    pub post_id: String,
    pub text: String,
    pub author: String,
    pub url: String,
    pub created_at: Option<String>,
    pub metrics: EngagementMetrics,
    pub engagement_score: f64,
    pub reliability: f64,
    pub hashtags: Vec<String>,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsDelta {
    pub event_key: String,
    pub home: String,
    pub away: String,
    pub bookmaker: String,
    pub market: String,
    pub outcome: String,
    pub previous: f64,
    pub current: f64,
    pub commence_time: Option<DateTime<Utc>>,
}

impl OddsDelta {
    /// Relative move, e.g. 2.0 -> 2.4 is 0.2.
    pub fn relative_move(&self) -> f64 {
        if self.previous <= 0.0 {
            return 0.0;
        }
        (self.current - self.previous).abs() / self.previous
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureInfo {
    pub fixture_id: i64,
    pub league_id: i64,
    pub home: String,
    pub away: String,
    pub kickoff: DateTime<Utc>,
    pub status: String,
}

impl FixtureInfo {
    /// Finished, cancelled or abandoned fixtures are not worth processing.
    pub fn is_open(&self) -> bool {
        !matches!(
            self.status.to_ascii_uppercase().as_str(),
            "FT" | "AET" | "PEN" | "CANC" | "ABD" | "AWD" | "WO"
        )
    }
}
