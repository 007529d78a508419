// src/ingest/providers/social.rs
//! Social search API adapter: expert timelines plus a keyword search.
use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use metrics::histogram;
use serde::Deserialize;

use crate::config::SocialSourceConfig;
use crate::event::{EngagementMetrics, NewEvent, Payload, SocialPost, SourceKind};
use crate::ingest::normalize_text;
use crate::ingest::terms::{default_terms, is_football_relevant};
use crate::ingest::types::{PollBatch, SourceAdapter};

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    tweets: Vec<RawPost>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPost {
    id: Option<String>,
    text: Option<String>,
    created_at: Option<String>,
    url: Option<String>,
    #[serde(default)]
    author: RawAuthor,
    #[serde(default)]
    retweet_count: u64,
    #[serde(default)]
    reply_count: u64,
    #[serde(default)]
    like_count: u64,
    #[serde(default)]
    quote_count: u64,
    #[serde(default)]
    view_count: u64,
    #[serde(default)]
    bookmark_count: u64,
    #[serde(default)]
    entities: RawEntities,
    lang: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAuthor {
    user_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEntities {
    #[serde(default)]
    hashtags: Vec<RawTag>,
}

#[derive(Debug, Deserialize)]
struct RawTag {
    text: String,
}

enum Mode {
    Fixture {
        experts: Option<String>,
        keywords: Option<String>,
    },
    Http {
        base_url: String,
        api_key: String,
        client: reqwest::Client,
    },
}

pub struct SocialAdapter {
    mode: Mode,
    expert_accounts: Vec<String>,
    keywords: Vec<String>,
    hours_back: u32,
    max_keyword_results: usize,
    reliability: BTreeMap<String, f64>,
    default_reliability: f64,
    terms: Vec<String>,
}

impl SocialAdapter {
    /// Parse pre-recorded search responses: one for expert timelines, one for
    /// the keyword search.
    pub fn from_fixture(experts: Option<&str>, keywords: Option<&str>) -> Self {
        Self::with_mode(
            Mode::Fixture {
                experts: experts.map(str::to_string),
                keywords: keywords.map(str::to_string),
            },
            &SocialSourceConfig::default(),
            default_terms(),
        )
    }

    /// Requires `SOCIAL_API_KEY`.
    pub fn from_config(cfg: &SocialSourceConfig, terms: Vec<String>) -> Result<Self> {
        let api_key = std::env::var("SOCIAL_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow!("missing SOCIAL_API_KEY env var"))?;
        let client = super::http_client(std::time::Duration::from_secs(30))?;
        Ok(Self::with_mode(
            Mode::Http {
                base_url: cfg.base_url.trim_end_matches('/').to_string(),
                api_key,
                client,
            },
            cfg,
            terms,
        ))
    }

    fn with_mode(mode: Mode, cfg: &SocialSourceConfig, terms: Vec<String>) -> Self {
        Self {
            mode,
            expert_accounts: cfg.expert_accounts.clone(),
            keywords: cfg.keywords.clone(),
            hours_back: cfg.hours_back,
            max_keyword_results: cfg.max_keyword_results,
            reliability: cfg.reliability.clone(),
            default_reliability: cfg.default_reliability,
            terms,
        }
    }

    pub fn with_experts(mut self, accounts: &[&str]) -> Self {
        self.expert_accounts = accounts.iter().map(|s| s.to_string()).collect();
        self
    }

    fn reliability_of(&self, author: &str) -> f64 {
        self.reliability
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(author))
            .map(|(_, v)| *v)
            .unwrap_or(self.default_reliability)
    }

    fn is_expert(&self, author: &str) -> bool {
        self.expert_accounts
            .iter()
            .any(|a| a.eq_ignore_ascii_case(author))
    }

    fn normalize_post(&self, raw: RawPost) -> Result<SocialPost> {
        let post_id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow!("post without id"))?;
        let text = normalize_text(raw.text.as_deref().unwrap_or_default(), 2_000);
        if text.is_empty() {
            return Err(anyhow!("post {post_id} has no text"));
        }
        let author = raw.author.user_name.unwrap_or_else(|| "unknown".into());
        let metrics = EngagementMetrics {
            likes: raw.like_count,
            reposts: raw.retweet_count,
            replies: raw.reply_count,
            quotes: raw.quote_count,
            views: raw.view_count,
            bookmarks: raw.bookmark_count,
        };
        Ok(SocialPost {
            url: raw
                .url
                .unwrap_or_else(|| format!("https://x.com/{author}/status/{post_id}")),
            engagement_score: metrics.score(),
            reliability: self.reliability_of(&author),
            hashtags: raw.entities.hashtags.into_iter().map(|t| t.text).collect(),
            language: raw.lang.unwrap_or_else(|| "en".into()),
            created_at: raw.created_at,
            post_id,
            text,
            author,
            metrics,
        })
    }

    /// Expert documents keep only posts by configured accounts; keyword
    /// documents keep only football-relevant posts.
    fn collect(&self, doc: &str, from_experts: bool, batch: &mut PollBatch) -> Result<()> {
        let t0 = std::time::Instant::now();
        let resp: SearchResponse =
            serde_json::from_str(doc).context("parsing social search response")?;
        let limit = if from_experts {
            usize::MAX
        } else {
            self.max_keyword_results
        };
        for raw in resp.tweets.into_iter().take(limit) {
            match self.normalize_post(raw) {
                Ok(post) => {
                    let keep = if from_experts {
                        self.is_expert(&post.author)
                    } else {
                        is_football_relevant(&post.text, &self.terms)
                    };
                    if keep {
                        let fp = format!("social:{}", post.post_id);
                        batch
                            .events
                            .push(NewEvent::new(SourceKind::Social, fp, Payload::Post(post)));
                    }
                }
                Err(e) => batch.push_error(format!("{e:#}")),
            }
        }
        histogram!("ingest_parse_ms", "source" => "social").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(())
    }

    fn since(&self) -> String {
        let since = Utc::now() - chrono::Duration::hours(self.hours_back as i64);
        since.format("%Y-%m-%d_%H:%M:%S_UTC").to_string()
    }

    fn keyword_query(&self) -> String {
        format!("({}) since:{} lang:en", self.keywords.join(" OR "), self.since())
    }
}

async fn search(client: &reqwest::Client, base_url: &str, api_key: &str, query: &str) -> Result<String> {
    client
        .get(format!("{base_url}/twitter/tweet/advanced_search"))
        .header("X-API-Key", api_key)
        .query(&[("query", query), ("queryType", "Latest")])
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .context("social http get()")?
        .text()
        .await
        .context("social http .text()")
}

#[async_trait]
impl SourceAdapter for SocialAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Social
    }

    fn name(&self) -> &str {
        "social"
    }

    async fn poll(&self) -> Result<PollBatch> {
        let mut batch = PollBatch::default();
        match &self.mode {
            Mode::Fixture { experts, keywords } => {
                if let Some(doc) = experts {
                    self.collect(doc, true, &mut batch)?;
                }
                if let Some(doc) = keywords {
                    self.collect(doc, false, &mut batch)?;
                }
            }
            Mode::Http {
                base_url,
                api_key,
                client,
            } => {
                let mut requests = 0usize;
                let mut failed = 0usize;
                let since = self.since();
                for account in &self.expert_accounts {
                    requests += 1;
                    let query = format!("from:{account} since:{since}");
                    let res = search(client, base_url, api_key, &query)
                        .await
                        .and_then(|doc| self.collect(&doc, true, &mut batch));
                    if let Err(e) = res {
                        tracing::warn!(error = ?e, account = %account, "social account fetch failed");
                        batch.push_error(format!("@{account}: {e:#}"));
                        failed += 1;
                    }
                }
                if !self.keywords.is_empty() {
                    requests += 1;
                    let res = search(client, base_url, api_key, &self.keyword_query())
                        .await
                        .and_then(|doc| self.collect(&doc, false, &mut batch));
                    if let Err(e) = res {
                        tracing::warn!(error = ?e, "social keyword search failed");
                        batch.push_error(format!("keyword search: {e:#}"));
                        failed += 1;
                    }
                }
                if requests > 0 && failed == requests {
                    return Err(anyhow!("all {failed} social requests failed"));
                }
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_authors_get_default_reliability() {
        let a = SocialAdapter::from_fixture(None, None);
        assert_eq!(a.reliability_of("optajoe"), 0.95);
        assert_eq!(a.reliability_of("random_fan"), 0.5);
    }

    #[test]
    fn keyword_query_joins_terms() {
        let a = SocialAdapter::from_fixture(None, None);
        let q = a.keyword_query();
        assert!(q.starts_with("(#PremierLeague OR #UCL"));
        assert!(q.ends_with("lang:en"));
    }
}
