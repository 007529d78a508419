// src/ingest/providers/rss.rs
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use quick_xml::de::from_str;
use regex::Regex;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::config::{FeedConfig, RssSourceConfig};
use crate::event::{ArticlePayload, NewEvent, Payload, SourceKind};
use crate::ingest::types::{PollBatch, SourceAdapter};
use crate::ingest::{canonical_url, content_hash, normalize_text};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .and_then(|dt| DateTime::from_timestamp(dt.unix_timestamp(), 0))
}

/// Paragraph text of the first `<article>` in a page.
pub fn extract_article_text(html: &str, max_chars: usize) -> Option<String> {
    static RE_ARTICLE: OnceCell<Regex> = OnceCell::new();
    static RE_P: OnceCell<Regex> = OnceCell::new();
    let re_article =
        RE_ARTICLE.get_or_init(|| Regex::new(r"(?is)<article\b[^>]*>(.*?)</article>").unwrap());
    let re_p = RE_P.get_or_init(|| Regex::new(r"(?is)<p\b[^>]*>(.*?)</p>").unwrap());

    let article = re_article.captures(html)?.get(1)?.as_str();
    let paragraphs: Vec<String> = re_p
        .captures_iter(article)
        .filter_map(|c| c.get(1))
        .map(|m| normalize_text(m.as_str(), max_chars))
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.is_empty() {
        return None;
    }
    Some(normalize_text(&paragraphs.join(" "), max_chars))
}

enum Mode {
    /// (feed name, xml document)
    Fixture(Vec<(String, String)>),
    Http {
        feeds: Vec<FeedConfig>,
        client: reqwest::Client,
    },
}

pub struct RssAdapter {
    mode: Mode,
    max_items_per_feed: usize,
    fetch_full_article: bool,
    max_chars: usize,
}

impl RssAdapter {
    pub fn from_fixture(feed: &str, xml: &str) -> Self {
        Self::from_fixtures(vec![(feed.to_string(), xml.to_string())])
    }

    pub fn from_fixtures(docs: Vec<(String, String)>) -> Self {
        let d = RssSourceConfig::default();
        Self {
            mode: Mode::Fixture(docs),
            max_items_per_feed: d.max_items_per_feed,
            fetch_full_article: false,
            max_chars: d.max_chars,
        }
    }

    pub fn from_config(cfg: &RssSourceConfig) -> Result<Self> {
        let client = super::http_client(std::time::Duration::from_secs(10))?;
        Ok(Self {
            mode: Mode::Http {
                feeds: cfg.feeds.clone(),
                client,
            },
            max_items_per_feed: cfg.max_items_per_feed,
            fetch_full_article: cfg.fetch_full_article,
            max_chars: cfg.max_chars,
        })
    }

    pub fn with_max_items(mut self, n: usize) -> Self {
        self.max_items_per_feed = n;
        self
    }

    fn parse_feed(&self, feed: &str, xml: &str, batch: &mut PollBatch) -> Result<()> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(xml);
        let rss: Rss = from_str(&xml_clean).with_context(|| format!("parsing rss feed {feed}"))?;

        for it in rss.channel.item.into_iter().take(self.max_items_per_feed) {
            match self.normalize_item(feed, it) {
                Ok(ev) => batch.events.push(ev),
                Err(e) => batch.push_error(format!("{feed}: {e}")),
            }
        }

        histogram!("ingest_parse_ms", "source" => "rss").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(())
    }

    fn normalize_item(&self, feed: &str, it: Item) -> Result<NewEvent> {
        let title = normalize_text(it.title.as_deref().unwrap_or_default(), 300);
        if title.is_empty() {
            return Err(anyhow!("item without title"));
        }
        let summary = it
            .description
            .as_deref()
            .map(|d| normalize_text(d, self.max_chars))
            .filter(|d| !d.is_empty());
        let url = it.link.as_deref().map(str::trim).unwrap_or_default().to_string();
        let fingerprint = if url.is_empty() {
            format!("rss:h:{}", content_hash(&[feed, &title]))
        } else {
            format!("rss:{}", canonical_url(&url))
        };

        let article = ArticlePayload {
            body: summary.clone().unwrap_or_else(|| title.clone()),
            title,
            summary,
            url,
            feed: feed.to_string(),
            published_at: it.pub_date.as_deref().and_then(parse_rfc2822),
        };
        Ok(NewEvent::new(SourceKind::Rss, fingerprint, Payload::Article(article)))
    }

    /// Replace each article body with the page text. Failures drop the item.
    async fn enrich(&self, client: &reqwest::Client, batch: &mut PollBatch) {
        let mut kept = Vec::with_capacity(batch.events.len());
        for mut ev in std::mem::take(&mut batch.events) {
            let Payload::Article(a) = &mut ev.payload else {
                kept.push(ev);
                continue;
            };
            match fetch_article(client, &a.url, self.max_chars).await {
                Ok(body) => {
                    a.body = body;
                    kept.push(ev);
                }
                Err(e) => batch.push_error(format!("{}: {e:#}", a.url)),
            }
        }
        batch.events = kept;
    }
}

async fn fetch_article(client: &reqwest::Client, url: &str, max_chars: usize) -> Result<String> {
    let html = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .context("article http get()")?
        .text()
        .await
        .context("article http .text()")?;
    extract_article_text(&html, max_chars).ok_or_else(|| anyhow!("no article text found"))
}

#[async_trait]
impl SourceAdapter for RssAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Rss
    }

    fn name(&self) -> &str {
        "rss"
    }

    async fn poll(&self) -> Result<PollBatch> {
        let mut batch = PollBatch::default();
        match &self.mode {
            Mode::Fixture(docs) => {
                let mut failed = 0usize;
                for (feed, xml) in docs {
                    if let Err(e) = self.parse_feed(feed, xml, &mut batch) {
                        batch.push_error(format!("{e:#}"));
                        failed += 1;
                    }
                }
                if !docs.is_empty() && failed == docs.len() {
                    return Err(anyhow!("no rss feed could be parsed"));
                }
            }
            Mode::Http { feeds, client } => {
                let mut failed = 0usize;
                for feed in feeds {
                    let body = client
                        .get(&feed.url)
                        .send()
                        .await
                        .and_then(|r| r.error_for_status());
                    let xml = match body {
                        Ok(resp) => resp.text().await.context("rss http .text()"),
                        Err(e) => Err(e).context("rss http get()"),
                    };
                    let parsed = xml.and_then(|x| self.parse_feed(&feed.name, &x, &mut batch));
                    if let Err(e) = parsed {
                        tracing::warn!(error = ?e, feed = %feed.name, "rss feed failed");
                        counter!("ingest_feed_errors_total", "feed" => feed.name.clone()).increment(1);
                        batch.push_error(format!("{}: {e:#}", feed.name));
                        failed += 1;
                    }
                }
                if !feeds.is_empty() && failed == feeds.len() {
                    return Err(anyhow!("all {failed} rss feeds failed"));
                }
                if self.fetch_full_article {
                    self.enrich(client, &mut batch).await;
                }
            }
        }
        Ok(batch)
    }
}

/// quick-xml only knows the XML entities; fold the common HTML ones first.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}
