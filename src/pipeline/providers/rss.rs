// src/pipeline/providers/rss.rs
//! RSS source connector. One feed fetch per search call; items are filtered
//! by keyword and date window locally. Supports an HTTP mode for production
//! and a fixture mode so the pipeline is testable offline.

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use crate::pipeline::providers::matches_keywords;
use crate::pipeline::types::{Candidate, DateWindow, SourceConnector};

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
    guid: Option<String>,
}

/// RFC 2822 pubDate → unix seconds. Absent or malformed dates become `None`.
fn parse_pub_date(ts: &str) -> Option<u64> {
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
        .and_then(|x| u64::try_from(x).ok())
}

pub struct RssConnector {
    name: String,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http { url: String, client: reqwest::Client },
}

impl RssConnector {
    pub fn from_fixture(name: &str, xml: &str) -> Self {
        Self {
            name: name.to_string(),
            mode: Mode::Fixture(xml.to_string()),
        }
    }

    pub fn from_url(name: &str, url: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("content-admission-pipeline/0.1")
            .connect_timeout(std::time::Duration::from_secs(4))
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            name: name.to_string(),
            mode: Mode::Http {
                url: url.to_string(),
                client,
            },
        }
    }

    fn parse_items(&self, xml: &str, keywords: &[String], window: &DateWindow) -> Result<Vec<Candidate>> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(xml);
        let rss: Rss = from_str(&xml_clean).context("parsing rss xml")?;
        let fetched_at = now_unix();

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let title = it.title.as_deref().unwrap_or_default().trim().to_string();
            if title.is_empty() {
                continue;
            }
            let summary = it
                .description
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);

            let searchable = match &summary {
                Some(d) => format!("{title} {d}"),
                None => title.clone(),
            };
            if !matches_keywords(&searchable, keywords) {
                continue;
            }

            let published_at = it.pub_date.as_deref().and_then(parse_pub_date);
            // Items with a known date outside the window are skipped; items
            // with no usable date are kept and left to downstream gates.
            if let Some(ts) = published_at {
                if !window.contains(ts) {
                    continue;
                }
            }

            let url = it.link.clone().unwrap_or_default();
            let provider_id = it.guid.or(it.link).unwrap_or_else(|| title.clone());

            out.push(Candidate {
                source: self.name.clone(),
                url,
                title,
                summary,
                published_at,
                fetched_at,
                provider_id,
            });
        }

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("admission_fanout_parse_ms").record(ms);
        counter!("admission_fetched_total").increment(out.len() as u64);
        Ok(out)
    }
}

#[async_trait]
impl SourceConnector for RssConnector {
    async fn search(&self, keywords: &[String], window: &DateWindow) -> Result<Vec<Candidate>> {
        match &self.mode {
            Mode::Fixture(xml) => self.parse_items(xml, keywords, window),
            Mode::Http { url, client } => {
                let body = client
                    .get(url)
                    .send()
                    .await
                    .with_context(|| format!("{} http get", self.name))?
                    .error_for_status()
                    .with_context(|| format!("{} http status", self.name))?
                    .text()
                    .await
                    .with_context(|| format!("{} http body", self.name))?;
                self.parse_items(&body, keywords, window)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Example Wire</title>
  <item>
    <title>Fusion startup hits ignition milestone</title>
    <link>https://example.com/fusion</link>
    <guid>wire-1</guid>
    <pubDate>Mon, 01 Jan 2024 12:00:00 +0000</pubDate>
    <description>Net energy gain reported.</description>
  </item>
  <item>
    <title>Quarterly earnings recap</title>
    <link>https://example.com/earnings</link>
    <guid>wire-2</guid>
    <pubDate>Mon, 01 Jan 2024 13:00:00 +0000</pubDate>
  </item>
  <item>
    <title>Fusion conference announced</title>
    <link>https://example.com/conf</link>
    <guid>wire-3</guid>
    <pubDate>not a date</pubDate>
  </item>
</channel></rss>"#;

    fn jan_2024_window() -> DateWindow {
        DateWindow {
            since: 1_704_000_000,
            until: 1_704_200_000,
        }
    }

    #[tokio::test]
    async fn fixture_feed_filters_by_keyword() {
        let conn = RssConnector::from_fixture("wire", FEED);
        let kws = vec!["fusion".to_string()];
        let items = conn.search(&kws, &jan_2024_window()).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|c| c.title.to_lowercase().contains("fusion")));
    }

    #[tokio::test]
    async fn malformed_pub_date_becomes_none_and_item_is_kept() {
        let conn = RssConnector::from_fixture("wire", FEED);
        let kws = vec!["conference".to_string()];
        let items = conn.search(&kws, &jan_2024_window()).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].published_at, None);
    }

    #[tokio::test]
    async fn dated_items_outside_window_are_skipped() {
        let conn = RssConnector::from_fixture("wire", FEED);
        let outside = DateWindow {
            since: 100,
            until: 200,
        };
        let items = conn.search(&[], &outside).await.unwrap();
        // Only the undated item survives a window that excludes Jan 2024.
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].provider_id, "wire-3");
    }
}
