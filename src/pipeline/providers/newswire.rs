// src/pipeline/providers/newswire.rs
//! JSON newswire connector. Issues one upstream request per keyword (the API
//! takes a single `q` term), so the budget estimate scales with the keyword
//! set. Fixture mode parses an embedded response once and filters locally.

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;
use serde::Deserialize;

use crate::pipeline::providers::matches_keywords;
use crate::pipeline::types::{Candidate, DateWindow, SourceConnector};

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    articles: Vec<Article>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Article {
    title: Option<String>,
    url: Option<String>,
    description: Option<String>,
    published_at: Option<String>,
    id: Option<String>,
}

pub struct NewswireConnector {
    name: String,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        base_url: String,
        api_key: String,
        client: reqwest::Client,
    },
}

impl NewswireConnector {
    pub fn from_fixture(name: &str, json: &str) -> Self {
        Self {
            name: name.to_string(),
            mode: Mode::Fixture(json.to_string()),
        }
    }

    pub fn from_url(name: &str, base_url: &str, api_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("content-admission-pipeline/0.1")
            .connect_timeout(std::time::Duration::from_secs(4))
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            name: name.to_string(),
            mode: Mode::Http {
                base_url: base_url.to_string(),
                api_key: api_key.to_string(),
                client,
            },
        }
    }

    fn collect(&self, body: &str, keywords: &[String], window: &DateWindow) -> Result<Vec<Candidate>> {
        let resp: ApiResponse = serde_json::from_str(body).context("parsing newswire json")?;
        let fetched_at = now_unix();

        let mut out = Vec::with_capacity(resp.articles.len());
        for art in resp.articles {
            let title = art.title.as_deref().unwrap_or_default().trim().to_string();
            if title.is_empty() {
                continue;
            }
            let summary = art
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

            // ISO-8601 published timestamp; anything unparseable becomes None.
            let published_at = art
                .published_at
                .as_deref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.timestamp())
                .and_then(|x| u64::try_from(x).ok());
            if let Some(ts) = published_at {
                if !window.contains(ts) {
                    continue;
                }
            }

            let url = art.url.clone().unwrap_or_default();
            let provider_id = art.id.or(art.url).unwrap_or_else(|| title.clone());

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

        counter!("admission_fetched_total").increment(out.len() as u64);
        Ok(out)
    }
}

#[async_trait]
impl SourceConnector for NewswireConnector {
    async fn search(&self, keywords: &[String], window: &DateWindow) -> Result<Vec<Candidate>> {
        match &self.mode {
            Mode::Fixture(json) => self.collect(json, keywords, window),
            Mode::Http {
                base_url,
                api_key,
                client,
            } => {
                let mut out = Vec::new();
                // One request per keyword; duplicates across keyword queries
                // are left for the dedup stage.
                let from = window.since.to_string();
                let to = window.until.to_string();
                for kw in keywords {
                    let body = client
                        .get(base_url)
                        .query(&[
                            ("q", kw.as_str()),
                            ("from", from.as_str()),
                            ("to", to.as_str()),
                        ])
                        .bearer_auth(api_key)
                        .send()
                        .await
                        .with_context(|| format!("{} http get", self.name))?
                        .error_for_status()
                        .with_context(|| format!("{} http status", self.name))?
                        .text()
                        .await
                        .with_context(|| format!("{} http body", self.name))?;
                    out.extend(self.collect(&body, &[], window)?);
                }
                Ok(out)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn estimated_requests(&self, keywords: &[String]) -> u64 {
        keywords.len().max(1) as u64
    }
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
      "articles": [
        {"title": "Grid-scale battery order announced", "url": "https://n.example/a",
         "description": "Utility signs storage deal.", "publishedAt": "2024-01-01T10:00:00Z", "id": "nw-1"},
        {"title": "Celebrity gossip roundup", "url": "https://n.example/b",
         "publishedAt": "2024-01-01T11:00:00Z", "id": "nw-2"},
        {"title": "Battery recycling pilot", "url": "https://n.example/c",
         "publishedAt": "garbled", "id": "nw-3"}
      ]
    }"#;

    fn jan_2024_window() -> DateWindow {
        DateWindow {
            since: 1_704_000_000,
            until: 1_704_200_000,
        }
    }

    #[tokio::test]
    async fn fixture_filters_by_keyword_and_parses_dates() {
        let conn = NewswireConnector::from_fixture("newswire", BODY);
        let kws = vec!["battery".to_string()];
        let items = conn.search(&kws, &jan_2024_window()).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].provider_id, "nw-1");
        assert!(items[0].published_at.is_some());
        assert_eq!(items[1].provider_id, "nw-3");
        assert_eq!(items[1].published_at, None); // garbled date, item kept
    }

    #[test]
    fn request_estimate_scales_with_keywords() {
        let conn = NewswireConnector::from_fixture("newswire", "{}");
        let kws: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(conn.estimated_requests(&kws), 3);
        assert_eq!(conn.estimated_requests(&[]), 1);
    }
}
