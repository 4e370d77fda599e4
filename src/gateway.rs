//! REST gateway client: a faster read path in front of relays.
//!
//! The HTTP implementation speaks the `/query` endpoint of file-backed relays:
//! filter fields as URL parameters, newline-delimited JSON events back.
//! Every failure, including non-2xx statuses, reports the gateway as
//! unavailable so callers can fall back to relays.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;

/// Result of a gateway query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayResponse {
    pub events: Vec<Event>,
    pub has_events: bool,
}

impl GatewayResponse {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            has_events: !events.is_empty(),
            events,
        }
    }
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn query(&self, filter: &Filter) -> Result<GatewayResponse>;

    async fn get_event(&self, id: &str) -> Result<Option<Event>>;

    /// Latest kind-0 metadata event for `author`.
    async fn get_profile(&self, author: &str) -> Result<Option<Event>>;
}

#[derive(Debug, Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch(&self, params: Vec<(&'static str, String)>) -> Result<Vec<Event>> {
        let url = format!("{}/query", self.base_url);
        debug!(%url, ?params, "gateway query");
        let response = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::GatewayUnavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::GatewayUnavailable(format!(
                "gateway returned status {status}"
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::GatewayUnavailable(e.to_string()))?;
        parse_events(&body)
    }
}

/// Accept either NDJSON or a JSON array of events.
fn parse_events(body: &str) -> Result<Vec<Event>> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(vec![]);
    }
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Error::from))
        .collect()
}

fn csv(values: &[String]) -> String {
    values.join(",")
}

/// Translate a filter into `/query` URL parameters.
fn query_params(filter: &Filter) -> Vec<(&'static str, String)> {
    let mut params = vec![];
    if let Some(ids) = &filter.ids {
        params.push(("ids", csv(ids)));
    }
    if let Some(authors) = &filter.authors {
        params.push(("authors", csv(authors)));
    }
    if let Some(kinds) = &filter.kinds {
        let kinds: Vec<String> = kinds.iter().map(u32::to_string).collect();
        params.push(("kinds", csv(&kinds)));
    }
    if let Some(t) = &filter.hashtags {
        params.push(("t", csv(t)));
    }
    if let Some(e) = &filter.referenced_event_ids {
        params.push(("e", csv(e)));
    }
    if let Some(p) = &filter.mentioned_keys {
        params.push(("p", csv(p)));
    }
    if let Some(d) = &filter.addressable_identifiers {
        params.push(("d", csv(d)));
    }
    if let Some(search) = &filter.search_text {
        params.push(("search", search.clone()));
    }
    if let Some(since) = filter.since {
        params.push(("since", since.to_string()));
    }
    if let Some(until) = filter.until {
        params.push(("until", until.to_string()));
    }
    if let Some(limit) = filter.limit {
        params.push(("limit", limit.to_string()));
    }
    params
}

#[async_trait]
impl GatewayClient for HttpGateway {
    async fn query(&self, filter: &Filter) -> Result<GatewayResponse> {
        let events = self.fetch(query_params(filter)).await?;
        Ok(GatewayResponse::new(events))
    }

    async fn get_event(&self, id: &str) -> Result<Option<Event>> {
        let filter = Filter::new().ids([id]).limit(1);
        let events = self.fetch(query_params(&filter)).await?;
        Ok(events.into_iter().find(|e| e.id == id))
    }

    async fn get_profile(&self, author: &str) -> Result<Option<Event>> {
        let filter = Filter::new().authors([author]).kinds([0]).limit(1);
        let events = self.fetch(query_params(&filter)).await?;
        Ok(events.into_iter().max_by_key(|e| e.created_at))
    }
}
