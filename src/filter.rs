//! Query/subscription filters and their wire representation.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::event::Event;

/// Ordering requested for cache results.
///
/// Engagement orderings read the integer `loops`, `likes` and `comments` tags
/// carried by short-video events; ties break by `created_at` descending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    CreatedAt,
    Loops,
    Likes,
    Comments,
}

impl SortKey {
    /// Parse a CLI/config spelling such as `loops`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created_at" | "newest" => Some(SortKey::CreatedAt),
            "loops" => Some(SortKey::Loops),
            "likes" => Some(SortKey::Likes),
            "comments" => Some(SortKey::Comments),
            _ => None,
        }
    }
}

/// NIP-01 filter.
///
/// Unset fields impose no constraint. Multi-valued fields match when any of
/// their values match; distinct fields are combined conjunctively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(rename = "#t", default, skip_serializing_if = "Option::is_none")]
    pub hashtags: Option<Vec<String>>,
    #[serde(rename = "#e", default, skip_serializing_if = "Option::is_none")]
    pub referenced_event_ids: Option<Vec<String>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub mentioned_keys: Option<Vec<String>>,
    #[serde(rename = "#d", default, skip_serializing_if = "Option::is_none")]
    pub addressable_identifiers: Option<Vec<String>>,
    #[serde(rename = "search", default, skip_serializing_if = "Option::is_none")]
    pub search_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Local ordering only; never sent to relays.
    #[serde(skip)]
    pub sort: SortKey,
}

fn strings<I, S>(values: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Some(values.into_iter().map(Into::into).collect())
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.ids = strings(ids);
        self
    }

    pub fn kinds<I: IntoIterator<Item = u32>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors<I: IntoIterator<Item = S>, S: Into<String>>(mut self, authors: I) -> Self {
        self.authors = strings(authors);
        self
    }

    pub fn hashtags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.hashtags = strings(tags);
        self
    }

    pub fn events<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.referenced_event_ids = strings(ids);
        self
    }

    pub fn pubkeys<I: IntoIterator<Item = S>, S: Into<String>>(mut self, keys: I) -> Self {
        self.mentioned_keys = strings(keys);
        self
    }

    pub fn identifiers<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.addressable_identifiers = strings(ids);
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search_text = Some(text.into());
        self
    }

    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: u64) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sort(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }

    /// Copy with every multi-valued field sorted and de-duplicated.
    pub fn canonical(&self) -> Self {
        fn norm<T: Ord + Clone>(v: &Option<Vec<T>>) -> Option<Vec<T>> {
            v.as_ref().map(|vals| {
                let mut vals = vals.clone();
                vals.sort();
                vals.dedup();
                vals
            })
        }
        Self {
            ids: norm(&self.ids),
            kinds: norm(&self.kinds),
            authors: norm(&self.authors),
            hashtags: norm(&self.hashtags),
            referenced_event_ids: norm(&self.referenced_event_ids),
            mentioned_keys: norm(&self.mentioned_keys),
            addressable_identifiers: norm(&self.addressable_identifiers),
            search_text: self.search_text.clone(),
            since: self.since,
            until: self.until,
            limit: self.limit,
            sort: self.sort,
        }
    }

    /// Wire JSON object for REQ/COUNT frames.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }

    /// In-memory counterpart of the cache's filter semantics.
    ///
    /// An empty list matches nothing. Tag conditions look at the first value of
    /// each tag; `search` is an ASCII case-insensitive substring of `content`.
    pub fn matches(&self, event: &Event) -> bool {
        fn any_of<T: PartialEq>(wanted: &Option<Vec<T>>, value: &T) -> bool {
            wanted.as_ref().map_or(true, |w| w.contains(value))
        }
        if !any_of(&self.ids, &event.id)
            || !any_of(&self.kinds, &event.kind)
            || !any_of(&self.authors, &event.pubkey)
        {
            return false;
        }
        let tag_filters = [
            ("t", &self.hashtags),
            ("e", &self.referenced_event_ids),
            ("p", &self.mentioned_keys),
            ("d", &self.addressable_identifiers),
        ];
        for (name, wanted) in tag_filters {
            let Some(wanted) = wanted else { continue };
            if !event.tag_values(name).any(|v| wanted.iter().any(|w| w == v)) {
                return false;
            }
        }
        if let Some(text) = self.search_text.as_deref().filter(|t| !t.is_empty()) {
            let content = event.content.to_ascii_lowercase();
            if !content.contains(&text.to_ascii_lowercase()) {
                return false;
            }
        }
        self.since.map_or(true, |s| event.created_at >= s)
            && self.until.map_or(true, |u| event.created_at <= u)
    }
}

/// Deterministic subscription id for a filter set.
///
/// Filter sets that differ only in value order, duplicate values, or the order
/// of the filters themselves produce the same id.
pub fn subscription_id(filters: &[Filter]) -> String {
    let mut parts: Vec<String> = filters
        .iter()
        .map(|f| f.canonical().to_json().to_string())
        .collect();
    parts.sort();
    parts.dedup();
    let mut hasher = Sha1::new();
    for part in &parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    format!("sub-{}", hex::encode(hasher.finalize()))
}
