//! SQLite-backed event cache with replaceable-event semantics and expiry.
//!
//! Every write runs inside one transaction, so a replaceable key never has
//! zero or two live rows from a reader's point of view. Replacement deletes the
//! old row and inserts the new one; rows are never updated in place.
//!
//! Writes bump a version counter that `watch_by_filter` streams listen on.
//! Invalidation is table-wide.

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use futures_util::stream::{self, Stream};
use rusqlite::{
    params, params_from_iter,
    types::{Type, Value},
    Connection, OptionalExtension, Row, Transaction,
};
use tokio::sync::watch;
use tracing::debug;

use crate::error::Result;
use crate::event::{now, Event, KindClass, Tag};
use crate::filter::{Filter, SortKey};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id         TEXT PRIMARY KEY CHECK (id <> ''),
    pubkey     TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    kind       INTEGER NOT NULL,
    tags       TEXT NOT NULL,
    content    TEXT NOT NULL,
    sig        TEXT NOT NULL,
    d_tag      TEXT NOT NULL DEFAULT '',
    expire_at  INTEGER,
    loops      INTEGER,
    likes      INTEGER,
    comments   INTEGER
);
CREATE INDEX IF NOT EXISTS idx_events_key ON events(pubkey, kind, d_tag);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_events_expire ON events(expire_at) WHERE expire_at IS NOT NULL;
CREATE TABLE IF NOT EXISTS event_tags (
    event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    name     TEXT NOT NULL,
    value    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_event_tags_lookup ON event_tags(name, value);
CREATE INDEX IF NOT EXISTS idx_event_tags_event ON event_tags(event_id);
";

const EVENT_COLUMNS: &str = "id, pubkey, created_at, kind, tags, content, sig";

/// Persistent, queryable event store. Clones share the same database.
#[derive(Clone)]
pub struct EventCache {
    conn: Arc<Mutex<Connection>>,
    version: Arc<watch::Sender<u64>>,
}

fn lock(m: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl EventCache {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        let (version, _) = watch::channel(0);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            version: Arc::new(version),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&mut lock(&conn))).await?
    }

    fn touched(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Store `event`, honouring its `expiration` tag. Returns whether a row was written.
    pub async fn upsert(&self, event: &Event) -> Result<bool> {
        let expire_at = event.expiration();
        self.upsert_inner(event.clone(), expire_at).await
    }

    /// Store `event` with an explicit eviction timestamp.
    pub async fn upsert_with_expiry(&self, event: &Event, expire_at: u64) -> Result<bool> {
        self.upsert_inner(event.clone(), Some(expire_at)).await
    }

    async fn upsert_inner(&self, event: Event, expire_at: Option<u64>) -> Result<bool> {
        let written = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let written = upsert_tx(&tx, &event, expire_at)?;
                tx.commit()?;
                Ok(written)
            })
            .await?;
        if written {
            self.touched();
        }
        Ok(written)
    }

    /// Store many events atomically. Each event goes through the same dispatch
    /// as `upsert`; on any failure nothing is written. Returns rows written.
    pub async fn upsert_batch(&self, events: &[Event]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let events = events.to_vec();
        let written = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0;
                for ev in &events {
                    if upsert_tx(&tx, ev, ev.expiration())? {
                        written += 1;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await?;
        if written > 0 {
            self.touched();
        }
        debug!(written, "cached batch");
        Ok(written)
    }

    /// Events matching `filter`, ordered by its sort key and limited by its limit.
    pub async fn query_by_filter(&self, filter: &Filter) -> Result<Vec<Event>> {
        let filter = filter.clone();
        self.run(move |conn| query_events(conn, &filter)).await
    }

    /// Stream of result sets for `filter`: the current set first, then a fresh
    /// set after every write to the table.
    pub fn watch_by_filter(&self, filter: Filter) -> impl Stream<Item = Result<Vec<Event>>> {
        let rx = self.version.subscribe();
        stream::unfold(
            (self.clone(), filter, rx, true),
            |(cache, filter, mut rx, first)| async move {
                if !first && rx.changed().await.is_err() {
                    return None;
                }
                let result = cache.query_by_filter(&filter).await;
                Some((result, (cache, filter, rx, false)))
            },
        )
    }

    /// Number of events matching `filter`, ignoring its limit.
    pub async fn count_by_filter(&self, filter: &Filter) -> Result<usize> {
        let filter = filter.clone();
        self.run(move |conn| {
            let (clause, values) = where_clause(&filter);
            let sql = format!("SELECT COUNT(*) FROM events{clause}");
            let count: i64 = conn.query_row(&sql, params_from_iter(values), |r| r.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Event>> {
        let id = id.to_string();
        self.run(move |conn| {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], map_event).optional()?)
        })
        .await
    }

    /// Newest stored event for a replaceable key. `d` is only meaningful for
    /// parameterized-replaceable kinds.
    pub async fn latest_replaceable(
        &self,
        author: &str,
        kind: u32,
        d: Option<&str>,
    ) -> Result<Option<Event>> {
        let author = author.to_string();
        let d = match KindClass::of(kind) {
            KindClass::ParameterizedReplaceable => d.unwrap_or("").to_string(),
            _ => String::new(),
        };
        self.run(move |conn| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE pubkey = ?1 AND kind = ?2 AND d_tag = ?3
                 ORDER BY created_at DESC LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![author, kind, d], map_event)
                .optional()?)
        })
        .await
    }

    pub async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let removed = self
            .run(move |conn| Ok(conn.execute("DELETE FROM events WHERE id = ?1", params![id])?))
            .await?;
        if removed > 0 {
            self.touched();
        }
        Ok(removed > 0)
    }

    /// Remove events whose expiry is before `before` (default: now). Returns the count.
    pub async fn delete_expired(&self, before: Option<u64>) -> Result<usize> {
        let cutoff = before.unwrap_or_else(now) as i64;
        let removed = self
            .run(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM events WHERE expire_at IS NOT NULL AND expire_at < ?1",
                    params![cutoff],
                )?)
            })
            .await?;
        if removed > 0 {
            self.touched();
        }
        debug!(removed, "expired events swept");
        Ok(removed)
    }

    /// Total stored events.
    pub async fn len(&self) -> Result<usize> {
        self.count_by_filter(&Filter::default()).await
    }
}

/// Dispatch on kind class inside an open transaction. Returns `false` when the
/// event loses to a stored event with the same key.
fn upsert_tx(tx: &Transaction<'_>, ev: &Event, expire_at: Option<u64>) -> Result<bool> {
    let d_tag = match ev.kind_class() {
        KindClass::Regular => {
            tx.execute("DELETE FROM events WHERE id = ?1", params![ev.id])?;
            ""
        }
        class => {
            let d = if class == KindClass::ParameterizedReplaceable {
                ev.d_tag()
            } else {
                ""
            };
            let newest: Option<i64> = tx.query_row(
                "SELECT MAX(created_at) FROM events WHERE pubkey = ?1 AND kind = ?2 AND d_tag = ?3",
                params![ev.pubkey, ev.kind, d],
                |r| r.get(0),
            )?;
            // Ties keep the stored event.
            if newest.is_some_and(|n| n >= ev.created_at as i64) {
                return Ok(false);
            }
            tx.execute(
                "DELETE FROM events WHERE pubkey = ?1 AND kind = ?2 AND d_tag = ?3",
                params![ev.pubkey, ev.kind, d],
            )?;
            tx.execute("DELETE FROM events WHERE id = ?1", params![ev.id])?;
            d
        }
    };
    tx.execute(
        "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig, d_tag, expire_at, loops, likes, comments)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            ev.id,
            ev.pubkey,
            ev.created_at as i64,
            ev.kind,
            serde_json::to_string(&ev.tags)?,
            ev.content,
            ev.sig,
            d_tag,
            expire_at.map(|t| t as i64),
            ev.metric("loops"),
            ev.metric("likes"),
            ev.metric("comments"),
        ],
    )?;
    let mut stmt =
        tx.prepare_cached("INSERT INTO event_tags (event_id, name, value) VALUES (?1, ?2, ?3)")?;
    for tag in &ev.tags {
        if let (Some(name), Some(value)) = (tag.name(), tag.value()) {
            stmt.execute(params![ev.id, name, value])?;
        }
    }
    Ok(true)
}

fn map_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let tags: String = row.get(4)?;
    let tags: Vec<Tag> = serde_json::from_str(&tags)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(Event {
        id: row.get(0)?,
        pubkey: row.get(1)?,
        created_at: row.get::<_, i64>(2)? as u64,
        kind: row.get(3)?,
        tags,
        content: row.get(5)?,
        sig: row.get(6)?,
    })
}

fn in_list(column: &str, values: &[String], out: &mut Vec<Value>) -> String {
    if values.is_empty() {
        return "0".into();
    }
    let marks = vec!["?"; values.len()].join(", ");
    out.extend(values.iter().cloned().map(Value::Text));
    format!("{column} IN ({marks})")
}

/// Conjunction of every set filter field, with bound values.
fn where_clause(filter: &Filter) -> (String, Vec<Value>) {
    let mut conds: Vec<String> = vec![];
    let mut values: Vec<Value> = vec![];
    if let Some(ids) = &filter.ids {
        conds.push(in_list("id", ids, &mut values));
    }
    if let Some(kinds) = &filter.kinds {
        if kinds.is_empty() {
            conds.push("0".into());
        } else {
            let marks = vec!["?"; kinds.len()].join(", ");
            values.extend(kinds.iter().map(|k| Value::Integer(i64::from(*k))));
            conds.push(format!("kind IN ({marks})"));
        }
    }
    if let Some(authors) = &filter.authors {
        conds.push(in_list("pubkey", authors, &mut values));
    }
    let tag_filters = [
        ("t", &filter.hashtags),
        ("e", &filter.referenced_event_ids),
        ("p", &filter.mentioned_keys),
        ("d", &filter.addressable_identifiers),
    ];
    for (name, wanted) in tag_filters {
        let Some(wanted) = wanted else { continue };
        values.push(Value::Text(name.into()));
        let inner = in_list("value", wanted, &mut values);
        conds.push(format!(
            "id IN (SELECT event_id FROM event_tags WHERE name = ? AND {inner})"
        ));
    }
    if let Some(text) = filter.search_text.as_deref().filter(|t| !t.is_empty()) {
        let escaped = text
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        values.push(Value::Text(format!("%{escaped}%")));
        conds.push("content LIKE ? ESCAPE '\\'".into());
    }
    if let Some(since) = filter.since {
        values.push(Value::Integer(since as i64));
        conds.push("created_at >= ?".into());
    }
    if let Some(until) = filter.until {
        values.push(Value::Integer(until as i64));
        conds.push("created_at <= ?".into());
    }
    if conds.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conds.join(" AND ")), values)
    }
}

fn order_clause(sort: SortKey) -> &'static str {
    match sort {
        SortKey::CreatedAt => " ORDER BY created_at DESC, id ASC",
        SortKey::Loops => " ORDER BY COALESCE(loops, 0) DESC, created_at DESC, id ASC",
        SortKey::Likes => " ORDER BY COALESCE(likes, 0) DESC, created_at DESC, id ASC",
        SortKey::Comments => " ORDER BY COALESCE(comments, 0) DESC, created_at DESC, id ASC",
    }
}

fn query_events(conn: &Connection, filter: &Filter) -> Result<Vec<Event>> {
    let (clause, mut values) = where_clause(filter);
    let mut sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events{clause}{}",
        order_clause(filter.sort)
    );
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        values.push(Value::Integer(limit as i64));
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), map_event)?;
    let mut events = vec![];
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tempfile::TempDir;

    fn ev(id: &str, pubkey: &str, kind: u32, created_at: u64, tags: Vec<Tag>, content: &str) -> Event {
        Event {
            id: id.into(),
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags,
            content: content.into(),
            sig: "sig".into(),
        }
    }

    #[tokio::test]
    async fn replaceable_keeps_newest_and_ties_keep_existing() {
        let cache = EventCache::open_in_memory().unwrap();
        let a = ev("a", "alice", 0, 100, vec![], "old");
        let b = ev("b", "alice", 0, 50, vec![], "older");
        let c = ev("c", "alice", 0, 150, vec![], "new");
        let tie = ev("t", "alice", 0, 150, vec![], "tie");

        assert!(cache.upsert(&a).await.unwrap());
        assert!(!cache.upsert(&b).await.unwrap());
        let stored = cache.latest_replaceable("alice", 0, None).await.unwrap().unwrap();
        assert_eq!(stored.content, "old");

        assert!(cache.upsert(&c).await.unwrap());
        assert!(!cache.upsert(&tie).await.unwrap());
        let all = cache
            .query_by_filter(&Filter::new().kinds([0]).authors(["alice"]))
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "c");
        assert!(cache.get_by_id("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn parameterized_replaceable_is_keyed_by_d_tag() {
        let cache = EventCache::open_in_memory().unwrap();
        let kind = 34236;
        let d = |v: &str| vec![Tag::new(["d", v])];
        cache.upsert(&ev("x1", "bob", kind, 10, d("clip"), "")).await.unwrap();
        cache.upsert(&ev("y1", "bob", kind, 10, d("other"), "")).await.unwrap();
        cache.upsert(&ev("x2", "bob", kind, 20, d("clip"), "")).await.unwrap();
        cache.upsert(&ev("x0", "bob", kind, 5, d("clip"), "")).await.unwrap();
        // Missing d-tag shares the empty identifier.
        cache.upsert(&ev("n1", "bob", kind, 30, vec![], "")).await.unwrap();
        cache.upsert(&ev("n2", "bob", kind, 40, d(""), "")).await.unwrap();

        let mut ids: Vec<String> = cache
            .query_by_filter(&Filter::new().kinds([kind]))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["n2", "x2", "y1"]);
        let latest = cache
            .latest_replaceable("bob", kind, Some("clip"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, "x2");
    }

    #[tokio::test]
    async fn regular_upsert_is_idempotent() {
        let cache = EventCache::open_in_memory().unwrap();
        let e = ev("r1", "carol", 1, 10, vec![Tag::new(["t", "fun"])], "hello");
        cache.upsert(&e).await.unwrap();
        cache.upsert(&e).await.unwrap();
        assert_eq!(cache.len().await.unwrap(), 1);
        assert_eq!(cache.get_by_id("r1").await.unwrap().unwrap(), e);
        assert_eq!(
            cache
                .count_by_filter(&Filter::new().hashtags(["fun"]))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn query_matches_only_filtered_events_newest_first() {
        let cache = EventCache::open_in_memory().unwrap();
        let mut batch = vec![
            ev("m1", "abc", 1, 10, vec![], ""),
            ev("m2", "abc", 1, 30, vec![], ""),
            ev("m3", "abc", 1, 20, vec![], ""),
        ];
        batch.push(ev("n1", "abc", 7, 40, vec![], ""));
        batch.push(ev("n2", "xyz", 1, 50, vec![], ""));
        batch.push(ev("n3", "xyz", 7, 60, vec![], ""));
        batch.push(ev("n4", "def", 1, 70, vec![], ""));
        batch.push(ev("n5", "abc", 6, 80, vec![], ""));
        assert_eq!(cache.upsert_batch(&batch).await.unwrap(), 8);

        let found = cache
            .query_by_filter(&Filter::new().kinds([1]).authors(["abc"]).limit(10))
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m1"]);

        let limited = cache
            .query_by_filter(&Filter::new().kinds([1]).authors(["abc"]).limit(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn tag_fields_are_disjunctive_within_and_conjunctive_across() {
        let cache = EventCache::open_in_memory().unwrap();
        cache
            .upsert_batch(&[
                ev("a", "p", 1, 1, vec![Tag::new(["t", "cats"])], ""),
                ev("b", "p", 1, 2, vec![Tag::new(["t", "dogs"])], ""),
                ev("c", "p", 1, 3, vec![Tag::new(["t", "birds"])], ""),
                ev(
                    "d",
                    "p",
                    1,
                    4,
                    vec![Tag::new(["t", "cats"]), Tag::new(["p", "friend"])],
                    "",
                ),
            ])
            .await
            .unwrap();
        let any = cache
            .query_by_filter(&Filter::new().hashtags(["cats", "dogs"]))
            .await
            .unwrap();
        assert_eq!(
            any.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["d", "b", "a"]
        );
        let both = cache
            .query_by_filter(&Filter::new().hashtags(["cats"]).pubkeys(["friend"]))
            .await
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].id, "d");
    }

    #[tokio::test]
    async fn search_since_until() {
        let cache = EventCache::open_in_memory().unwrap();
        cache
            .upsert_batch(&[
                ev("a", "p", 1, 10, vec![], "Skateboard trick"),
                ev("b", "p", 1, 20, vec![], "cooking 100% pasta"),
                ev("c", "p", 1, 30, vec![], "another skateboard"),
            ])
            .await
            .unwrap();
        let hits = cache
            .query_by_filter(&Filter::new().search("skateboard"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        let pct = cache.query_by_filter(&Filter::new().search("100%")).await.unwrap();
        assert_eq!(pct.len(), 1);
        let window = cache
            .query_by_filter(&Filter::new().since(15).until(30))
            .await
            .unwrap();
        assert_eq!(
            window.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["c", "b"]
        );
    }

    #[tokio::test]
    async fn engagement_sort_breaks_ties_by_recency() {
        let cache = EventCache::open_in_memory().unwrap();
        let loops = |n: &str| vec![Tag::new(["loops", n])];
        cache
            .upsert_batch(&[
                ev("low", "p", 1, 50, loops("1"), ""),
                ev("high_old", "p", 1, 10, loops("9"), ""),
                ev("high_new", "p", 1, 20, loops("9"), ""),
                ev("none", "p", 1, 99, vec![], ""),
            ])
            .await
            .unwrap();
        let sorted = cache
            .query_by_filter(&Filter::new().sort(SortKey::Loops))
            .await
            .unwrap();
        assert_eq!(
            sorted.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["high_new", "high_old", "low", "none"]
        );
    }

    #[tokio::test]
    async fn expiry_sweep() {
        let cache = EventCache::open_in_memory().unwrap();
        cache
            .upsert_with_expiry(&ev("soon", "p", 1, 1, vec![], ""), 100)
            .await
            .unwrap();
        cache
            .upsert(&ev("tagged", "p", 1, 1, vec![Tag::new(["expiration", "150"])], ""))
            .await
            .unwrap();
        cache.upsert(&ev("forever", "p", 1, 1, vec![], "")).await.unwrap();

        assert_eq!(cache.delete_expired(Some(100)).await.unwrap(), 0);
        assert_eq!(cache.delete_expired(Some(101)).await.unwrap(), 1);
        assert_eq!(cache.delete_expired(None).await.unwrap(), 1);
        assert_eq!(cache.len().await.unwrap(), 1);
        assert!(cache.get_by_id("forever").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let cache = EventCache::open_in_memory().unwrap();
        let good = ev("good", "p", 1, 1, vec![], "");
        let bad = ev("", "p", 1, 2, vec![], "");
        assert!(cache.upsert_batch(&[good, bad]).await.is_err());
        assert_eq!(cache.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_uses_replaceable_dispatch() {
        let cache = EventCache::open_in_memory().unwrap();
        let written = cache
            .upsert_batch(&[
                ev("new", "p", 3, 20, vec![], ""),
                ev("old", "p", 3, 10, vec![], ""),
            ])
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(cache.len().await.unwrap(), 1);
        assert!(cache.get_by_id("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_by_id_cascades_tags() {
        let cache = EventCache::open_in_memory().unwrap();
        cache
            .upsert(&ev("a", "p", 1, 1, vec![Tag::new(["t", "x"])], ""))
            .await
            .unwrap();
        assert!(cache.delete_by_id("a").await.unwrap());
        assert!(!cache.delete_by_id("a").await.unwrap());
        assert_eq!(
            cache.count_by_filter(&Filter::new().hashtags(["x"])).await.unwrap(),
            0
        );
        let orphans: i64 = {
            let conn = lock(&cache.conn);
            conn.query_row("SELECT COUNT(*) FROM event_tags", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn watch_reemits_after_writes() {
        let cache = EventCache::open_in_memory().unwrap();
        let stream = cache.watch_by_filter(Filter::new().kinds([1]));
        futures_util::pin_mut!(stream);
        assert!(stream.next().await.unwrap().unwrap().is_empty());

        cache.upsert(&ev("a", "p", 1, 1, vec![], "")).await.unwrap();
        let next = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(next.len(), 1);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("events.sqlite3");
        {
            let cache = EventCache::open(&path).unwrap();
            cache.upsert(&ev("a", "p", 1, 1, vec![], "keep")).await.unwrap();
        }
        let cache = EventCache::open(&path).unwrap();
        assert_eq!(cache.get_by_id("a").await.unwrap().unwrap().content, "keep");
    }
}
