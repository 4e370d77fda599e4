//! Relay fleet: the configured relay list, its connections, and a merged status view.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{Connection, ConnectionConfig, ConnectionError, ConnectionState};
use crate::error::{Error, Result};
use crate::event::{now, Signer};
use crate::relay_store::RelayListStore;

pub const DEFAULT_RELAY: &str = "wss://relay.divine.video";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayRecord {
    pub url: String,
    pub configured: bool,
    pub is_default: bool,
}

/// Snapshot of one relay's connection health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub url: String,
    pub state: ConnectionState,
    pub error_count: u32,
    pub last_connected_at: Option<u64>,
    pub last_error_at: Option<u64>,
    pub error_message: Option<String>,
}

impl ConnectionStatus {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: ConnectionState::Disconnected,
            error_count: 0,
            last_connected_at: None,
            last_error_at: None,
            error_message: None,
        }
    }
}

/// Outcome of a relay list edit. Expected user input problems are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayChange {
    Added(String),
    Removed(String),
    AlreadyConfigured(String),
    NotConfigured(String),
    /// The default relay cannot be removed.
    DefaultProtected,
    Invalid(String),
}

impl RelayChange {
    /// Whether the configured set changed.
    pub fn applied(&self) -> bool {
        matches!(self, RelayChange::Added(_) | RelayChange::Removed(_))
    }
}

/// "N of M relays connected".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    pub connected: usize,
    pub total: usize,
}

impl fmt::Display for FleetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} relays connected", self.connected, self.total)
    }
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub default_relay: String,
    pub connection: ConnectionConfig,
    /// Interval of the status reconciliation poll.
    pub status_poll: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            default_relay: DEFAULT_RELAY.to_string(),
            connection: ConnectionConfig::default(),
            status_poll: Duration::from_secs(5),
        }
    }
}

/// Normalize user input into a relay URL.
///
/// Adds `wss://` when no scheme is given and strips trailing slashes. Only
/// `ws` and `wss` URLs with a non-empty host are accepted.
pub fn normalize_url(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidRelayUrl(input.to_string()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("wss://{trimmed}")
    };
    let parsed =
        Url::parse(&candidate).map_err(|_| Error::InvalidRelayUrl(input.to_string()))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(Error::InvalidRelayUrl(input.to_string()));
    }
    match parsed.host_str() {
        Some(h) if !h.is_empty() => Ok(candidate),
        _ => Err(Error::InvalidRelayUrl(input.to_string())),
    }
}

/// Owns the configured relays and their connections. Clones share state.
#[derive(Clone)]
pub struct RelayFleet {
    inner: Arc<FleetInner>,
}

struct FleetInner {
    config: FleetConfig,
    store: Arc<dyn RelayListStore>,
    signer: Option<Arc<dyn Signer>>,
    relays: Mutex<Vec<String>>,
    connections: Mutex<HashMap<String, Connection>>,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    statuses: watch::Sender<BTreeMap<String, ConnectionStatus>>,
    initialized: AtomicBool,
    disposed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RelayFleet {
    /// The default relay is normalized here so every later comparison sees one form.
    pub fn new(
        mut config: FleetConfig,
        store: Arc<dyn RelayListStore>,
        signer: Option<Arc<dyn Signer>>,
    ) -> Self {
        match normalize_url(&config.default_relay) {
            Ok(url) => config.default_relay = url,
            Err(e) => {
                warn!(error = %e, "default relay is not a valid relay url");
                config.default_relay = config.default_relay.trim().to_string();
            }
        }
        let (statuses, _) = watch::channel(BTreeMap::new());
        Self {
            inner: Arc::new(FleetInner {
                config,
                store,
                signer,
                relays: Mutex::new(vec![]),
                connections: Mutex::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
                poller: Mutex::new(None),
                statuses,
                initialized: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn default_relay(&self) -> &str {
        &self.inner.config.default_relay
    }

    /// Load the persisted list, connect to every relay, and start status polling.
    /// Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_live()?;
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let loaded = match self.inner.store.load_relays().await {
            Ok(urls) => urls,
            Err(e) => {
                warn!(error = %e, "failed to load relay list, starting from default");
                vec![]
            }
        };
        let mut urls: Vec<String> = vec![];
        for raw in &loaded {
            match normalize_url(raw) {
                Ok(url) if !urls.contains(&url) => urls.push(url),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "dropping persisted relay"),
            }
        }
        let default = self.inner.config.default_relay.clone();
        if !urls.contains(&default) {
            urls.insert(0, default);
        }
        if urls != loaded {
            if let Err(e) = self.inner.store.save_relays(&urls).await {
                warn!(error = %e, "failed to persist relay list");
            }
        }

        let conns: Vec<Connection> = urls.iter().map(|u| self.attach(u)).collect();
        *lock(&self.inner.relays) = urls;
        info!(relays = conns.len(), "connecting to relays");
        let results = join_all(conns.iter().map(|c| c.connect())).await;
        for (conn, res) in conns.iter().zip(results) {
            if let Err(e) = res {
                debug!(relay = %conn.url(), error = %e, "initial connect failed");
            }
        }
        self.start_poller();
        Ok(())
    }

    /// Create a connection, its status entry and its watcher.
    fn attach(&self, url: &str) -> Connection {
        let conn = Connection::new(
            url,
            self.inner.config.connection.clone(),
            self.inner.signer.clone(),
        );
        self.inner.statuses.send_modify(|m| {
            m.insert(url.to_string(), ConnectionStatus::new(url));
        });
        let watcher = tokio::spawn(watch_connection(
            Arc::downgrade(&self.inner),
            conn.url().to_string(),
            conn.subscribe_state(),
            conn.subscribe_errors(),
        ));
        if let Some(old) = lock(&self.inner.watchers).insert(url.to_string(), watcher) {
            old.abort();
        }
        if let Some(old) = lock(&self.inner.connections).insert(url.to_string(), conn.clone()) {
            old.dispose();
        }
        conn
    }

    fn start_poller(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.status_poll;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.sync_statuses();
            }
        });
        if let Some(old) = lock(&self.inner.poller).replace(task) {
            old.abort();
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    /// Add a relay and connect to it. Storage failures are the only `Err`.
    pub async fn add_relay(&self, input: &str) -> Result<RelayChange> {
        self.ensure_live()?;
        let url = match normalize_url(input) {
            Ok(url) => url,
            Err(_) => return Ok(RelayChange::Invalid(input.to_string())),
        };
        let urls = {
            let mut relays = lock(&self.inner.relays);
            if relays.contains(&url) {
                return Ok(RelayChange::AlreadyConfigured(url));
            }
            relays.push(url.clone());
            relays.clone()
        };
        let conn = self.attach(&url);
        self.inner.store.save_relays(&urls).await?;
        info!(relay = %url, "relay added");
        if let Err(e) = conn.connect().await {
            debug!(relay = %url, error = %e, "connect after add failed");
        }
        Ok(RelayChange::Added(url))
    }

    /// Forget a relay. The default relay is refused.
    pub async fn remove_relay(&self, input: &str) -> Result<RelayChange> {
        self.ensure_live()?;
        let Ok(url) = normalize_url(input) else {
            return Ok(RelayChange::NotConfigured(input.to_string()));
        };
        if url == self.inner.config.default_relay {
            return Ok(RelayChange::DefaultProtected);
        }
        let urls = {
            let mut relays = lock(&self.inner.relays);
            let Some(pos) = relays.iter().position(|u| *u == url) else {
                return Ok(RelayChange::NotConfigured(url));
            };
            relays.remove(pos);
            relays.clone()
        };
        if let Some(watcher) = lock(&self.inner.watchers).remove(&url) {
            watcher.abort();
        }
        if let Some(conn) = lock(&self.inner.connections).remove(&url) {
            conn.dispose();
        }
        self.inner.statuses.send_modify(|m| {
            m.remove(&url);
        });
        self.inner.store.save_relays(&urls).await?;
        info!(relay = %url, "relay removed");
        Ok(RelayChange::Removed(url))
    }

    /// Reconnect every configured relay that is not ready, resetting its backoff.
    /// Returns how many were retried.
    pub async fn retry_disconnected_relays(&self) -> usize {
        let stale: Vec<Connection> = self
            .connections()
            .into_iter()
            .filter(|c| !c.is_ready())
            .collect();
        let results = join_all(stale.iter().map(|c| c.reconnect())).await;
        for (conn, res) in stale.iter().zip(results) {
            if let Err(e) = res {
                debug!(relay = %conn.url(), error = %e, "retry failed");
            }
        }
        stale.len()
    }

    /// Reconnect one relay. `Ok(false)` when it is not configured.
    pub async fn reconnect_relay(&self, input: &str) -> Result<bool> {
        let Ok(url) = normalize_url(input) else {
            return Ok(false);
        };
        let Some(conn) = self.connection(&url) else {
            return Ok(false);
        };
        if !conn.is_ready() {
            conn.reconnect().await?;
        }
        Ok(true)
    }

    /// Configured relay URLs in order, default first unless persisted otherwise.
    pub fn relay_urls(&self) -> Vec<String> {
        lock(&self.inner.relays).clone()
    }

    pub fn relays(&self) -> Vec<RelayRecord> {
        let default = &self.inner.config.default_relay;
        self.relay_urls()
            .into_iter()
            .map(|url| RelayRecord {
                is_default: &url == default,
                url,
                configured: true,
            })
            .collect()
    }

    pub fn connection(&self, url: &str) -> Option<Connection> {
        if !lock(&self.inner.relays).iter().any(|u| u == url) {
            return None;
        }
        lock(&self.inner.connections).get(url).cloned()
    }

    /// Connections of configured relays, in configured order.
    pub fn connections(&self) -> Vec<Connection> {
        let relays = self.relay_urls();
        let conns = lock(&self.inner.connections);
        relays.iter().filter_map(|u| conns.get(u).cloned()).collect()
    }

    /// Connections that are configured and currently ready.
    pub fn ready_connections(&self) -> Vec<Connection> {
        self.connections()
            .into_iter()
            .filter(|c| c.is_ready())
            .collect()
    }

    pub fn connected_relays(&self) -> Vec<String> {
        self.ready_connections()
            .into_iter()
            .map(|c| c.url().to_string())
            .collect()
    }

    pub fn summary(&self) -> FleetSummary {
        FleetSummary {
            connected: self.ready_connections().len(),
            total: lock(&self.inner.relays).len(),
        }
    }

    /// Pull each connection's current state into the status map now instead of
    /// waiting for the next poll.
    pub fn sync_statuses(&self) {
        self.inner.sync_statuses();
    }

    /// Current status map.
    pub fn statuses(&self) -> BTreeMap<String, ConnectionStatus> {
        self.inner.statuses.borrow().clone()
    }

    /// Receiver notified only when a status actually changes.
    pub fn subscribe_status(&self) -> watch::Receiver<BTreeMap<String, ConnectionStatus>> {
        self.inner.statuses.subscribe()
    }

    /// Stop polling and watchers, then dispose every connection. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(poller) = lock(&self.inner.poller).take() {
            poller.abort();
        }
        for (_, watcher) in lock(&self.inner.watchers).drain() {
            watcher.abort();
        }
        for (_, conn) in lock(&self.inner.connections).drain() {
            conn.dispose();
        }
        debug!("relay fleet disposed");
    }
}

impl FleetInner {
    fn record_state(&self, url: &str, state: ConnectionState) {
        self.statuses.send_if_modified(|m| {
            let Some(status) = m.get_mut(url) else {
                return false;
            };
            if status.state == state {
                return false;
            }
            status.state = state;
            if state.is_ready() {
                status.last_connected_at = Some(now());
            }
            true
        });
    }

    fn record_error(&self, url: &str, err: &ConnectionError) {
        self.statuses.send_if_modified(|m| {
            let Some(status) = m.get_mut(url) else {
                return false;
            };
            status.error_count += 1;
            status.last_error_at = Some(now());
            status.error_message = Some(err.to_string());
            true
        });
    }

    /// Reconcile every connection's live state into the status map.
    fn sync_statuses(&self) {
        let conns: Vec<(String, ConnectionState)> = lock(&self.connections)
            .iter()
            .map(|(url, c)| (url.clone(), c.state()))
            .collect();
        for (url, state) in conns {
            self.record_state(&url, state);
        }
    }
}

/// Feed one connection's notifications into the status map. Receivers are
/// created before the first connect so no early transition is missed.
async fn watch_connection(
    weak: Weak<FleetInner>,
    url: String,
    mut states: watch::Receiver<ConnectionState>,
    mut errors: broadcast::Receiver<ConnectionError>,
) {
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                let Some(inner) = weak.upgrade() else { break };
                inner.record_state(&url, state);
            }
            err = errors.recv() => match err {
                Ok(err) => {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.record_error(&url, &err);
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_store::MemoryRelayStore;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn spawn_relay() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(mut ws) = accept_async(stream).await {
                        while ws.next().await.is_some() {}
                    }
                });
            }
        });
        (format!("ws://{addr}"), handle)
    }

    async fn dead_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("ws://{}", listener.local_addr().unwrap())
    }

    fn config(default_relay: &str) -> FleetConfig {
        FleetConfig {
            default_relay: default_relay.to_string(),
            connection: ConnectionConfig {
                auto_reconnect: false,
                connect_timeout: Duration::from_secs(2),
                ..ConnectionConfig::default()
            },
            status_poll: Duration::from_millis(50),
        }
    }

    #[test]
    fn normalizes_relay_urls() {
        assert_eq!(normalize_url("relay.example.com/").unwrap(), "wss://relay.example.com");
        assert_eq!(normalize_url(" wss://relay.example.com// ").unwrap(), "wss://relay.example.com");
        assert_eq!(normalize_url("ws://127.0.0.1:7777").unwrap(), "ws://127.0.0.1:7777");
        assert!(normalize_url("").is_err());
        assert!(normalize_url("wss://").is_err());
        assert!(normalize_url("https://relay.example.com").is_err());
        assert!(normalize_url("not a url").is_err());
    }

    #[tokio::test]
    async fn empty_store_yields_only_default() {
        let default = dead_url().await;
        let store = Arc::new(MemoryRelayStore::default());
        let fleet = RelayFleet::new(config(&default), store.clone(), None);
        fleet.initialize().await.unwrap();
        assert_eq!(fleet.relay_urls(), vec![default.clone()]);
        assert_eq!(store.snapshot(), vec![default.clone()]);
        assert!(fleet.statuses().contains_key(&default));
        let records = fleet.relays();
        assert!(records[0].is_default && records[0].configured);
        fleet.dispose();
    }

    #[tokio::test]
    async fn default_inserted_first_when_missing() {
        let default = dead_url().await;
        let other = dead_url().await;
        let store = Arc::new(MemoryRelayStore::new(vec![other.clone(), format!("{other}/")]));
        let fleet = RelayFleet::new(config(&default), store, None);
        fleet.initialize().await.unwrap();
        assert_eq!(fleet.relay_urls(), vec![default, other]);
        fleet.dispose();
    }

    #[tokio::test]
    async fn default_relay_cannot_be_removed() {
        let default = dead_url().await;
        let store = Arc::new(MemoryRelayStore::default());
        let fleet = RelayFleet::new(config(&default), store.clone(), None);
        fleet.initialize().await.unwrap();
        let change = fleet.remove_relay(&default).await.unwrap();
        assert_eq!(change, RelayChange::DefaultProtected);
        assert!(!change.applied());
        assert_eq!(fleet.relay_urls(), vec![default.clone()]);
        assert_eq!(store.snapshot(), vec![default]);
        fleet.dispose();
    }

    #[tokio::test]
    async fn add_and_remove_persist() {
        let default = dead_url().await;
        let other = dead_url().await;
        let store = Arc::new(MemoryRelayStore::default());
        let fleet = RelayFleet::new(config(&default), store.clone(), None);
        fleet.initialize().await.unwrap();

        assert_eq!(
            fleet.add_relay(&format!("{other}/")).await.unwrap(),
            RelayChange::Added(other.clone())
        );
        assert_eq!(store.snapshot(), vec![default.clone(), other.clone()]);
        assert_eq!(
            fleet.add_relay(&other).await.unwrap(),
            RelayChange::AlreadyConfigured(other.clone())
        );
        assert!(matches!(
            fleet.add_relay("https://nope").await.unwrap(),
            RelayChange::Invalid(_)
        ));
        assert_eq!(
            fleet.remove_relay(&other).await.unwrap(),
            RelayChange::Removed(other.clone())
        );
        assert_eq!(store.snapshot(), vec![default.clone()]);
        assert!(!fleet.statuses().contains_key(&other));
        assert_eq!(
            fleet.remove_relay(&other).await.unwrap(),
            RelayChange::NotConfigured(other)
        );
        fleet.dispose();
    }

    #[tokio::test]
    async fn connected_set_excludes_removed_relays() {
        let (default, server) = spawn_relay().await;
        let alias = default.replace("127.0.0.1", "localhost");
        let store = Arc::new(MemoryRelayStore::default());
        let fleet = RelayFleet::new(config(&default), store, None);
        fleet.initialize().await.unwrap();
        assert_eq!(fleet.connected_relays(), vec![default.clone()]);

        fleet.add_relay(&alias).await.unwrap();
        assert_eq!(fleet.summary(), FleetSummary { connected: 2, total: 2 });

        fleet.remove_relay(&alias).await.unwrap();
        assert_eq!(fleet.connected_relays(), vec![default.clone()]);
        assert_eq!(fleet.summary().to_string(), "1 of 1 relays connected");

        let mut rx = fleet.subscribe_status();
        let statuses = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|m| m.get(&default).is_some_and(|s| s.state.is_ready())),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert!(statuses[&default].last_connected_at.is_some());
        fleet.dispose();
        server.abort();
    }

    #[tokio::test]
    async fn failures_are_counted_in_status() {
        let default = dead_url().await;
        let fleet = RelayFleet::new(config(&default), Arc::new(MemoryRelayStore::default()), None);
        let mut rx = fleet.subscribe_status();
        fleet.initialize().await.unwrap();
        let statuses = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|m| m.get(&default).is_some_and(|s| s.error_count >= 1)),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        let status = &statuses[&default];
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_error_at.is_some());
        assert!(status.error_message.is_some());
        assert_eq!(fleet.summary(), FleetSummary { connected: 0, total: 1 });
        fleet.dispose();
    }

    #[tokio::test]
    async fn retry_reconnects_dead_relays() {
        let addr_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = addr_listener.local_addr().unwrap();
        drop(addr_listener);
        let default = format!("ws://{addr}");
        let fleet = RelayFleet::new(config(&default), Arc::new(MemoryRelayStore::default()), None);
        fleet.initialize().await.unwrap();
        assert!(fleet.connected_relays().is_empty());

        let listener = TcpListener::bind(addr).await.unwrap();
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(mut ws) = accept_async(stream).await {
                        while ws.next().await.is_some() {}
                    }
                });
            }
        });
        assert_eq!(fleet.retry_disconnected_relays().await, 1);
        assert_eq!(fleet.connected_relays(), vec![default.clone()]);
        assert!(fleet.reconnect_relay(&default).await.unwrap());
        assert!(!fleet.reconnect_relay("wss://unknown.example").await.unwrap());
        fleet.dispose();
        server.abort();
    }

    #[tokio::test]
    async fn default_relay_is_normalized() {
        let default = dead_url().await;
        let raw = format!("{default}/");
        let store = Arc::new(MemoryRelayStore::new(vec![raw.clone()]));
        let fleet = RelayFleet::new(config(&raw), store.clone(), None);
        assert_eq!(fleet.default_relay(), default);
        fleet.initialize().await.unwrap();
        assert_eq!(fleet.relay_urls(), vec![default.clone()]);
        assert_eq!(store.snapshot(), vec![default.clone()]);
        assert!(fleet.relays()[0].is_default);
        assert_eq!(fleet.remove_relay(&raw).await.unwrap(), RelayChange::DefaultProtected);
        assert_eq!(
            fleet.remove_relay(&default).await.unwrap(),
            RelayChange::DefaultProtected
        );
        fleet.dispose();

        let again = RelayFleet::new(config(&raw), store.clone(), None);
        again.initialize().await.unwrap();
        assert_eq!(again.relay_urls(), vec![default.clone()]);
        assert_eq!(store.snapshot(), vec![default]);
        again.dispose();
    }

    #[tokio::test]
    async fn steady_relays_do_not_notify() {
        let default = dead_url().await;
        let fleet = RelayFleet::new(config(&default), Arc::new(MemoryRelayStore::default()), None);
        let mut rx = fleet.subscribe_status();
        fleet.initialize().await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|m| m.get(&default).is_some_and(|s| s.error_count >= 1)),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        rx.borrow_and_update();
        // Several poll periods with nothing changing.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!rx.has_changed().unwrap());
        fleet.dispose();
    }

    #[tokio::test]
    async fn sync_statuses_matches_live_connections() {
        let (default, server) = spawn_relay().await;
        let mut cfg = config(&default);
        cfg.status_poll = Duration::from_secs(3600);
        let fleet = RelayFleet::new(cfg, Arc::new(MemoryRelayStore::default()), None);
        fleet.initialize().await.unwrap();
        fleet.sync_statuses();
        let statuses = fleet.statuses();
        assert!(statuses[&default].state.is_ready());
        assert_eq!(fleet.connected_relays(), vec![default]);
        fleet.dispose();
        server.abort();
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let default = dead_url().await;
        let fleet = RelayFleet::new(config(&default), Arc::new(MemoryRelayStore::default()), None);
        fleet.initialize().await.unwrap();
        fleet.dispose();
        fleet.dispose();
        assert!(matches!(fleet.initialize().await, Err(Error::Disposed)));
        assert!(fleet.add_relay("wss://x.example").await.is_err());
    }
}
