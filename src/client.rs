//! Protocol client facade: publish, tiered queries, deduplicated subscriptions.
//!
//! Single-filter queries resolve cache first, then the optional gateway, then
//! live relays. Whatever the gateway or relays return is written back to the
//! cache on a detached task; those writes never fail the read that caused them.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use futures_util::future::join_all;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::cache::EventCache;
use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::event::{Event, Signer, UnsignedEvent};
use crate::filter::{subscription_id, Filter};
use crate::fleet::{normalize_url, RelayFleet};
use crate::gateway::GatewayClient;
use crate::message::{ClientMessage, RelayMessage};

const SUBSCRIPTION_CAPACITY: usize = 1024;
/// Event ids remembered per subscription for cross-relay dedupe.
const SEEN_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on a live relay query or count.
    pub query_timeout: Duration,
    /// Bound on a single gateway call.
    pub gateway_timeout: Duration,
    /// How long `broadcast` waits for `OK` frames.
    pub ack_window: Duration,
    /// Drop relay and gateway events whose id or signature does not check out.
    pub verify_signatures: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(10),
            gateway_timeout: Duration::from_secs(5),
            ack_window: Duration::from_secs(3),
            verify_signatures: true,
        }
    }
}

/// Where a count came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountSource {
    /// Reported by a relay via `COUNT`.
    Relay,
    /// Derived by fetching and counting events locally.
    ClientSide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountResult {
    pub count: u64,
    pub approximate: bool,
    pub source: CountSource,
}

/// Per-relay result of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The relay answered `OK true`.
    Acknowledged,
    /// The relay answered `OK false` with this reason.
    Rejected(String),
    /// Sent, but no `OK` arrived within the acknowledgement window.
    Unacknowledged,
    NotSent(String),
}

impl RelayOutcome {
    pub fn was_sent(&self) -> bool {
        !matches!(self, RelayOutcome::NotSent(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastResult {
    pub event_id: String,
    pub outcomes: BTreeMap<String, RelayOutcome>,
}

impl BroadcastResult {
    /// Every asked relay received the frame. Says nothing about acceptance.
    pub fn all_sent(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.values().all(RelayOutcome::was_sent)
    }

    /// Relays that attested acceptance with `OK true`.
    pub fn acknowledged_by(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| **o == RelayOutcome::Acknowledged)
            .map(|(url, _)| url.as_str())
            .collect()
    }
}

/// Listener handle on a shared subscription channel.
///
/// Handles do not keep the channel open: once the subscription is closed,
/// `recv` returns `None`.
pub struct Subscription {
    id: String,
    channel: Weak<broadcast::Sender<Event>>,
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Deterministic id derived from the filter set.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event, skipping over any lag. `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(ev) => return Some(ev),
                Err(RecvError::Lagged(n)) => {
                    warn!(subscription = %self.id, skipped = n, "subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Another independent listener on the same channel.
    pub fn listener(&self) -> Option<broadcast::Receiver<Event>> {
        self.channel.upgrade().map(|tx| tx.subscribe())
    }

    /// Whether both handles listen on the same underlying channel.
    pub fn same_channel(&self, other: &Subscription) -> bool {
        Weak::ptr_eq(&self.channel, &other.channel)
    }

    pub fn is_closed(&self) -> bool {
        self.channel.strong_count() == 0
    }
}

struct SubscriptionEntry {
    channel: Arc<broadcast::Sender<Event>>,
    connections: Vec<Connection>,
    pumps: Vec<JoinHandle<()>>,
}

impl SubscriptionEntry {
    fn is_dead(&self) -> bool {
        !self.pumps.is_empty() && self.pumps.iter().all(|p| p.is_finished())
    }
}

/// State shared by the per-relay pumps of one subscription.
struct SubscriptionShared {
    id: String,
    filters: Vec<Filter>,
    channel: Arc<broadcast::Sender<Event>>,
    seen: Mutex<RecentIds>,
    cache: EventCache,
    verify: bool,
}

/// Insertion-ordered id set that forgets its oldest entries past `cap`.
struct RecentIds {
    cap: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentIds {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// `false` when `id` is already remembered.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Signature gate for events arriving from relays or the gateway.
fn admit(verify: bool, event: &Event) -> bool {
    if !verify {
        return true;
    }
    match event.verify() {
        Ok(()) => true,
        Err(e) => {
            debug!(event = %event.id, error = %e, "dropping event that failed verification");
            false
        }
    }
}

/// Write `events` to the cache on a detached task.
///
/// Failures are logged and never reach the caller. The returned handle may be
/// dropped; awaiting it only tells you the write attempt finished.
pub fn cache_in_background(cache: &EventCache, events: Vec<Event>) -> JoinHandle<()> {
    let cache = cache.clone();
    tokio::spawn(async move {
        let result = match events.as_slice() {
            [] => return,
            [single] => cache.upsert(single).await.map(usize::from),
            many => cache.upsert_batch(many).await,
        };
        if let Err(e) = result {
            warn!(error = %e, "background cache write failed");
        }
    })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn random_sub_id(prefix: &str) -> String {
    format!("{prefix}-{:016x}", rand::random::<u64>())
}

/// Merge per-relay results: unique by id, newest first.
fn merge_events(batches: Vec<Vec<Event>>, limit: Option<usize>) -> Vec<Event> {
    let mut seen = HashSet::new();
    let mut merged: Vec<Event> = batches
        .into_iter()
        .flatten()
        .filter(|e| seen.insert(e.id.clone()))
        .collect();
    merged.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    if let Some(limit) = limit {
        merged.truncate(limit);
    }
    merged
}

fn notice_rejects_count(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("count")
        && ["unsupported", "not supported", "unknown", "unrecognized", "invalid"]
            .iter()
            .any(|w| m.contains(w))
}

enum CountReply {
    Count { count: u64, approximate: bool },
    Unsupported,
    NoAnswer,
}

/// Entry point for publishing, querying and subscribing. Clones share state.
#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    fleet: RelayFleet,
    cache: EventCache,
    gateway: Option<Arc<dyn GatewayClient>>,
    signer: Option<Arc<dyn Signer>>,
    config: ClientConfig,
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
    disposed: AtomicBool,
}

impl ProtocolClient {
    pub fn new(
        fleet: RelayFleet,
        cache: EventCache,
        gateway: Option<Arc<dyn GatewayClient>>,
        signer: Option<Arc<dyn Signer>>,
        config: ClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                fleet,
                cache,
                gateway,
                signer,
                config,
                subscriptions: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn fleet(&self) -> &RelayFleet {
        &self.inner.fleet
    }

    pub fn cache(&self) -> &EventCache {
        &self.inner.cache
    }

    /// Load relays and connect.
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_live()?;
        self.inner.fleet.initialize().await
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    /// Resolve `filters` to events.
    ///
    /// Tier failures fall through to the next tier; only an exhausted relay
    /// tier yields an empty result.
    pub async fn query_events(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        self.ensure_live()?;
        if let [filter] = filters {
            match self.inner.cache.query_by_filter(filter).await {
                Ok(events) if !events.is_empty() => {
                    debug!(count = events.len(), "query served from cache");
                    return Ok(events);
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "cache read failed, treating as miss"),
            }
            if let Some(events) = self.gateway_query(filter).await {
                return Ok(events);
            }
        }
        let events = self.relay_query(filters).await;
        let _ = cache_in_background(&self.inner.cache, events.clone());
        Ok(events)
    }

    async fn gateway_query(&self, filter: &Filter) -> Option<Vec<Event>> {
        let gateway = self.inner.gateway.as_ref()?;
        match timeout(self.inner.config.gateway_timeout, gateway.query(filter)).await {
            Ok(Ok(resp)) if resp.has_events => {
                // Gateways may ignore filter fields they do not support.
                let verify = self.inner.config.verify_signatures;
                let mut events: Vec<Event> = resp
                    .events
                    .into_iter()
                    .filter(|e| filter.matches(e) && admit(verify, e))
                    .collect();
                if let Some(limit) = filter.limit {
                    events.truncate(limit);
                }
                if events.is_empty() {
                    debug!("no gateway event matched the filter");
                    return None;
                }
                debug!(count = events.len(), "query served from gateway");
                let _ = cache_in_background(&self.inner.cache, events.clone());
                Some(events)
            }
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!(error = %e, "gateway query failed, falling back to relays");
                None
            }
            Err(_) => {
                warn!("gateway query timed out, falling back to relays");
                None
            }
        }
    }

    /// One-shot REQ against every ready relay; results merged and bounded by
    /// the query timeout.
    async fn relay_query(&self, filters: &[Filter]) -> Vec<Event> {
        let conns = self.inner.fleet.ready_connections();
        if conns.is_empty() {
            warn!(summary = %self.inner.fleet.summary(), "no relays available for query");
            return vec![];
        }
        let sub_id = random_sub_id("q");
        let wait = self.inner.config.query_timeout;
        let verify = self.inner.config.verify_signatures;
        let batches = join_all(
            conns
                .iter()
                .map(|c| collect_from(c, &sub_id, filters, wait, verify)),
        )
        .await;
        let limit = match filters {
            [single] => single.limit,
            _ => None,
        };
        merge_events(batches, limit)
    }

    /// Open or join the subscription for `filters`.
    ///
    /// Filter sets that canonicalize identically share one channel and one
    /// wire-level subscription per relay.
    pub fn subscribe(&self, filters: Vec<Filter>) -> Result<Subscription> {
        self.ensure_live()?;
        let id = subscription_id(&filters);
        let mut subs = lock(&self.inner.subscriptions);
        if let Some(entry) = subs.get(&id) {
            if !entry.is_dead() {
                return Ok(Subscription {
                    id,
                    channel: Arc::downgrade(&entry.channel),
                    receiver: entry.channel.subscribe(),
                });
            }
        }
        if let Some(stale) = subs.remove(&id) {
            stale.pumps.iter().for_each(JoinHandle::abort);
        }

        let (tx, rx) = broadcast::channel(SUBSCRIPTION_CAPACITY);
        let channel = Arc::new(tx);
        let shared = Arc::new(SubscriptionShared {
            id: id.clone(),
            filters: filters.clone(),
            channel: channel.clone(),
            seen: Mutex::new(RecentIds::new(SEEN_CAPACITY)),
            cache: self.inner.cache.clone(),
            verify: self.inner.config.verify_signatures,
        });
        let connections = self.inner.fleet.connections();
        let req = ClientMessage::Req {
            subscription_id: id.clone(),
            filters,
        };
        let mut pumps = vec![];
        for conn in &connections {
            let messages = conn.subscribe_messages();
            let states = conn.subscribe_state();
            let ready = conn.send(&req);
            pumps.push(tokio::spawn(pump(
                conn.clone(),
                shared.clone(),
                messages,
                states,
                ready,
            )));
        }
        info!(subscription = %id, relays = connections.len(), "subscription opened");
        subs.insert(
            id.clone(),
            SubscriptionEntry {
                channel: channel.clone(),
                connections,
                pumps,
            },
        );
        Ok(Subscription {
            id,
            channel: Arc::downgrade(&channel),
            receiver: rx,
        })
    }

    /// Close a subscription on every relay and drop its channel. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: &str) {
        let entry = lock(&self.inner.subscriptions).remove(id);
        if let Some(entry) = entry {
            close_entry(id, entry);
        }
    }

    pub fn close_all_subscriptions(&self) {
        let entries: Vec<(String, SubscriptionEntry)> =
            lock(&self.inner.subscriptions).drain().collect();
        for (id, entry) in entries {
            close_entry(&id, entry);
        }
    }

    /// Number of open subscriptions.
    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }

    /// Send `event` to `targets` (normalized URLs) or to every ready relay,
    /// then collect `OK` frames for the acknowledgement window.
    pub async fn broadcast(
        &self,
        event: &Event,
        targets: Option<&[String]>,
    ) -> Result<BroadcastResult> {
        self.ensure_live()?;
        let mut outcomes = BTreeMap::new();
        let conns: Vec<Connection> = match targets {
            None => self.inner.fleet.ready_connections(),
            Some(urls) => {
                let mut conns = vec![];
                for raw in urls {
                    match normalize_url(raw) {
                        Ok(url) => match self.inner.fleet.connection(&url) {
                            Some(conn) => conns.push(conn),
                            None => {
                                outcomes.insert(url, RelayOutcome::NotSent("not configured".into()));
                            }
                        },
                        Err(_) => {
                            outcomes.insert(
                                raw.clone(),
                                RelayOutcome::NotSent("invalid relay url".into()),
                            );
                        }
                    }
                }
                conns
            }
        };

        let frame = ClientMessage::Event(event.clone());
        let mut pending = vec![];
        for conn in conns {
            let rx = conn.subscribe_messages();
            if conn.send(&frame) {
                pending.push((conn.url().to_string(), rx));
            } else {
                outcomes.insert(
                    conn.url().to_string(),
                    RelayOutcome::NotSent("not connected".into()),
                );
            }
        }
        let window = self.inner.config.ack_window;
        let acks = join_all(
            pending
                .into_iter()
                .map(|(url, rx)| async move { (url, await_ack(rx, &event.id, window).await) }),
        )
        .await;
        outcomes.extend(acks);
        let result = BroadcastResult {
            event_id: event.id.clone(),
            outcomes,
        };
        info!(
            event = %event.id,
            relays = result.outcomes.len(),
            acknowledged = result.acknowledged_by().len(),
            "event broadcast"
        );
        Ok(result)
    }

    /// Sign, cache and broadcast a new event.
    pub async fn publish(&self, unsigned: UnsignedEvent) -> Result<(Event, BroadcastResult)> {
        self.ensure_live()?;
        let signer = self.inner.signer.as_ref().ok_or(Error::NoSigner)?;
        let event = signer.sign(unsigned)?;
        if let Err(e) = self.inner.cache.upsert(&event).await {
            warn!(event = %event.id, error = %e, "failed to cache published event");
        }
        let result = self.broadcast(&event, None).await?;
        Ok((event, result))
    }

    /// Count events, preferring relay `COUNT` and falling back to fetching and
    /// counting locally when no relay answers with a count.
    pub async fn count_events(&self, filters: &[Filter]) -> Result<CountResult> {
        self.ensure_live()?;
        let conns = self.inner.fleet.ready_connections();
        let sub_id = random_sub_id("count");
        let wait = self.inner.config.query_timeout;
        let replies = join_all(conns.iter().map(|c| count_from(c, &sub_id, filters, wait))).await;
        let best = replies
            .into_iter()
            .filter_map(|r| match r {
                CountReply::Count { count, approximate } => Some((count, approximate)),
                _ => None,
            })
            .max_by_key(|(count, _)| *count);
        if let Some((count, approximate)) = best {
            return Ok(CountResult {
                count,
                approximate,
                source: CountSource::Relay,
            });
        }
        debug!("no relay count available, counting client-side");
        let events = self.query_events(filters).await?;
        Ok(CountResult {
            count: events.len() as u64,
            approximate: true,
            source: CountSource::ClientSide,
        })
    }

    /// Event by id: cache, then gateway, then relays.
    pub async fn fetch_event(&self, id: &str) -> Result<Option<Event>> {
        self.ensure_live()?;
        match self.inner.cache.get_by_id(id).await {
            Ok(Some(ev)) => return Ok(Some(ev)),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "cache read failed, treating as miss"),
        }
        if let Some(gateway) = &self.inner.gateway {
            let verify = self.inner.config.verify_signatures;
            match timeout(self.inner.config.gateway_timeout, gateway.get_event(id)).await {
                Ok(Ok(Some(ev))) if ev.id == id && admit(verify, &ev) => {
                    let _ = cache_in_background(&self.inner.cache, vec![ev.clone()]);
                    return Ok(Some(ev));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "gateway lookup failed"),
                Err(_) => warn!("gateway lookup timed out"),
            }
        }
        let found = self
            .relay_query(&[Filter::new().ids([id]).limit(1)])
            .await
            .into_iter()
            .find(|e| e.id == id);
        if let Some(ev) = &found {
            let _ = cache_in_background(&self.inner.cache, vec![ev.clone()]);
        }
        Ok(found)
    }

    /// Latest kind-0 metadata for `author`: cache, then gateway, then relays.
    pub async fn fetch_profile(&self, author: &str) -> Result<Option<Event>> {
        self.ensure_live()?;
        match self.inner.cache.latest_replaceable(author, 0, None).await {
            Ok(Some(ev)) => return Ok(Some(ev)),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "cache read failed, treating as miss"),
        }
        if let Some(gateway) = &self.inner.gateway {
            let verify = self.inner.config.verify_signatures;
            match timeout(self.inner.config.gateway_timeout, gateway.get_profile(author)).await {
                Ok(Ok(Some(ev))) if ev.pubkey == author && ev.kind == 0 && admit(verify, &ev) => {
                    let _ = cache_in_background(&self.inner.cache, vec![ev.clone()]);
                    return Ok(Some(ev));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "gateway profile lookup failed"),
                Err(_) => warn!("gateway profile lookup timed out"),
            }
        }
        let found = self
            .relay_query(&[Filter::new().authors([author]).kinds([0]).limit(1)])
            .await
            .into_iter()
            .max_by_key(|e| e.created_at);
        if let Some(ev) = &found {
            let _ = cache_in_background(&self.inner.cache, vec![ev.clone()]);
        }
        Ok(found)
    }

    /// Close subscriptions and dispose the fleet. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_all_subscriptions();
        self.inner.fleet.dispose();
        info!("protocol client disposed");
    }
}

fn close_entry(id: &str, entry: SubscriptionEntry) {
    for pump in &entry.pumps {
        pump.abort();
    }
    let close = ClientMessage::Close {
        subscription_id: id.to_string(),
    };
    for conn in &entry.connections {
        conn.send(&close);
    }
    debug!(subscription = %id, "subscription closed");
}

/// Forward one relay's events for a subscription into the shared channel,
/// re-sending the REQ whenever the relay comes back.
async fn pump(
    conn: Connection,
    shared: Arc<SubscriptionShared>,
    mut messages: broadcast::Receiver<RelayMessage>,
    mut states: watch::Receiver<ConnectionState>,
    mut was_ready: bool,
) {
    loop {
        tokio::select! {
            msg = messages.recv() => match msg {
                Ok(RelayMessage::Event { subscription_id, event }) if subscription_id == shared.id => {
                    if !admit(shared.verify, &event) || !lock(&shared.seen).insert(&event.id) {
                        continue;
                    }
                    let _ = cache_in_background(&shared.cache, vec![event.clone()]);
                    let _ = shared.channel.send(event);
                }
                Ok(RelayMessage::Closed { subscription_id, message }) if subscription_id == shared.id => {
                    warn!(relay = %conn.url(), subscription = %shared.id, reason = %message, "relay closed subscription");
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!(relay = %conn.url(), skipped = n, "subscription pump lagged");
                }
                Err(RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let ready = states.borrow_and_update().is_ready();
                if ready && !was_ready {
                    debug!(relay = %conn.url(), subscription = %shared.id, "re-sending subscription");
                    conn.send(&ClientMessage::Req {
                        subscription_id: shared.id.clone(),
                        filters: shared.filters.clone(),
                    });
                }
                was_ready = ready;
            },
        }
    }
}

/// Collect stored events for `sub_id` until EOSE, CLOSED or the deadline.
async fn collect_from(
    conn: &Connection,
    sub_id: &str,
    filters: &[Filter],
    wait: Duration,
    verify: bool,
) -> Vec<Event> {
    let mut rx = conn.subscribe_messages();
    let req = ClientMessage::Req {
        subscription_id: sub_id.to_string(),
        filters: filters.to_vec(),
    };
    if !conn.send(&req) {
        return vec![];
    }
    let mut events = vec![];
    let finished = timeout(wait, async {
        loop {
            match rx.recv().await {
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                }) if subscription_id == sub_id => {
                    if admit(verify, &event) {
                        events.push(event);
                    }
                }
                Ok(RelayMessage::EndOfStoredEvents { subscription_id })
                | Ok(RelayMessage::Closed {
                    subscription_id, ..
                }) if subscription_id == sub_id => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;
    if finished.is_err() {
        debug!(relay = %conn.url(), "relay query timed out");
    }
    conn.send(&ClientMessage::Close {
        subscription_id: sub_id.to_string(),
    });
    events
}

async fn count_from(
    conn: &Connection,
    sub_id: &str,
    filters: &[Filter],
    wait: Duration,
) -> CountReply {
    let mut rx = conn.subscribe_messages();
    let req = ClientMessage::Count {
        subscription_id: sub_id.to_string(),
        filters: filters.to_vec(),
    };
    if !conn.send(&req) {
        return CountReply::NoAnswer;
    }
    let reply = timeout(wait, async {
        loop {
            match rx.recv().await {
                Ok(RelayMessage::Count {
                    subscription_id,
                    count,
                    approximate,
                }) if subscription_id == sub_id => {
                    return CountReply::Count { count, approximate };
                }
                Ok(RelayMessage::Closed {
                    subscription_id, ..
                }) if subscription_id == sub_id => return CountReply::Unsupported,
                Ok(RelayMessage::Notice { message }) if notice_rejects_count(&message) => {
                    return CountReply::Unsupported;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return CountReply::NoAnswer,
            }
        }
    })
    .await;
    reply.unwrap_or(CountReply::NoAnswer)
}

async fn await_ack(
    mut rx: broadcast::Receiver<RelayMessage>,
    event_id: &str,
    window: Duration,
) -> RelayOutcome {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(RelayMessage::Ok {
                    event_id: id,
                    accepted,
                    message,
                }) if id == event_id => {
                    return if accepted {
                        RelayOutcome::Acknowledged
                    } else {
                        RelayOutcome::Rejected(message)
                    };
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return RelayOutcome::Unacknowledged,
            }
        }
    };
    timeout(window, wait)
        .await
        .unwrap_or(RelayOutcome::Unacknowledged)
}
