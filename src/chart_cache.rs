/// chart_cache.rs – TTL cache of chart history plus live-tick fan-out.
///
/// Each (symbol, interval, days, session) key moves Absent → Fresh → Stale and
/// back to Absent when cleared. A fresh hit hands back the stored `Arc`
/// without I/O. Fetch failures yield an empty series, never an error.
///
/// The cache can also own one stream socket; its tick frames are turned into
/// flat bars and delivered to per-symbol subscribers.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::SimApi;
use crate::config::CacheConfig;
use crate::error::ClientError;
use crate::models::{OhlcvBar, StreamFrame};
use crate::stream::{StreamConnector, StreamControl, StreamEvent};

pub type TickCallback = Arc<dyn Fn(&OhlcvBar) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Absent,
    Fresh,
    Stale,
}

/// Sent whenever the cache's socket opens, closes or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatus {
    pub connected: bool,
}

/// `SYMBOL-interval-days-session`, with `no-session` when none is bound.
pub fn cache_key(symbol: &str, interval: &str, days: u32, session_id: Option<&str>) -> String {
    let session = session_id.filter(|s| !s.is_empty()).unwrap_or("no-session");
    format!("{symbol}-{interval}-{days}-{session}")
}

struct CacheEntry {
    symbol: String,
    data: Arc<Vec<OhlcvBar>>,
    fetched_at: Instant,
}

struct Pending {
    symbol: String,
    ticket: u64,
}

#[derive(Default)]
struct Store {
    entries: HashMap<String, CacheEntry>,
    /// Latest outstanding fetch per key; older responses are not stored.
    pending: HashMap<String, Pending>,
    next_ticket: u64,
}

impl Store {
    /// Remove entries and outstanding fetches for which `hit(key, symbol)`
    /// holds. Returns how many entries went.
    fn drop_matching(&mut self, hit: impl Fn(&str, &str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, e| !hit(k, &e.symbol));
        self.pending.retain(|k, p| !hit(k, &p.symbol));
        before - self.entries.len()
    }

    fn is_current(&self, key: &str, ticket: u64) -> bool {
        self.pending.get(key).is_some_and(|p| p.ticket == ticket)
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_symbol: HashMap<String, Vec<(u64, TickCallback)>>,
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Deliver one flat bar per subscribed symbol present in the frame.
/// Returns how many callbacks ran.
fn publish(registry: &Mutex<Registry>, frame: &StreamFrame) -> usize {
    let Some((tick, prices)) = frame.tick_prices() else {
        return 0;
    };
    let timestamp = frame
        .timestamp
        .clone()
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    // Collect under the lock, call outside it: a callback may subscribe.
    let deliveries: Vec<(TickCallback, OhlcvBar)> = {
        let reg = lock_registry(registry);
        prices
            .iter()
            .filter_map(|(symbol, price)| reg.by_symbol.get(symbol).map(|subs| (subs, *price)))
            .flat_map(|(subs, price)| {
                let bar = OhlcvBar::from_tick(price, tick, timestamp.clone());
                subs.iter().map(move |(_, cb)| (Arc::clone(cb), bar.clone()))
            })
            .collect()
    };
    for (cb, bar) in &deliveries {
        cb(bar);
    }
    deliveries.len()
}

/// Live-tick registration. Unsubscribes when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    symbol: String,
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn unsubscribe(self) {
        // Drop does the work
    }

    fn remove(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut reg = lock_registry(&registry);
        if let Some(subs) = reg.by_symbol.get_mut(&self.symbol) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                reg.by_symbol.remove(&self.symbol);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

// ---------------------------------------------------------------------------
// ChartDataCache
// ---------------------------------------------------------------------------

struct ActiveSocket {
    session_id: String,
    control: StreamControl,
    pump: JoinHandle<()>,
}

pub struct ChartDataCache {
    api: Arc<dyn SimApi>,
    connector: Arc<dyn StreamConnector>,
    ttl: Duration,
    max_entries: usize,
    store: Mutex<Store>,
    registry: SharedRegistry,
    socket: Mutex<Option<ActiveSocket>>,
    connected: Arc<AtomicBool>,
    /// Bumped per connect/disconnect; a pump only reports while it is current.
    socket_gen: Arc<AtomicU64>,
    status_tx: broadcast::Sender<StreamStatus>,
}

impl ChartDataCache {
    pub fn new(
        api: Arc<dyn SimApi>,
        connector: Arc<dyn StreamConnector>,
        config: &CacheConfig,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(32);
        Self {
            api,
            connector,
            ttl: config.ttl(),
            max_entries: config.max_entries.max(1),
            store: Mutex::new(Store::default()),
            registry: Arc::new(Mutex::new(Registry::default())),
            socket: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            socket_gen: Arc::new(AtomicU64::new(0)),
            status_tx,
        }
    }

    fn lock_store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_socket(&self) -> MutexGuard<'_, Option<ActiveSocket>> {
        self.socket.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Chart history
    // ------------------------------------------------------------------

    pub async fn get_chart_data(
        &self,
        symbol: &str,
        interval: &str,
        days: u32,
        session_id: Option<&str>,
    ) -> Arc<Vec<OhlcvBar>> {
        let key = cache_key(symbol, interval, days, session_id);

        let ticket = {
            let mut store = self.lock_store();
            if let Some(entry) = store.entries.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    debug!("Chart cache hit: {key}");
                    return Arc::clone(&entry.data);
                }
            }
            store.next_ticket += 1;
            let ticket = store.next_ticket;
            store.pending.insert(
                key.clone(),
                Pending {
                    symbol: symbol.to_string(),
                    ticket,
                },
            );
            ticket
        };

        debug!("Chart cache miss: {key}");
        let result = self.api.chart_data(symbol, interval, days, session_id).await;

        let mut store = self.lock_store();
        let current = store.is_current(&key, ticket);
        if current {
            store.pending.remove(&key);
        }
        let bars = match result {
            Ok(bars) => bars,
            Err(e) => {
                warn!("Chart data fetch failed for {key}: {e}");
                return Arc::new(Vec::new());
            }
        };

        let data = Arc::new(bars);
        if current {
            self.insert(&mut store, key, symbol, Arc::clone(&data));
        } else {
            debug!("Discarding superseded chart response for {key}");
        }
        data
    }

    fn insert(&self, store: &mut Store, key: String, symbol: &str, data: Arc<Vec<OhlcvBar>>) {
        if !store.entries.contains_key(&key) && store.entries.len() >= self.max_entries {
            let oldest = store
                .entries
                .iter()
                .min_by_key(|(_, e)| e.fetched_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!("Chart cache full; evicting {oldest}");
                store.entries.remove(&oldest);
            }
        }
        store.entries.insert(
            key,
            CacheEntry {
                symbol: symbol.to_string(),
                data,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn state(
        &self,
        symbol: &str,
        interval: &str,
        days: u32,
        session_id: Option<&str>,
    ) -> CacheState {
        let key = cache_key(symbol, interval, days, session_id);
        match self.lock_store().entries.get(&key) {
            None => CacheState::Absent,
            Some(e) if e.fetched_at.elapsed() < self.ttl => CacheState::Fresh,
            Some(_) => CacheState::Stale,
        }
    }

    pub fn len(&self) -> usize {
        self.lock_store().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetches started and not yet settled or superseded.
    pub fn pending_fetches(&self) -> usize {
        self.lock_store().pending.len()
    }

    /// Drop one key. An in-flight fetch for it will not be stored.
    pub fn clear_cache_for_symbol(
        &self,
        symbol: &str,
        interval: &str,
        days: u32,
        session_id: Option<&str>,
    ) {
        let key = cache_key(symbol, interval, days, session_id);
        self.lock_store().drop_matching(|k, _| k == key);
    }

    /// Drop every key for `symbol`, whatever its interval, days or session.
    pub fn invalidate_symbol(&self, symbol: &str) -> usize {
        let removed = self.lock_store().drop_matching(|_, s| s == symbol);
        if removed > 0 {
            debug!("Invalidated {removed} chart entries for {symbol}");
        }
        removed
    }

    pub fn clear_all(&self) {
        let mut store = self.lock_store();
        store.entries.clear();
        store.pending.clear();
    }

    /// Warm the cache for several symbols concurrently.
    pub async fn preload(&self, symbols: &[String], interval: &str, days: u32) {
        join_all(
            symbols
                .iter()
                .map(|s| self.get_chart_data(s, interval, days, None)),
        )
        .await;
        info!("Preloaded chart data for {} symbols", symbols.len());
    }

    // ------------------------------------------------------------------
    // Live ticks
    // ------------------------------------------------------------------

    pub fn subscribe<F>(&self, symbol: &str, callback: F) -> Subscription
    where
        F: Fn(&OhlcvBar) + Send + Sync + 'static,
    {
        let callback: TickCallback = Arc::new(callback);
        let mut reg = lock_registry(&self.registry);
        reg.next_id += 1;
        let id = reg.next_id;
        reg.by_symbol
            .entry(symbol.to_string())
            .or_default()
            .push((id, callback));
        Subscription {
            symbol: symbol.to_string(),
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        lock_registry(&self.registry)
            .by_symbol
            .get(symbol)
            .map_or(0, Vec::len)
    }

    pub fn has_subscribers(&self, symbol: &str) -> bool {
        lock_registry(&self.registry).by_symbol.contains_key(symbol)
    }

    /// Fan a parsed frame out to subscribers. Frames without both a tick and
    /// prices are ignored.
    pub fn publish_frame(&self, frame: &StreamFrame) -> usize {
        publish(&self.registry, frame)
    }

    // ------------------------------------------------------------------
    // Socket lifecycle
    // ------------------------------------------------------------------

    /// Open the session stream, closing any socket this cache already holds.
    pub fn connect(&self, session_id: &str) -> Result<(), ClientError> {
        self.close_socket();
        let handle = self.connector.session_stream(session_id)?;
        let (control, mut events) = handle.split();

        let my_gen = self.socket_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let socket_gen = Arc::clone(&self.socket_gen);
        let connected = Arc::clone(&self.connected);
        let status_tx = self.status_tx.clone();
        let registry = Arc::clone(&self.registry);

        let report = move |up: bool| {
            if socket_gen.load(Ordering::SeqCst) == my_gen {
                connected.store(up, Ordering::SeqCst);
                let _ = status_tx.send(StreamStatus { connected: up });
            }
        };

        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::Opened => report(true),
                    StreamEvent::Frame(text) => match StreamFrame::parse(&text) {
                        Some(frame) => {
                            publish(&registry, &frame);
                        }
                        None => debug!("Ignoring non-JSON chart frame"),
                    },
                    StreamEvent::Error(e) => {
                        warn!("Chart stream error: {e}");
                        report(false);
                    }
                    StreamEvent::Closed => break,
                }
            }
            report(false);
        });

        info!("Chart stream opening for session {session_id}");
        *self.lock_socket() = Some(ActiveSocket {
            session_id: session_id.to_string(),
            control,
            pump,
        });
        Ok(())
    }

    pub fn disconnect(&self) {
        if self.close_socket() {
            let _ = self.status_tx.send(StreamStatus { connected: false });
        }
    }

    /// Returns true when a socket was open.
    fn close_socket(&self) -> bool {
        self.socket_gen.fetch_add(1, Ordering::SeqCst);
        let prev = self.lock_socket().take();
        self.connected.store(false, Ordering::SeqCst);
        match prev {
            Some(socket) => {
                debug!("Closing chart stream for session {}", socket.session_id);
                socket.pump.abort();
                socket.control.close();
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connected_session(&self) -> Option<String> {
        self.lock_socket().as_ref().map(|s| s.session_id.clone())
    }

    pub fn status_changes(&self) -> broadcast::Receiver<StreamStatus> {
        self.status_tx.subscribe()
    }
}

impl Drop for ChartDataCache {
    fn drop(&mut self) {
        self.close_socket();
    }
}
