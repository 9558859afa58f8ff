/// session.rs – Live session sync: stream pump, refreshes, trades and
/// optimistic exit-condition edits.
///
/// The controller owns the session's shared state and is the only writer.
/// Frames from one socket are applied in order by a single pump task; REST
/// refreshes run on their own and are dropped if a newer request for the same
/// key started after them.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::SimApi;
use crate::chart_cache::ChartDataCache;
use crate::config::Settings;
use crate::debounce::Debouncer;
use crate::error::ClientError;
use crate::models::{
    Action, ActivationResult, ConnectionPhase, ExitConditionsRequest, OrderType,
    PortfolioSnapshot, SessionState, StreamFrame, TradeReceipt, TradeRequest, TradeValidation,
    ValidationRequest,
};
use crate::positions::{check_exit_condition, ExitField};
use crate::stream::{StreamConnector, StreamControl, StreamEvent};

pub type SharedSession = Arc<RwLock<SessionState>>;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub session_id: String,
    pub user_id: String,
    pub symbol: String,
    pub validation_debounce: Duration,
}

impl SessionParams {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            session_id: settings.session.session_id.clone(),
            user_id: settings.session.user_id.clone(),
            symbol: settings.session.symbol.clone(),
            validation_debounce: settings.session.validation_debounce(),
        }
    }
}

/// The order form. `price: None` means "use the latest quote".
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDraft {
    pub symbol: String,
    pub action: Action,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl OrderDraft {
    pub fn market(symbol: &str, action: Action, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            action,
            quantity,
            order_type: OrderType::Market,
            price: None,
            stop_loss: None,
            take_profit: None,
        }
    }
}

/// What applying one frame changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameEffect {
    pub tick_advanced: bool,
    pub portfolio_replaced: bool,
    pub ended: bool,
}

// ---------------------------------------------------------------------------
// Request tickets
// ---------------------------------------------------------------------------

/// Last-write-wins by request key: only the most recently issued ticket for
/// a key may apply its response.
#[derive(Debug, Default)]
struct RequestTickets {
    next: u64,
    latest: HashMap<String, u64>,
}

impl RequestTickets {
    fn issue(&mut self, key: &str) -> u64 {
        self.next += 1;
        self.latest.insert(key.to_string(), self.next);
        self.next
    }

    fn is_current(&self, key: &str, ticket: u64) -> bool {
        self.latest.get(key) == Some(&ticket)
    }
}

struct ActiveStream {
    control: StreamControl,
    pump: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// SessionSyncController
// ---------------------------------------------------------------------------

pub struct SessionSyncController {
    api: Arc<dyn SimApi>,
    cache: Arc<ChartDataCache>,
    connector: Arc<dyn StreamConnector>,
    params: SessionParams,
    state: SharedSession,
    tickets: Mutex<RequestTickets>,
    stream: Mutex<Option<ActiveStream>>,
    stream_gen: AtomicU64,
    draft: Mutex<Option<OrderDraft>>,
    validator: Debouncer,
}

impl SessionSyncController {
    pub fn new(
        api: Arc<dyn SimApi>,
        cache: Arc<ChartDataCache>,
        connector: Arc<dyn StreamConnector>,
        params: SessionParams,
    ) -> Arc<Self> {
        let state = SessionState {
            session_id: params.session_id.clone(),
            user_id: params.user_id.clone(),
            symbol: params.symbol.clone(),
            started_at: Some(Utc::now()),
            ..SessionState::default()
        };
        Arc::new(Self {
            api,
            cache,
            connector,
            params,
            state: Arc::new(RwLock::new(state)),
            tickets: Mutex::new(RequestTickets::default()),
            stream: Mutex::new(None),
            stream_gen: AtomicU64::new(0),
            draft: Mutex::new(None),
            validator: Debouncer::new(),
        })
    }

    pub fn state(&self) -> SharedSession {
        Arc::clone(&self.state)
    }

    pub fn snapshot(&self) -> SessionState {
        self.read_state().clone()
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn cache(&self) -> &Arc<ChartDataCache> {
        &self.cache
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.read_state().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase().is_connected()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tickets(&self) -> MutexGuard<'_, RequestTickets> {
        self.tickets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stream(&self) -> MutexGuard<'_, Option<ActiveStream>> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_draft(&self) -> MutexGuard<'_, Option<OrderDraft>> {
        self.draft.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log(&self, msg: impl Into<String>) {
        let msg = msg.into();
        info!("{msg}");
        self.write_state().add_log(msg);
    }

    // ------------------------------------------------------------------
    // Stream lifecycle
    // ------------------------------------------------------------------

    /// Open the session stream, replacing any socket already held.
    pub fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.read_state().ended {
            return Err(ClientError::WebSocket("session has ended".into()));
        }
        self.close_stream();

        let handle = self.connector.session_stream(&self.params.session_id)?;
        let (control, events) = handle.split();
        let my_gen = self.stream_gen.fetch_add(1, Ordering::SeqCst) + 1;

        self.write_state().phase = ConnectionPhase::Connecting;
        let pump = tokio::spawn(pump(Arc::downgrade(self), my_gen, events));
        *self.lock_stream() = Some(ActiveStream { control, pump });
        debug!("Session stream connecting for {}", self.params.session_id);
        Ok(())
    }

    /// Reconnect if the stream is down. A failed reopen is logged; the caller
    /// carries on.
    pub fn ensure_connected(self: &Arc<Self>) {
        let (phase, ended) = {
            let s = self.read_state();
            (s.phase, s.ended)
        };
        if ended || phase != ConnectionPhase::Disconnected {
            return;
        }
        self.log("Stream down; reconnecting");
        if let Err(e) = self.connect() {
            warn!("Reconnect failed: {e}");
        }
    }

    fn close_stream(&self) {
        self.stream_gen.fetch_add(1, Ordering::SeqCst);
        if let Some(active) = self.lock_stream().take() {
            active.pump.abort();
            active.control.close();
        }
    }

    fn is_current_stream(&self, gen: u64) -> bool {
        self.stream_gen.load(Ordering::SeqCst) == gen
    }

    fn mark_disconnected(&self, reason: &str) {
        let mut s = self.write_state();
        if s.phase != ConnectionPhase::Disconnected {
            s.phase = ConnectionPhase::Disconnected;
            s.add_log(format!("Stream disconnected: {reason}"));
            info!("Stream disconnected: {reason}");
        }
    }

    /// Cancel pending validation and close the socket.
    pub fn shutdown(&self) {
        self.validator.cancel();
        self.close_stream();
        self.write_state().phase = ConnectionPhase::Disconnected;
        info!("Session {} shut down", self.params.session_id);
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    /// Apply one frame to the session state, in receipt order.
    pub fn apply_frame(&self, frame: &StreamFrame) -> FrameEffect {
        let mut effect = FrameEffect::default();

        if let Some(err) = &frame.error {
            warn!("Stream error frame: {err}");
            return effect;
        }

        let active_symbol = {
            let mut s = self.write_state();
            // Any frame means the socket is live
            if s.phase == ConnectionPhase::Connecting {
                s.phase = ConnectionPhase::Streaming;
            }

            if frame.is_session_end() {
                s.ended = true;
                s.phase = ConnectionPhase::Disconnected;
                s.add_log("Session ended");
                effect.ended = true;
                return effect;
            }

            if let Some(tick) = frame.effective_tick() {
                if tick > s.current_tick {
                    s.current_tick = tick;
                    effect.tick_advanced = true;
                }
            }

            if let Some(price) = frame.prices.as_ref().and_then(|p| p.get(&s.symbol)) {
                if *price > 0.0 {
                    let mut quote = s.quote.clone().unwrap_or_default();
                    quote.last_price = *price;
                    s.quote = Some(quote);
                }
            }

            if let Some(snapshot) = &frame.portfolio {
                apply_portfolio(&mut s, snapshot.clone());
                effect.portfolio_replaced = true;
            } else if let Some(cash) = frame.cash {
                s.cash = cash;
            }
            s.symbol.clone()
        };

        if effect.tick_advanced {
            // Bars for the active symbol changed even inside the TTL window
            self.cache.invalidate_symbol(&active_symbol);
        }
        self.cache.publish_frame(frame);
        effect
    }

    // ------------------------------------------------------------------
    // Background refreshes (errors logged, prior data kept)
    // ------------------------------------------------------------------

    pub async fn refresh_after_tick(&self) {
        tokio::join!(
            self.refresh_quote(),
            self.refresh_ohlc(),
            self.refresh_orders()
        );
    }

    /// Everything the dashboard shows for the active symbol.
    pub async fn refresh_all(&self) {
        tokio::join!(
            self.refresh_portfolio(),
            self.refresh_quote(),
            self.refresh_ohlc(),
            self.refresh_indicators(),
            self.refresh_orders()
        );
    }

    fn active_symbol(&self) -> String {
        self.read_state().symbol.clone()
    }

    pub async fn refresh_portfolio(&self) -> bool {
        let key = "portfolio";
        let ticket = self.lock_tickets().issue(key);
        let result = self
            .api
            .portfolio(&self.params.session_id, &self.params.user_id)
            .await;
        if !self.lock_tickets().is_current(key, ticket) {
            debug!("Dropping superseded {key} response");
            return false;
        }
        match result {
            Ok(snapshot) => {
                apply_portfolio(&mut self.write_state(), snapshot);
                true
            }
            Err(e) => {
                warn!("Portfolio refresh failed: {e}");
                false
            }
        }
    }

    pub async fn refresh_quote(&self) {
        let symbol = self.active_symbol();
        let key = format!("quote:{symbol}");
        let ticket = self.lock_tickets().issue(&key);
        let result = self.api.quote(&self.params.session_id, &symbol).await;
        if !self.lock_tickets().is_current(&key, ticket) {
            return;
        }
        match result {
            Ok(quote) => {
                let mut s = self.write_state();
                if s.symbol == symbol {
                    s.quote = Some(quote);
                }
            }
            Err(e) => warn!("Quote refresh failed for {symbol}: {e}"),
        }
    }

    pub async fn refresh_ohlc(&self) {
        let symbol = self.active_symbol();
        let key = format!("ohlc:{symbol}");
        let ticket = self.lock_tickets().issue(&key);
        let result = self.api.ohlc(&self.params.session_id, &symbol).await;
        if !self.lock_tickets().is_current(&key, ticket) {
            return;
        }
        match result {
            Ok(bar) => {
                let mut s = self.write_state();
                if s.symbol == symbol {
                    s.ohlc = Some(bar);
                }
            }
            Err(e) => warn!("OHLC refresh failed for {symbol}: {e}"),
        }
    }

    pub async fn refresh_indicators(&self) {
        let symbol = self.active_symbol();
        let key = format!("indicators:{symbol}");
        let ticket = self.lock_tickets().issue(&key);
        let result = self.api.fundamentals(&self.params.session_id, &symbol).await;
        if !self.lock_tickets().is_current(&key, ticket) {
            return;
        }
        match result {
            Ok(ind) => {
                let mut s = self.write_state();
                if s.symbol == symbol {
                    s.indicators = Some(ind);
                }
            }
            Err(e) => warn!("Indicator refresh failed for {symbol}: {e}"),
        }
    }

    pub async fn refresh_orders(&self) {
        let key = "orders";
        let ticket = self.lock_tickets().issue(key);
        let result = self
            .api
            .orders(&self.params.session_id, &self.params.user_id, None)
            .await;
        if !self.lock_tickets().is_current(key, ticket) {
            return;
        }
        match result {
            Ok(orders) => self.write_state().orders = orders,
            Err(e) => warn!("Order refresh failed: {e}"),
        }
    }

    /// Switch the active symbol and reload its market data.
    pub async fn set_symbol(self: &Arc<Self>, symbol: &str) {
        let symbol = symbol.trim().to_uppercase();
        {
            let mut s = self.write_state();
            if s.symbol == symbol {
                return;
            }
            s.symbol = symbol.clone();
            s.quote = None;
            s.ohlc = None;
            s.indicators = None;
        }
        self.log(format!("Active symbol: {symbol}"));
        tokio::join!(
            self.refresh_quote(),
            self.refresh_ohlc(),
            self.refresh_indicators()
        );
        self.schedule_validation();
    }

    // ------------------------------------------------------------------
    // Trade validation
    // ------------------------------------------------------------------

    /// Record the order form and schedule a validation call.
    pub fn update_draft(self: &Arc<Self>, draft: OrderDraft) {
        *self.lock_draft() = Some(draft);
        self.schedule_validation();
    }

    pub fn draft(&self) -> Option<OrderDraft> {
        self.lock_draft().clone()
    }

    fn validation_request(&self, draft: &OrderDraft) -> Option<ValidationRequest> {
        let price = draft
            .price
            .filter(|p| *p > 0.0)
            .unwrap_or_else(|| self.read_state().latest_price());
        if draft.symbol.trim().is_empty() || draft.quantity <= 0.0 || price <= 0.0 {
            return None;
        }
        Some(ValidationRequest {
            session_id: self.params.session_id.clone(),
            user_id: self.params.user_id.clone(),
            symbol: draft.symbol.clone(),
            action: draft.action,
            quantity: draft.quantity,
            price,
        })
    }

    /// Debounced: a newer call within the quiet period replaces this one.
    pub fn schedule_validation(self: &Arc<Self>) {
        let Some(draft) = self.draft() else {
            return;
        };
        let Some(req) = self.validation_request(&draft) else {
            debug!("Validation skipped: incomplete order form");
            self.validator.cancel();
            return;
        };
        let weak = Arc::downgrade(self);
        self.validator
            .schedule(self.params.validation_debounce, async move {
                if let Some(ctrl) = weak.upgrade() {
                    ctrl.run_validation(&req).await;
                }
            });
    }

    async fn run_validation(&self, req: &ValidationRequest) {
        let key = "validation";
        let ticket = self.lock_tickets().issue(key);
        let result = self.api.validate_trade(req).await;
        if !self.lock_tickets().is_current(key, ticket) {
            return;
        }
        let validation = match result {
            Ok(v) => v,
            Err(e) => {
                debug!("Validation request failed: {e}");
                TradeValidation::failed(e.user_message())
            }
        };
        self.write_state().validation = validation;
    }

    // ------------------------------------------------------------------
    // User actions (errors surfaced)
    // ------------------------------------------------------------------

    /// Place an order, reopening the stream first if it dropped, then
    /// reconcile portfolio and orders.
    pub async fn submit_trade(
        self: &Arc<Self>,
        draft: &OrderDraft,
    ) -> Result<TradeReceipt, ClientError> {
        self.ensure_connected();

        let price = draft
            .price
            .filter(|p| *p > 0.0)
            .unwrap_or_else(|| self.read_state().latest_price());
        let req = TradeRequest {
            session_id: self.params.session_id.clone(),
            user_id: self.params.user_id.clone(),
            symbol: draft.symbol.clone(),
            action: draft.action,
            quantity: draft.quantity,
            order_type: draft.order_type,
            price,
            stop_loss: draft.stop_loss,
            take_profit: draft.take_profit,
        };

        match self.api.trade(&req).await {
            Ok(receipt) => {
                {
                    let mut s = self.write_state();
                    s.add_log(format!(
                        "{} {} x{} @ {:.2} ({})",
                        req.action.as_str().to_uppercase(),
                        req.symbol,
                        req.quantity,
                        receipt.price,
                        receipt.status
                    ));
                    s.last_trade = Some(receipt.clone());
                    s.last_error = None;
                }
                tokio::join!(self.refresh_portfolio(), self.refresh_orders());
                Ok(receipt)
            }
            Err(e) => {
                let msg = e.user_message();
                warn!("Trade failed: {e}");
                let mut s = self.write_state();
                s.add_log(format!("Trade failed: {msg}"));
                s.last_error = Some(msg);
                Err(e)
            }
        }
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), ClientError> {
        let result = self
            .api
            .cancel_order(&self.params.session_id, &self.params.user_id, order_id)
            .await;
        match result {
            Ok(_) => {
                self.log(format!("Order {order_id} canceled"));
                self.refresh_orders().await;
                Ok(())
            }
            Err(e) => {
                self.write_state().last_error = Some(e.user_message());
                Err(e)
            }
        }
    }

    /// Optimistically set or clear one exit condition.
    ///
    /// The local value shows immediately. The full pair goes to the backend;
    /// either way a portfolio fetch follows, and after a failure any local
    /// value still standing is rolled back.
    pub async fn set_exit_condition(
        &self,
        symbol: &str,
        field: ExitField,
        value: Option<f64>,
    ) -> Result<(), ClientError> {
        let pair = {
            let mut s = self.write_state();
            let Some(position) = s.positions.get(symbol) else {
                return Err(ClientError::InvalidExitCondition(format!(
                    "No open position in {symbol}"
                )));
            };
            check_exit_condition(&position, field, value)?;
            s.positions
                .apply_local(symbol, field, value)
                .ok_or_else(|| ClientError::InvalidExitCondition(format!("No open position in {symbol}")))?
        };

        let req = ExitConditionsRequest {
            session_id: self.params.session_id.clone(),
            symbol: symbol.to_string(),
            stop_loss: pair.stop_loss,
            take_profit: pair.take_profit,
        };

        match self.api.set_exit_conditions(&self.params.user_id, &req).await {
            Ok(_) => {
                self.log(format!("{symbol} {field} set to {value:?}"));
                self.refresh_portfolio().await;
                Ok(())
            }
            Err(e) => {
                let msg = e.user_message();
                warn!("Exit condition update failed for {symbol}: {e}");
                {
                    let mut s = self.write_state();
                    s.last_error = Some(msg.clone());
                    s.add_log(format!("{symbol} {field} rejected: {msg}"));
                }
                self.refresh_portfolio().await;
                self.write_state().positions.revert_local(symbol);
                Err(e)
            }
        }
    }

    pub async fn activate(&self) -> Result<ActivationResult, ClientError> {
        let result = self.api.activate_session(&self.params.session_id).await?;
        self.log(format!("Activate session: {}", result.message));
        Ok(result)
    }
}

impl Drop for SessionSyncController {
    fn drop(&mut self) {
        self.close_stream();
    }
}

fn apply_portfolio(state: &mut SessionState, snapshot: PortfolioSnapshot) {
    state.positions.replace_confirmed(snapshot.positions);
    if let Some(cash) = snapshot.cash {
        state.cash = cash;
    }
}

/// Drains one socket's events into the controller, in order.
async fn pump(
    weak: Weak<SessionSyncController>,
    gen: u64,
    mut events: mpsc::Receiver<StreamEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(ctrl) = weak.upgrade() else {
            return;
        };
        if !ctrl.is_current_stream(gen) {
            return;
        }
        match event {
            StreamEvent::Opened => {
                ctrl.write_state().phase = ConnectionPhase::Streaming;
                ctrl.log("Stream connected");
            }
            StreamEvent::Frame(text) => {
                let Some(frame) = StreamFrame::parse(&text) else {
                    debug!("Ignoring non-JSON frame");
                    continue;
                };
                let effect = ctrl.apply_frame(&frame);
                if effect.ended {
                    ctrl.close_stream();
                    return;
                }
                if effect.tick_advanced {
                    let c = Arc::clone(&ctrl);
                    tokio::spawn(async move {
                        c.refresh_after_tick().await;
                        c.schedule_validation();
                    });
                }
            }
            StreamEvent::Error(e) => ctrl.mark_disconnected(&e),
            StreamEvent::Closed => {
                ctrl.mark_disconnected("closed");
                return;
            }
        }
    }
    if let Some(ctrl) = weak.upgrade() {
        if ctrl.is_current_stream(gen) {
            ctrl.mark_disconnected("stream ended");
        }
    }
}
