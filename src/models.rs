/// models.rs – Core data types shared across the session client.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

use crate::positions::PositionBook;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Buy => "buy",
            Action::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    #[serde(alias = "cancelled")]
    Canceled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
        }
    }

    /// Filled and canceled orders never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled)
    }

    /// Only pending orders may move, and only to a terminal state.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        self == OrderStatus::Pending && next.is_terminal()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream connection phase of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    Connecting,
    Streaming,
    #[default]
    Disconnected,
}

impl ConnectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionPhase::Connecting => "CONNECTING",
            ConnectionPhase::Streaming => "STREAMING",
            ConnectionPhase::Disconnected => "DISCONNECTED",
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionPhase::Streaming
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub cash: f64,
    pub current_tick: u64,
    pub is_active: bool,
    pub label: String,
    pub duration_seconds: f64,
    pub pnl: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub unlocked: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationResult {
    pub success: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    pub symbol: String,
    pub holdings: f64,
    pub avg_price: f64,
    /// The backend calls this `last_price`.
    #[serde(alias = "last_price")]
    pub current_price: f64,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub pnl: f64,
    pub market_value: f64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.holdings > 0.0
    }

    pub fn unrealised_pnl(&self) -> f64 {
        self.holdings * (self.current_price - self.avg_price)
    }
}

/// Authoritative portfolio as returned by `GET /sim/portfolio` or pushed on the stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortfolioSnapshot {
    pub positions: Vec<Position>,
    pub cash: Option<f64>,
}

impl PortfolioSnapshot {
    /// Accepts `{portfolio: [...], session: {cash}}`, `{positions: [...], session: {cash}}`
    /// or a bare position array.
    pub fn from_value(v: &Value) -> Option<Self> {
        let (list, cash) = match v {
            Value::Array(_) => (v, None),
            Value::Object(o) => {
                let list = o.get("portfolio").or_else(|| o.get("positions"))?;
                let cash = o
                    .get("session")
                    .and_then(|s| s.get("cash"))
                    .or_else(|| o.get("cash"))
                    .and_then(value_as_f64);
                (list, cash)
            }
            _ => return None,
        };
        let positions: Vec<Position> = serde_json::from_value(list.clone()).ok()?;
        Some(Self {
            positions: positions.into_iter().filter(Position::is_open).collect(),
            cash,
        })
    }
}

// ---------------------------------------------------------------------------
// Orders / trades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(alias = "order_id", alias = "trade_id", default)]
    pub id: String,
    pub symbol: String,
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
    pub action: Action,
    pub quantity: f64,
    #[serde(default)]
    pub price: f64,
    #[serde(default = "default_order_status")]
    pub status: OrderStatus,
}

fn default_order_type() -> OrderType {
    OrderType::Market
}

fn default_order_status() -> OrderStatus {
    OrderStatus::Pending
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeRequest {
    pub session_id: String,
    pub user_id: String,
    pub symbol: String,
    pub action: Action,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeReceipt {
    pub success: bool,
    pub trade_id: String,
    pub symbol: String,
    pub action: String,
    pub quantity: f64,
    pub price: f64,
    pub status: String,
    pub new_holdings: Option<f64>,
    pub new_cash: Option<f64>,
}

/// Parameters for `POST /sim/validate-trade`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRequest {
    pub session_id: String,
    pub user_id: String,
    pub symbol: String,
    pub action: Action,
    pub quantity: f64,
    pub price: f64,
}

/// Advisory pre-trade check; the backend still has the final word on the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeValidation {
    pub valid: bool,
    pub error: Option<String>,
    pub can_buy: bool,
    pub can_sell: bool,
    pub current_cash: f64,
    pub current_holdings: f64,
    pub max_affordable_quantity: f64,
    pub max_sellable_quantity: f64,
}

impl Default for TradeValidation {
    fn default() -> Self {
        Self {
            valid: true,
            error: None,
            can_buy: true,
            can_sell: true,
            current_cash: 0.0,
            current_holdings: 0.0,
            max_affordable_quantity: 0.0,
            max_sellable_quantity: 0.0,
        }
    }
}

impl TradeValidation {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            can_buy: false,
            can_sell: false,
            ..Self::default()
        }
    }

    /// Whether the order form may submit `action`.
    pub fn allows(&self, action: Action) -> bool {
        self.valid
            && match action {
                Action::Buy => self.can_buy,
                Action::Sell => self.can_sell,
            }
    }
}

/// Body of `POST /sim/set_exit_conditions`. `None` is sent as explicit `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitConditionsRequest {
    pub session_id: String,
    pub symbol: String,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quote {
    pub last_price: f64,
    pub abs_change: f64,
    pub pct_change: f64,
    pub prev_close: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OhlcvBar {
    pub timestamp: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick: Option<u64>,
}

impl OhlcvBar {
    /// Flat bar for a single streamed price; the stream carries no volume.
    pub fn from_tick(price: f64, tick: u64, timestamp: String) -> Self {
        Self {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            tick: Some(tick),
        }
    }
}

/// Fundamental and technical indicator bundle (market cap, P/E, RSI, MACD, ...).
pub type Indicators = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Stream frames
// ---------------------------------------------------------------------------

/// One frame pushed on `/sim/stream/{session_id}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFrame {
    pub tick: Option<u64>,
    pub current_tick: Option<u64>,
    pub prices: Option<HashMap<String, f64>>,
    pub portfolio: Option<PortfolioSnapshot>,
    pub cash: Option<f64>,
    pub timestamp: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
}

impl StreamFrame {
    /// Returns `None` for anything that is not a JSON object.
    pub fn parse(text: &str) -> Option<Self> {
        let msg: Value = serde_json::from_str(text).ok()?;
        let obj = msg.as_object()?;

        let prices = obj.get("prices").and_then(|p| p.as_object()).map(|p| {
            p.iter()
                .filter_map(|(sym, v)| value_as_f64(v).map(|price| (sym.clone(), price)))
                .collect::<HashMap<_, _>>()
        });

        let cash = obj
            .get("cash")
            .or_else(|| obj.get("session").and_then(|s| s.get("cash")))
            .and_then(value_as_f64);

        // The backend pushes the position list bare with cash beside it.
        let portfolio = obj
            .get("portfolio")
            .and_then(PortfolioSnapshot::from_value)
            .map(|mut snapshot| {
                snapshot.cash = snapshot.cash.or(cash);
                snapshot
            });

        Some(Self {
            tick: obj.get("tick").and_then(value_as_u64),
            current_tick: obj.get("current_tick").and_then(value_as_u64),
            prices,
            portfolio,
            cash,
            timestamp: obj
                .get("timestamp")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            status: obj.get("status").and_then(|v| v.as_str()).map(str::to_string),
            error: obj.get("error").and_then(|v| v.as_str()).map(str::to_string),
        })
    }

    pub fn effective_tick(&self) -> Option<u64> {
        self.tick.or(self.current_tick)
    }

    /// Tick and prices, only when both are present.
    pub fn tick_prices(&self) -> Option<(u64, &HashMap<String, f64>)> {
        Some((self.tick?, self.prices.as_ref()?))
    }

    pub fn is_session_end(&self) -> bool {
        matches!(self.status.as_deref(), Some("ended" | "session_ended"))
    }
}

pub fn value_as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
}

fn value_as_u64(v: &Value) -> Option<u64> {
    v.as_u64()
        .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

// ---------------------------------------------------------------------------
// Shared session state (for dashboard + async tasks)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub session_id: String,
    pub user_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub phase: ConnectionPhase,
    pub ended: bool,
    pub current_tick: u64,
    pub symbol: String,
    pub positions: PositionBook,
    pub cash: f64,
    pub orders: Vec<Order>,
    pub quote: Option<Quote>,
    pub ohlc: Option<OhlcvBar>,
    /// Latest bar pushed on the stream for the active symbol.
    pub live_bar: Option<OhlcvBar>,
    pub indicators: Option<Indicators>,
    pub validation: TradeValidation,
    pub last_trade: Option<TradeReceipt>,
    pub last_error: Option<String>,
    pub logs: VecDeque<String>,
}

impl SessionState {
    pub fn add_log(&mut self, msg: impl Into<String>) {
        let entry = format!("[{}] {}", Utc::now().format("%H:%M:%S"), msg.into());
        self.logs.push_front(entry);
        while self.logs.len() > 200 {
            self.logs.pop_back();
        }
    }

    /// Price used for order entry: last quote, falling back to the position mark.
    pub fn latest_price(&self) -> f64 {
        self.quote
            .as_ref()
            .map(|q| q.last_price)
            .filter(|p| *p > 0.0)
            .or_else(|| self.positions.get(&self.symbol).map(|p| p.current_price))
            .unwrap_or(0.0)
    }
}
