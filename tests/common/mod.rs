//! In-memory stand-ins for the backend and the stream transport.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tradesim_client::api::{require, SimApi};
use tradesim_client::config::CacheConfig;
use tradesim_client::error::ClientError;
use tradesim_client::models::{
    Action, ActivationResult, ExitConditionsRequest, Indicators, OhlcvBar, Order, OrderStatus,
    OrderType, PortfolioSnapshot, Position, Quote, TradeReceipt, TradeRequest, TradeValidation,
    ValidationRequest,
};
use tradesim_client::stream::{stream_pair, StreamConnector, StreamHandle, StreamRemote};
use tradesim_client::ChartDataCache;

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ChartCall {
    pub symbol: String,
    pub interval: String,
    pub days: u32,
    pub session_id: Option<String>,
}

pub struct FakeApi {
    pub portfolio: Mutex<PortfolioSnapshot>,
    pub quote: Mutex<Quote>,
    /// Per-symbol override of `quote.last_price`.
    pub quote_prices: Mutex<HashMap<String, f64>>,
    /// Quote calls for this symbol wait on `quote_gate`.
    pub gated_quote: Mutex<Option<String>>,
    pub activations: AtomicUsize,
    pub orders: Mutex<Vec<Order>>,
    pub chart_calls: Mutex<Vec<ChartCall>>,
    pub trades: Mutex<Vec<TradeRequest>>,
    pub validations: Mutex<Vec<ValidationRequest>>,
    pub exit_requests: Mutex<Vec<ExitConditionsRequest>>,
    pub portfolio_calls: AtomicUsize,
    pub quote_calls: AtomicUsize,
    pub fail_chart: AtomicBool,
    pub fail_exit: AtomicBool,
    pub fail_validation: AtomicBool,
    /// Held by a test to park chart / exit-condition calls mid-flight.
    pub chart_gate: tokio::sync::Mutex<()>,
    pub exit_gate: tokio::sync::Mutex<()>,
    pub quote_gate: tokio::sync::Mutex<()>,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self {
            portfolio: Mutex::new(PortfolioSnapshot {
                positions: Vec::new(),
                cash: Some(100_000.0),
            }),
            quote: Mutex::new(Quote {
                last_price: 400.0,
                abs_change: 1.5,
                pct_change: 0.38,
                prev_close: Some(398.5),
            }),
            quote_prices: Mutex::new(HashMap::new()),
            gated_quote: Mutex::new(None),
            activations: AtomicUsize::new(0),
            orders: Mutex::new(Vec::new()),
            chart_calls: Mutex::new(Vec::new()),
            trades: Mutex::new(Vec::new()),
            validations: Mutex::new(Vec::new()),
            exit_requests: Mutex::new(Vec::new()),
            portfolio_calls: AtomicUsize::new(0),
            quote_calls: AtomicUsize::new(0),
            fail_chart: AtomicBool::new(false),
            fail_exit: AtomicBool::new(false),
            fail_validation: AtomicBool::new(false),
            chart_gate: tokio::sync::Mutex::new(()),
            exit_gate: tokio::sync::Mutex::new(()),
            quote_gate: tokio::sync::Mutex::new(()),
        }
    }
}

impl FakeApi {
    pub fn with_positions(positions: Vec<Position>) -> Self {
        let api = Self::default();
        api.portfolio.lock().unwrap().positions = positions;
        api
    }

    pub fn chart_call_count(&self) -> usize {
        self.chart_calls.lock().unwrap().len()
    }
}

pub fn position(symbol: &str, holdings: f64, avg: f64, current: f64) -> Position {
    Position {
        symbol: symbol.into(),
        holdings,
        avg_price: avg,
        current_price: current,
        stop_loss_price: None,
        take_profit_price: None,
        pnl: holdings * (current - avg),
        market_value: holdings * current,
    }
}

pub fn bars(n: usize) -> Vec<OhlcvBar> {
    (0..n)
        .map(|i| OhlcvBar {
            timestamp: format!("2025-01-06T14:{:02}:00Z", i % 60),
            open: 100.0 + i as f64,
            high: 101.0 + i as f64,
            low: 99.0 + i as f64,
            close: 100.5 + i as f64,
            volume: 1_000.0,
            tick: Some(i as u64),
        })
        .collect()
}

#[async_trait]
impl SimApi for FakeApi {
    async fn trade(&self, req: &TradeRequest) -> Result<TradeReceipt, ClientError> {
        require("user_id", &req.user_id)?;
        require("session_id", &req.session_id)?;
        self.trades.lock().unwrap().push(req.clone());

        // Fill market orders against the fake portfolio
        let mut pf = self.portfolio.lock().unwrap();
        let signed = match req.action {
            Action::Buy => req.quantity,
            Action::Sell => -req.quantity,
        };
        match pf.positions.iter_mut().find(|p| p.symbol == req.symbol) {
            Some(p) => p.holdings += signed,
            None => pf
                .positions
                .push(position(&req.symbol, signed, req.price, req.price)),
        }
        pf.positions.retain(|p| p.holdings > 0.0);
        if let Some(cash) = pf.cash.as_mut() {
            *cash -= signed * req.price;
        }
        let new_holdings = pf
            .positions
            .iter()
            .find(|p| p.symbol == req.symbol)
            .map(|p| p.holdings);
        let new_cash = pf.cash;
        drop(pf);

        self.orders.lock().unwrap().push(Order {
            id: format!("t{}", self.trades.lock().unwrap().len()),
            symbol: req.symbol.clone(),
            order_type: req.order_type,
            action: req.action,
            quantity: req.quantity,
            price: req.price,
            status: if req.order_type == OrderType::Market {
                OrderStatus::Filled
            } else {
                OrderStatus::Pending
            },
        });

        Ok(TradeReceipt {
            success: true,
            trade_id: "t1".into(),
            symbol: req.symbol.clone(),
            action: req.action.as_str().into(),
            quantity: req.quantity,
            price: req.price,
            status: "filled".into(),
            new_holdings,
            new_cash,
        })
    }

    async fn validate_trade(
        &self,
        req: &ValidationRequest,
    ) -> Result<TradeValidation, ClientError> {
        self.validations.lock().unwrap().push(req.clone());
        if self.fail_validation.load(Ordering::SeqCst) {
            return Err(ClientError::Http {
                status: 400,
                detail: Some("Insufficient funds".into()),
            });
        }
        Ok(TradeValidation {
            max_affordable_quantity: 250.0,
            ..TradeValidation::default()
        })
    }

    async fn orders(
        &self,
        session_id: &str,
        user_id: &str,
        _status: Option<OrderStatus>,
    ) -> Result<Vec<Order>, ClientError> {
        require("user_id", user_id)?;
        require("session_id", session_id)?;
        Ok(self.orders.lock().unwrap().clone())
    }

    async fn cancel_order(
        &self,
        _session_id: &str,
        _user_id: &str,
        order_id: &str,
    ) -> Result<Value, ClientError> {
        let mut orders = self.orders.lock().unwrap();
        match orders.iter_mut().find(|o| o.id == order_id) {
            Some(o) if o.status.can_transition_to(OrderStatus::Canceled) => {
                o.status = OrderStatus::Canceled;
                Ok(json!({"success": true}))
            }
            _ => Err(ClientError::Http {
                status: 400,
                detail: Some("Order cannot be canceled".into()),
            }),
        }
    }

    async fn portfolio(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<PortfolioSnapshot, ClientError> {
        require("user_id", user_id)?;
        require("session_id", session_id)?;
        self.portfolio_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.portfolio.lock().unwrap().clone())
    }

    async fn quote(&self, _session_id: &str, symbol: &str) -> Result<Quote, ClientError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        let gated = self.gated_quote.lock().unwrap().as_deref() == Some(symbol);
        if gated {
            let _gate = self.quote_gate.lock().await;
        }
        let mut quote = self.quote.lock().unwrap().clone();
        if let Some(price) = self.quote_prices.lock().unwrap().get(symbol) {
            quote.last_price = *price;
        }
        Ok(quote)
    }

    async fn symbols(&self) -> Result<Vec<String>, ClientError> {
        Ok(vec!["AAPL".into(), "MSFT".into(), "TSLA".into()])
    }

    async fn ohlc(&self, _session_id: &str, _symbol: &str) -> Result<OhlcvBar, ClientError> {
        Ok(bars(1).remove(0))
    }

    async fn set_exit_conditions(
        &self,
        _user_id: &str,
        req: &ExitConditionsRequest,
    ) -> Result<Value, ClientError> {
        let _gate = self.exit_gate.lock().await;
        self.exit_requests.lock().unwrap().push(req.clone());
        if self.fail_exit.load(Ordering::SeqCst) {
            return Err(ClientError::Http {
                status: 400,
                detail: Some("Stop loss rejected".into()),
            });
        }
        let mut pf = self.portfolio.lock().unwrap();
        if let Some(p) = pf.positions.iter_mut().find(|p| p.symbol == req.symbol) {
            p.stop_loss_price = req.stop_loss;
            p.take_profit_price = req.take_profit;
        }
        Ok(json!({"success": true}))
    }

    async fn fundamentals(
        &self,
        _session_id: &str,
        _symbol: &str,
    ) -> Result<Indicators, ClientError> {
        let mut ind = Indicators::new();
        ind.insert("pe_ratio".into(), json!(28.4));
        ind.insert("rsi".into(), json!(55.0));
        Ok(ind)
    }

    async fn chart_data(
        &self,
        symbol: &str,
        interval: &str,
        days: u32,
        session_id: Option<&str>,
    ) -> Result<Vec<OhlcvBar>, ClientError> {
        let _gate = self.chart_gate.lock().await;
        self.chart_calls.lock().unwrap().push(ChartCall {
            symbol: symbol.into(),
            interval: interval.into(),
            days,
            session_id: session_id.map(str::to_string),
        });
        if self.fail_chart.load(Ordering::SeqCst) {
            return Err(ClientError::Http {
                status: 500,
                detail: None,
            });
        }
        Ok(bars(3))
    }

    async fn activate_session(&self, session_id: &str) -> Result<ActivationResult, ClientError> {
        require("session_id", session_id)?;
        self.activations.fetch_add(1, Ordering::SeqCst);
        Ok(ActivationResult {
            success: true,
            message: "Session activated".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Stream transport
// ---------------------------------------------------------------------------

/// Hands out channel pairs and keeps the socket-facing ends for the test.
#[derive(Default)]
pub struct FakeConnector {
    pub remotes: Mutex<Vec<StreamRemote>>,
    pub sessions: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn opened(&self) -> usize {
        self.remotes.lock().unwrap().len()
    }

    /// Connections whose owner has not closed them.
    pub fn still_open(&self) -> usize {
        self.remotes
            .lock()
            .unwrap()
            .iter_mut()
            .map(|r| r.close_requested())
            .filter(|closed| !closed)
            .count()
    }

    pub fn close_requested(&self, index: usize) -> bool {
        self.remotes.lock().unwrap()[index].close_requested()
    }

    /// Push an event as if the socket at `index` produced it.
    pub async fn push(&self, index: usize, event: tradesim_client::stream::StreamEvent) {
        let tx = self.remotes.lock().unwrap()[index].events.clone();
        tx.send(event).await.unwrap();
    }
}

impl StreamConnector for FakeConnector {
    fn session_stream(&self, session_id: &str) -> Result<StreamHandle, ClientError> {
        require("session_id", session_id)?;
        let (handle, remote) = stream_pair();
        self.remotes.lock().unwrap().push(remote);
        self.sessions.lock().unwrap().push(session_id.to_string());
        Ok(handle)
    }

    fn chat_stream(&self) -> Result<StreamHandle, ClientError> {
        let (handle, remote) = stream_pair();
        self.remotes.lock().unwrap().push(remote);
        Ok(handle)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn cache_with(
    api: Arc<FakeApi>,
    connector: Arc<FakeConnector>,
    max_entries: usize,
) -> Arc<ChartDataCache> {
    let config = CacheConfig {
        duration_ms: 30_000,
        max_entries,
    };
    Arc::new(ChartDataCache::new(api, connector, &config))
}

/// Poll `cond` until it holds, yielding to spawned tasks in between.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}
