/// api.rs – Async client for the simulation REST API.
///
/// Responsibilities:
///  - Trade entry, validation, order listing and cancellation
///  - Portfolio, quote, OHLC and indicator lookups for a session
///  - Chart history (`/chart_data`) and the symbol catalog
///  - Progression endpoints (units, levels, quizzes), passed through as JSON
///
/// Every call that needs a session or user checks for it before any I/O.
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::BackendConfig;
use crate::error::{detail_from_body, ClientError};
use crate::models::{
    ActivationResult, ExitConditionsRequest, Indicators, OhlcvBar, Order, OrderStatus,
    PortfolioSnapshot, Quote, TradeReceipt, TradeRequest, TradeValidation, ValidationRequest,
};

/// Intervals the chart backend serves when the catalog call fails.
pub const DEFAULT_INTERVALS: [&str; 4] = ["30s", "1min", "5min", "30min"];

pub fn require(name: &'static str, value: &str) -> Result<(), ClientError> {
    if value.trim().is_empty() {
        return Err(ClientError::MissingParameter(name));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SimApi
// ---------------------------------------------------------------------------

/// The simulation endpoints the live session depends on.
#[async_trait]
pub trait SimApi: Send + Sync {
    async fn trade(&self, req: &TradeRequest) -> Result<TradeReceipt, ClientError>;

    async fn validate_trade(&self, req: &ValidationRequest)
        -> Result<TradeValidation, ClientError>;

    async fn orders(
        &self,
        session_id: &str,
        user_id: &str,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>, ClientError>;

    async fn cancel_order(
        &self,
        session_id: &str,
        user_id: &str,
        order_id: &str,
    ) -> Result<Value, ClientError>;

    async fn portfolio(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<PortfolioSnapshot, ClientError>;

    async fn quote(&self, session_id: &str, symbol: &str) -> Result<Quote, ClientError>;

    async fn symbols(&self) -> Result<Vec<String>, ClientError>;

    async fn ohlc(&self, session_id: &str, symbol: &str) -> Result<OhlcvBar, ClientError>;

    async fn set_exit_conditions(
        &self,
        user_id: &str,
        req: &ExitConditionsRequest,
    ) -> Result<Value, ClientError>;

    async fn fundamentals(&self, session_id: &str, symbol: &str)
        -> Result<Indicators, ClientError>;

    async fn chart_data(
        &self,
        symbol: &str,
        interval: &str,
        days: u32,
        session_id: Option<&str>,
    ) -> Result<Vec<OhlcvBar>, ClientError>;

    async fn activate_session(&self, session_id: &str) -> Result<ActivationResult, ClientError>;
}

// ---------------------------------------------------------------------------
// HttpSimApi
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HttpSimApi {
    base_url: String,
    sim_base_path: String,
    chart_base_path: String,
    http: Client,
}

impl HttpSimApi {
    pub fn new(backend: &BackendConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(backend.request_timeout())
            .build()?;
        Ok(Self {
            base_url: backend.base_url(),
            sim_base_path: backend.sim_base_path.clone(),
            chart_base_path: backend.chart_base_path.clone(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn sim_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, self.sim_base_path, path)
    }

    fn chart_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, self.chart_base_path, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        debug!("GET {url}");
        let resp = self.http.get(url).query(query).send().await?;
        decode(resp).await
    }

    // ------------------------------------------------------------------
    // Chart catalog
    // ------------------------------------------------------------------

    pub async fn chart_range(
        &self,
        symbol: &str,
        start_tick: u64,
        end_tick: u64,
        interval: &str,
    ) -> Result<Vec<OhlcvBar>, ClientError> {
        require("symbol", symbol)?;
        let v: Value = self
            .get_json(
                &self.chart_url(&format!("/{symbol}/range")),
                &[
                    ("start_tick", start_tick.to_string()),
                    ("end_tick", end_tick.to_string()),
                    ("interval", interval.to_string()),
                ],
            )
            .await?;
        bars_from_value(&v)
    }

    pub async fn chart_tick(
        &self,
        symbol: &str,
        tick: u64,
        interval: &str,
    ) -> Result<Value, ClientError> {
        require("symbol", symbol)?;
        self.get_json(
            &self.chart_url(&format!("/{symbol}/tick/{tick}")),
            &[("interval", interval.to_string())],
        )
        .await
    }

    /// Available bar intervals; falls back to [`DEFAULT_INTERVALS`] on any failure.
    pub async fn chart_intervals(&self) -> Vec<String> {
        let intervals = match self.get_json::<Value>(&self.chart_url("/intervals"), &[]).await {
            Ok(v) => string_list(&v, "intervals"),
            Err(e) => {
                debug!("Interval catalog unavailable: {e}");
                Vec::new()
            }
        };
        if intervals.is_empty() {
            DEFAULT_INTERVALS.iter().map(|s| s.to_string()).collect()
        } else {
            intervals
        }
    }

    pub async fn chart_symbols(&self, interval: &str) -> Result<Vec<String>, ClientError> {
        let v: Value = self
            .get_json(&self.chart_url(&format!("/symbols/{interval}")), &[])
            .await?;
        Ok(string_list(&v, "symbols"))
    }

    pub async fn chart_metadata(&self, symbol: &str, interval: &str) -> Result<Value, ClientError> {
        require("symbol", symbol)?;
        self.get_json(
            &self.chart_url(&format!("/metadata/{symbol}")),
            &[("interval", interval.to_string())],
        )
        .await
    }

    // ------------------------------------------------------------------
    // Progression (opaque JSON)
    // ------------------------------------------------------------------

    pub async fn complete_level(&self, user_id: &str, level_id: i64) -> Result<Value, ClientError> {
        require("user_id", user_id)?;
        let resp = self
            .http
            .post(format!("{}/level/api/complete", self.base_url))
            .json(&json!({ "user_id": user_id, "level_id": level_id }))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn user_levels(&self, user_id: &str, unit: i64) -> Result<Value, ClientError> {
        require("user_id", user_id)?;
        self.get_json(
            &format!("{}/level/user/{user_id}", self.base_url),
            &[("unit", unit.to_string())],
        )
        .await
    }

    pub async fn quiz(&self, level_id: i64) -> Result<Value, ClientError> {
        self.get_json(&format!("{}/quiz/api/{level_id}", self.base_url), &[])
            .await
    }

    pub async fn submit_answer(&self, answer: &Value) -> Result<Value, ClientError> {
        let resp = self
            .http
            .post(format!("{}/quiz/api/answer", self.base_url))
            .json(answer)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn microlearning(&self, level_id: i64, page: u32) -> Result<Value, ClientError> {
        self.get_json(
            &format!("{}/microlearning/api/{level_id}/{page}", self.base_url),
            &[],
        )
        .await
    }

    pub async fn units(&self) -> Result<Value, ClientError> {
        self.get_json(&format!("{}/units/", self.base_url), &[]).await
    }

    pub async fn unit(&self, unit_id: &str) -> Result<Value, ClientError> {
        require("unit_id", unit_id)?;
        self.get_json(&format!("{}/units/{unit_id}", self.base_url), &[])
            .await
    }
}

#[async_trait]
impl SimApi for HttpSimApi {
    async fn trade(&self, req: &TradeRequest) -> Result<TradeReceipt, ClientError> {
        require("user_id", &req.user_id)?;
        require("session_id", &req.session_id)?;
        require("symbol", &req.symbol)?;

        let mut query = vec![
            ("session_id", req.session_id.clone()),
            ("user_id", req.user_id.clone()),
            ("symbol", req.symbol.clone()),
            ("action", req.action.as_str().to_string()),
            ("quantity", req.quantity.to_string()),
            ("order_type", req.order_type.as_str().to_string()),
            ("price", req.price.to_string()),
        ];
        if let Some(sl) = req.stop_loss {
            query.push(("stop_loss", sl.to_string()));
        }
        if let Some(tp) = req.take_profit {
            query.push(("take_profit", tp.to_string()));
        }

        info!(
            "{} {} {} x{} @ {:.2}",
            req.order_type, req.action, req.symbol, req.quantity, req.price
        );
        let resp = self
            .http
            .post(self.sim_url("/trade"))
            .query(&query)
            .send()
            .await?;
        decode(resp).await
    }

    async fn validate_trade(
        &self,
        req: &ValidationRequest,
    ) -> Result<TradeValidation, ClientError> {
        require("user_id", &req.user_id)?;
        require("session_id", &req.session_id)?;
        let resp = self
            .http
            .post(self.sim_url("/validate-trade"))
            .query(&[
                ("session_id", req.session_id.clone()),
                ("user_id", req.user_id.clone()),
                ("symbol", req.symbol.clone()),
                ("action", req.action.as_str().to_string()),
                ("quantity", req.quantity.to_string()),
                ("price", req.price.to_string()),
            ])
            .send()
            .await?;
        decode(resp).await
    }

    async fn orders(
        &self,
        session_id: &str,
        user_id: &str,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>, ClientError> {
        require("user_id", user_id)?;
        require("session_id", session_id)?;
        let mut query = vec![
            ("session_id", session_id.to_string()),
            ("user_id", user_id.to_string()),
        ];
        if let Some(s) = status {
            query.push(("status", s.as_str().to_string()));
        }
        let v: Value = self.get_json(&self.sim_url("/orders"), &query).await?;
        // Either a bare list or {orders: [...]}
        let list = v.get("orders").cloned().unwrap_or(v);
        serde_json::from_value(list).map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn cancel_order(
        &self,
        session_id: &str,
        user_id: &str,
        order_id: &str,
    ) -> Result<Value, ClientError> {
        require("user_id", user_id)?;
        require("session_id", session_id)?;
        require("order_id", order_id)?;
        let resp = self
            .http
            .post(self.sim_url(&format!("/orders/{order_id}/cancel")))
            .query(&[("session_id", session_id), ("user_id", user_id)])
            .send()
            .await?;
        decode(resp).await
    }

    async fn portfolio(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<PortfolioSnapshot, ClientError> {
        require("user_id", user_id)?;
        require("session_id", session_id)?;
        let v: Value = self
            .get_json(
                &self.sim_url("/portfolio"),
                &[
                    ("user_id", user_id.to_string()),
                    ("session_id", session_id.to_string()),
                ],
            )
            .await?;
        PortfolioSnapshot::from_value(&v)
            .ok_or_else(|| ClientError::Decode("unexpected portfolio shape".into()))
    }

    async fn quote(&self, session_id: &str, symbol: &str) -> Result<Quote, ClientError> {
        require("session_id", session_id)?;
        require("symbol", symbol)?;
        self.get_json(&self.sim_url(&format!("/quote/{session_id}/{symbol}")), &[])
            .await
    }

    async fn symbols(&self) -> Result<Vec<String>, ClientError> {
        let v: Value = self.get_json(&self.sim_url("/symbols"), &[]).await?;
        Ok(string_list(&v, "symbols"))
    }

    async fn ohlc(&self, session_id: &str, symbol: &str) -> Result<OhlcvBar, ClientError> {
        require("session_id", session_id)?;
        require("symbol", symbol)?;
        self.get_json(&self.sim_url(&format!("/ohlc/{session_id}/{symbol}")), &[])
            .await
    }

    async fn set_exit_conditions(
        &self,
        user_id: &str,
        req: &ExitConditionsRequest,
    ) -> Result<Value, ClientError> {
        require("user_id", user_id)?;
        require("session_id", &req.session_id)?;
        require("symbol", &req.symbol)?;
        info!(
            "Exit conditions {} SL={:?} TP={:?}",
            req.symbol, req.stop_loss, req.take_profit
        );
        let resp = self
            .http
            .post(self.sim_url("/set_exit_conditions"))
            .query(&[("user_id", user_id)])
            .json(req)
            .send()
            .await?;
        decode(resp).await
    }

    async fn fundamentals(
        &self,
        session_id: &str,
        symbol: &str,
    ) -> Result<Indicators, ClientError> {
        require("session_id", session_id)?;
        require("symbol", symbol)?;
        self.get_json(
            &self.sim_url(&format!("/fundamentals/{session_id}/{symbol}")),
            &[],
        )
        .await
    }

    async fn chart_data(
        &self,
        symbol: &str,
        interval: &str,
        days: u32,
        session_id: Option<&str>,
    ) -> Result<Vec<OhlcvBar>, ClientError> {
        require("symbol", symbol)?;
        let mut query = vec![("interval", interval.to_string()), ("days", days.to_string())];
        if let Some(sid) = session_id.filter(|s| !s.is_empty()) {
            query.push(("session_id", sid.to_string()));
        }
        let v: Value = self
            .get_json(&self.chart_url(&format!("/{symbol}")), &query)
            .await?;
        bars_from_value(&v)
    }

    async fn activate_session(&self, session_id: &str) -> Result<ActivationResult, ClientError> {
        require("session_id", session_id)?;
        let resp = self
            .http
            .post(self.sim_url("/activate-session"))
            .json(&json!({ "session_id": session_id }))
            .send()
            .await?;
        decode(resp).await
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::Http {
            status: status.as_u16(),
            detail: detail_from_body(&body),
        });
    }
    resp.json::<T>()
        .await
        .map_err(|e| ClientError::Decode(e.to_string()))
}

/// `{data: [...]}` with a missing `data` treated as no bars.
fn bars_from_value(v: &Value) -> Result<Vec<OhlcvBar>, ClientError> {
    match v.get("data") {
        Some(data) => {
            serde_json::from_value(data.clone()).map_err(|e| ClientError::Decode(e.to_string()))
        }
        None => Ok(Vec::new()),
    }
}

/// A bare string array, or the array under `key`.
fn string_list(v: &Value, key: &str) -> Vec<String> {
    let arr = match v {
        Value::Array(a) => Some(a),
        Value::Object(o) => o.get(key).and_then(|x| x.as_array()),
        _ => None,
    };
    arr.map(|a| {
        a.iter()
            .filter_map(|s| s.as_str().map(str::to_string))
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, OrderType};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Nothing listens on port 9; a request that got that far would fail
    /// with a transport error, not a missing-parameter one.
    fn offline_api() -> HttpSimApi {
        let backend = BackendConfig {
            port: 9,
            host: "127.0.0.1".into(),
            ..BackendConfig::default()
        };
        HttpSimApi::new(&backend).unwrap()
    }

    /// One-shot backend on a free port. Replies to the first request with
    /// `status` and a JSON `body`; the handle yields the raw request text.
    async fn serve_once(status: &str, body: &str) -> (HttpSimApi, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reply = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                if let Some(end) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&raw[..end]).to_lowercase();
                    let body_len = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + body_len {
                        break;
                    }
                }
            }
            sock.write_all(reply.as_bytes()).await.unwrap();
            let _ = sock.shutdown().await;
            String::from_utf8_lossy(&raw).into_owned()
        });
        let backend = BackendConfig {
            host: "127.0.0.1".into(),
            port,
            ..BackendConfig::default()
        };
        (HttpSimApi::new(&backend).unwrap(), server)
    }

    fn request_line(raw: &str) -> &str {
        raw.lines().next().unwrap_or_default()
    }

    fn trade(user_id: &str, session_id: &str) -> TradeRequest {
        TradeRequest {
            session_id: session_id.into(),
            user_id: user_id.into(),
            symbol: "MSFT".into(),
            action: Action::Buy,
            quantity: 10.0,
            order_type: OrderType::Market,
            price: 400.0,
            stop_loss: None,
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn trade_without_user_fails_before_io() {
        let err = offline_api().trade(&trade("", "session1")).await.unwrap_err();
        assert!(matches!(err, ClientError::MissingParameter("user_id")));
    }

    #[tokio::test]
    async fn trade_without_session_fails_before_io() {
        let err = offline_api().trade(&trade("uid", "")).await.unwrap_err();
        assert!(matches!(err, ClientError::MissingParameter("session_id")));
    }

    #[tokio::test]
    async fn session_scoped_calls_require_session() {
        let api = offline_api();
        assert!(api.portfolio("", "uid").await.unwrap_err().is_missing_parameter());
        assert!(api.orders("s", "", None).await.unwrap_err().is_missing_parameter());
        assert!(api.cancel_order("", "uid", "o1").await.unwrap_err().is_missing_parameter());
        assert!(api.quote("", "MSFT").await.unwrap_err().is_missing_parameter());
        assert!(api.ohlc("", "MSFT").await.unwrap_err().is_missing_parameter());
        assert!(api.fundamentals("", "MSFT").await.unwrap_err().is_missing_parameter());
        assert!(api.activate_session("").await.unwrap_err().is_missing_parameter());
        let req = ExitConditionsRequest {
            session_id: "s".into(),
            symbol: "MSFT".into(),
            stop_loss: None,
            take_profit: None,
        };
        assert!(api.set_exit_conditions("", &req).await.unwrap_err().is_missing_parameter());
    }

    #[tokio::test]
    async fn chart_data_hits_symbol_path_with_key_query() {
        let (api, server) = serve_once(
            "200 OK",
            r#"{"data":[{"timestamp":"2024-01-02T09:30:00Z","open":1,"high":2,"low":0.5,"close":1.5,"volume":100}]}"#,
        )
        .await;

        let bars = api.chart_data("AAPL", "30s", 7, Some("session1")).await.unwrap();

        let raw = server.await.unwrap();
        assert_eq!(
            request_line(&raw),
            "GET /chart_data/AAPL?interval=30s&days=7&session_id=session1 HTTP/1.1"
        );
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 1.5);
    }

    #[tokio::test]
    async fn trade_sends_order_as_query_parameters() {
        let (api, server) =
            serve_once("200 OK", r#"{"success":true,"trade_id":"t9","new_holdings":10}"#).await;

        let receipt = api.trade(&trade("user1", "session1")).await.unwrap();

        let raw = server.await.unwrap();
        assert_eq!(
            request_line(&raw),
            "POST /sim/trade?session_id=session1&user_id=user1&symbol=MSFT&action=buy&quantity=10&order_type=market&price=400 HTTP/1.1"
        );
        assert!(receipt.success);
        assert_eq!(receipt.trade_id, "t9");
        assert_eq!(receipt.new_holdings, Some(10.0));
        assert_eq!(receipt.new_cash, None);
    }

    #[tokio::test]
    async fn exit_conditions_post_json_with_explicit_null() {
        let (api, server) = serve_once("200 OK", r#"{"success":true}"#).await;
        let req = ExitConditionsRequest {
            session_id: "session1".into(),
            symbol: "MSFT".into(),
            stop_loss: Some(350.0),
            take_profit: None,
        };

        api.set_exit_conditions("user1", &req).await.unwrap();

        let raw = server.await.unwrap();
        assert_eq!(
            request_line(&raw),
            "POST /sim/set_exit_conditions?user_id=user1 HTTP/1.1"
        );
        let body = raw.split("\r\n\r\n").nth(1).unwrap_or_default();
        let sent: Value = serde_json::from_str(body).unwrap();
        assert_eq!(
            sent,
            json!({"session_id": "session1", "symbol": "MSFT", "stop_loss": 350.0, "take_profit": null})
        );
    }

    #[tokio::test]
    async fn chart_range_queries_tick_window() {
        let (api, server) = serve_once("200 OK", r#"{"data":[]}"#).await;

        let bars = api.chart_range("MSFT", 10, 20, "1min").await.unwrap();

        let raw = server.await.unwrap();
        assert_eq!(
            request_line(&raw),
            "GET /chart_data/MSFT/range?start_tick=10&end_tick=20&interval=1min HTTP/1.1"
        );
        assert!(bars.is_empty());
    }

    #[tokio::test]
    async fn error_status_carries_server_detail() {
        let (api, server) = serve_once("400 Bad Request", r#"{"detail":"Insufficient funds"}"#).await;

        let err = api.trade(&trade("user1", "session1")).await.unwrap_err();

        server.await.unwrap();
        match err {
            ClientError::Http { status, detail } => {
                assert_eq!(status, 400);
                assert_eq!(detail.as_deref(), Some("Insufficient funds"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(api.chart_data("", "30s", 7, None).await.unwrap_err().is_missing_parameter());
    }

    #[test]
    fn string_list_accepts_bare_and_wrapped_arrays() {
        assert_eq!(string_list(&json!(["AAPL", "MSFT"]), "symbols"), vec!["AAPL", "MSFT"]);
        assert_eq!(string_list(&json!({"symbols": ["TSLA"]}), "symbols"), vec!["TSLA"]);
        assert!(string_list(&json!({"other": 1}), "symbols").is_empty());
    }

    #[test]
    fn bars_from_value_defaults_to_empty() {
        assert!(bars_from_value(&json!({})).unwrap().is_empty());
        let bars = bars_from_value(&json!({"data": [
            {"timestamp": "2024-01-02T09:30:00Z", "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 100.0}
        ]}))
        .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 1.5);
    }
}
