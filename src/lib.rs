//! Live trading-session client for the TradeSim simulator.
//!
//! REST access ([`api`]), the session stream ([`stream`]), a TTL chart cache
//! with live-tick fan-out ([`chart_cache`]) and the controller that keeps one
//! session's state in sync ([`session`]).
pub mod api;
pub mod chart_cache;
pub mod chat;
pub mod clock;
pub mod config;
pub mod dashboard;
pub mod debounce;
pub mod error;
pub mod models;
pub mod positions;
pub mod session;
pub mod stream;

pub use api::{HttpSimApi, SimApi};
pub use chart_cache::{ChartDataCache, Subscription};
pub use error::ClientError;
pub use session::{OrderDraft, SessionParams, SessionSyncController};
pub use stream::{StreamConnector, WsConnector};
