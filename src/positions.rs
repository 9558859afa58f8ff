/// positions.rs – Position list with optimistic stop-loss / take-profit edits.
///
/// Exit-condition fields are `Tracked`: a local edit is `Local` until the next
/// authoritative portfolio (REST fetch or stream push) replaces the book,
/// which turns every field back into `Confirmed`.
use crate::error::ClientError;
use crate::models::Position;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tracked<T> {
    /// Optimistic value not yet confirmed by the server.
    Local(T),
    Confirmed(T),
}

impl<T: Copy> Tracked<T> {
    pub fn value(&self) -> T {
        match self {
            Tracked::Local(v) | Tracked::Confirmed(v) => *v,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Tracked::Local(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitField {
    StopLoss,
    TakeProfit,
}

impl ExitField {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitField::StopLoss => "stop_loss",
            ExitField::TakeProfit => "take_profit",
        }
    }
}

impl std::fmt::Display for ExitField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full pair sent to `set_exit_conditions`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitPair {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPosition {
    confirmed: Position,
    stop_loss: Tracked<Option<f64>>,
    take_profit: Tracked<Option<f64>>,
}

impl TrackedPosition {
    pub fn confirmed(position: Position) -> Self {
        Self {
            stop_loss: Tracked::Confirmed(position.stop_loss_price),
            take_profit: Tracked::Confirmed(position.take_profit_price),
            confirmed: position,
        }
    }

    pub fn field(&self, field: ExitField) -> Tracked<Option<f64>> {
        match field {
            ExitField::StopLoss => self.stop_loss,
            ExitField::TakeProfit => self.take_profit,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.stop_loss.is_local() || self.take_profit.is_local()
    }

    /// Position as it should be displayed (optimistic values applied).
    pub fn view(&self) -> Position {
        Position {
            stop_loss_price: self.stop_loss.value(),
            take_profit_price: self.take_profit.value(),
            ..self.confirmed.clone()
        }
    }

    /// Server-confirmed position, ignoring any local edit.
    pub fn server(&self) -> &Position {
        &self.confirmed
    }

    fn exit_pair(&self) -> ExitPair {
        ExitPair {
            stop_loss: self.stop_loss.value(),
            take_profit: self.take_profit.value(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionBook {
    entries: Vec<TrackedPosition>,
}

impl PositionBook {
    pub fn from_confirmed(positions: Vec<Position>) -> Self {
        Self {
            entries: positions.into_iter().map(TrackedPosition::confirmed).collect(),
        }
    }

    /// Wholesale replacement with server truth; drops every local edit.
    pub fn replace_confirmed(&mut self, positions: Vec<Position>) {
        *self = Self::from_confirmed(positions);
    }

    /// Patch one exit field locally and return the full pair to send.
    ///
    /// Returns `None` when the symbol is not held.
    pub fn apply_local(
        &mut self,
        symbol: &str,
        field: ExitField,
        value: Option<f64>,
    ) -> Option<ExitPair> {
        let entry = self.entries.iter_mut().find(|e| e.confirmed.symbol == symbol)?;
        match field {
            ExitField::StopLoss => entry.stop_loss = Tracked::Local(value),
            ExitField::TakeProfit => entry.take_profit = Tracked::Local(value),
        }
        Some(entry.exit_pair())
    }

    /// Drop local edits for `symbol`, falling back to the last confirmed values.
    /// Returns true if anything was pending.
    pub fn revert_local(&mut self, symbol: &str) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.confirmed.symbol == symbol) else {
            return false;
        };
        let pending = entry.is_pending();
        *entry = TrackedPosition::confirmed(entry.confirmed.clone());
        pending
    }

    pub fn tracked(&self, symbol: &str) -> Option<&TrackedPosition> {
        self.entries.iter().find(|e| e.confirmed.symbol == symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.tracked(symbol).map(TrackedPosition::view)
    }

    pub fn views(&self) -> Vec<Position> {
        self.entries.iter().map(TrackedPosition::view).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedPosition> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(TrackedPosition::is_pending)
    }

    pub fn total_market_value(&self) -> f64 {
        self.entries.iter().map(|e| e.confirmed.market_value).sum()
    }

    pub fn total_pnl(&self) -> f64 {
        self.entries.iter().map(|e| e.confirmed.pnl).sum()
    }
}

/// Stop-loss must sit below the current price, take-profit above it.
/// Clearing (`None`) is always allowed.
pub fn check_exit_condition(
    position: &Position,
    field: ExitField,
    value: Option<f64>,
) -> Result<(), ClientError> {
    let Some(v) = value else {
        return Ok(());
    };
    if !v.is_finite() || v <= 0.0 {
        return Err(ClientError::InvalidExitCondition(format!(
            "{field} must be a positive price"
        )));
    }
    let current = position.current_price;
    if current <= 0.0 {
        return Ok(());
    }
    match field {
        ExitField::StopLoss if v >= current => Err(ClientError::InvalidExitCondition(
            "Stop loss must be below the current price".into(),
        )),
        ExitField::TakeProfit if v <= current => Err(ClientError::InvalidExitCondition(
            "Take profit must be above the current price".into(),
        )),
        _ => Ok(()),
    }
}
