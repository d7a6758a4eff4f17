// =============================================================================
// Trade Manager — validated buy / sell / sidebet orchestration
// =============================================================================
//
// Stateless over (GameState, current signal). Every call:
//   1. rejects when the current phase is blocked for trading
//   2. validates the amount against min/max bet
//   3. clicks the execution bridge BEFORE the local mutation, so the
//      external surface and the local state observe actions in the same
//      order
//   4. applies the mutation and publishes the typed trade event
//
// Rejections surface synchronously as typed errors; the only bus traffic
// they produce is a `TradeFailed` telemetry event.
// =============================================================================

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::events::{BusEvent, TradeEvent};
use crate::game_state::{GameState, StateError};
use crate::types::Phase;

/// Default stake bounds, in SOL.
pub const DEFAULT_MIN_BET: Decimal = dec!(0.001);
pub const DEFAULT_MAX_BET: Decimal = dec!(5);

/// Sidebet window length in ticks; fixed by the upstream game.
pub const SIDEBET_WINDOW_TICKS: u32 = 40;

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("trading blocked during {0}")]
    PhaseBlocked(Phase),
    #[error("amount {amount} below minimum bet {min}")]
    BelowMinBet { amount: Decimal, min: Decimal },
    #[error("amount {amount} above maximum bet {max}")]
    AboveMaxBet { amount: Decimal, max: Decimal },
    #[error(transparent)]
    State(#[from] StateError),
    #[error("execution bridge failed: {0}")]
    Bridge(String),
}

/// Surface through which trades are reflected externally (browser or UI)
/// before the local mutation. Implementations must complete synchronously.
pub trait ExecutionBridge: Send + Sync {
    fn click_buy(&self, amount: Decimal) -> anyhow::Result<()>;
    fn click_sell(&self, percent: Decimal) -> anyhow::Result<()>;
    fn click_sidebet(&self, amount: Decimal) -> anyhow::Result<()>;
    /// Pre-stage the next bet amount in the external UI.
    fn stage_next_amount(&self, amount: Decimal) -> anyhow::Result<()>;
}

pub struct TradeManager {
    game_state: Arc<GameState>,
    bus: Arc<EventBus>,
    bridge: Option<Arc<dyn ExecutionBridge>>,
    min_bet: Decimal,
    max_bet: Decimal,
}

impl TradeManager {
    pub fn new(game_state: Arc<GameState>, bus: Arc<EventBus>) -> Self {
        Self {
            game_state,
            bus,
            bridge: None,
            min_bet: DEFAULT_MIN_BET,
            max_bet: DEFAULT_MAX_BET,
        }
    }

    pub fn with_bridge(mut self, bridge: Arc<dyn ExecutionBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_limits(mut self, min_bet: Decimal, max_bet: Decimal) -> Self {
        self.min_bet = min_bet;
        self.max_bet = max_bet;
        self
    }

    pub fn execute_buy(&self, amount: Decimal) -> Result<TradeEvent, TradeError> {
        let snapshot = self.game_state.snapshot();
        self.check_phase("buy", snapshot.phase)?;
        self.check_amount("buy", amount)?;

        if let Some(bridge) = &self.bridge {
            bridge
                .click_buy(amount)
                .map_err(|e| self.bridge_failure("buy", e))?;
        }

        self.game_state
            .open_position(snapshot.current_price, amount, snapshot.current_tick)
            .map_err(|e| self.rejected("buy", e))?;

        let event = TradeEvent {
            trade_id: Uuid::new_v4().to_string(),
            game_id: snapshot.game_id,
            tick: snapshot.current_tick,
            price: snapshot.current_price,
            amount,
            partial: false,
            percentage: None,
            remaining_amount: None,
            pnl_sol: None,
            pnl_percent: None,
        };
        info!(trade_id = %event.trade_id, %amount, price = %event.price, "buy executed");
        let _ = self.bus.publish(BusEvent::TradeBuy(event.clone()));
        Ok(event)
    }

    /// Sell using the currently selected percentage: 1.0 closes the whole
    /// position, anything else reduces it proportionally.
    pub fn execute_sell(&self) -> Result<TradeEvent, TradeError> {
        let snapshot = self.game_state.snapshot();
        self.check_phase("sell", snapshot.phase)?;
        let percentage = snapshot.sell_percentage;

        if let Some(bridge) = &self.bridge {
            bridge
                .click_sell(percentage)
                .map_err(|e| self.bridge_failure("sell", e))?;
        }

        let event = if percentage == dec!(1.00) {
            let close = self
                .game_state
                .close_position(snapshot.current_price, snapshot.current_tick)
                .map_err(|e| self.rejected("sell", e))?;
            TradeEvent {
                trade_id: Uuid::new_v4().to_string(),
                game_id: snapshot.game_id,
                tick: snapshot.current_tick,
                price: snapshot.current_price,
                amount: close.amount,
                partial: false,
                percentage: Some(percentage),
                remaining_amount: Some(Decimal::ZERO),
                pnl_sol: Some(close.pnl_sol),
                pnl_percent: Some(close.pnl_percent),
            }
        } else {
            let reduce = self
                .game_state
                .reduce_position(percentage, snapshot.current_price, snapshot.current_tick)
                .map_err(|e| self.rejected("sell", e))?;
            TradeEvent {
                trade_id: Uuid::new_v4().to_string(),
                game_id: snapshot.game_id,
                tick: snapshot.current_tick,
                price: snapshot.current_price,
                amount: reduce.amount_sold,
                partial: true,
                percentage: Some(percentage),
                remaining_amount: Some(reduce.remaining_amount),
                pnl_sol: Some(reduce.pnl_sol),
                pnl_percent: Some(reduce.pnl_percent),
            }
        };

        info!(
            trade_id = %event.trade_id,
            partial = event.partial,
            %percentage,
            "sell executed"
        );
        let _ = self.bus.publish(BusEvent::TradeSell(event.clone()));
        Ok(event)
    }

    pub fn execute_sidebet(&self, amount: Decimal) -> Result<TradeEvent, TradeError> {
        let snapshot = self.game_state.snapshot();
        self.check_phase("sidebet", snapshot.phase)?;
        self.check_amount("sidebet", amount)?;

        if let Some(bridge) = &self.bridge {
            bridge
                .click_sidebet(amount)
                .map_err(|e| self.bridge_failure("sidebet", e))?;
        }

        self.game_state
            .place_sidebet(amount, snapshot.current_tick, SIDEBET_WINDOW_TICKS)
            .map_err(|e| self.rejected("sidebet", e))?;

        let event = TradeEvent {
            trade_id: Uuid::new_v4().to_string(),
            game_id: snapshot.game_id,
            tick: snapshot.current_tick,
            price: snapshot.current_price,
            amount,
            partial: false,
            percentage: None,
            remaining_amount: None,
            pnl_sol: None,
            pnl_percent: None,
        };
        info!(trade_id = %event.trade_id, %amount, "sidebet placed");
        let _ = self.bus.publish(BusEvent::TradeSidebet(event.clone()));
        Ok(event)
    }

    fn check_phase(&self, action: &str, phase: Phase) -> Result<(), TradeError> {
        if phase.is_blocked_for_trading() {
            let error = TradeError::PhaseBlocked(phase);
            warn!(action, %phase, "trade rejected: blocked phase");
            let _ = self.bus.publish(BusEvent::TradeFailed {
                action: action.to_string(),
                reason: error.to_string(),
            });
            return Err(error);
        }
        Ok(())
    }

    fn check_amount(&self, action: &str, amount: Decimal) -> Result<(), TradeError> {
        let error = if amount < self.min_bet {
            Some(TradeError::BelowMinBet {
                amount,
                min: self.min_bet,
            })
        } else if amount > self.max_bet {
            Some(TradeError::AboveMaxBet {
                amount,
                max: self.max_bet,
            })
        } else {
            None
        };
        if let Some(error) = error {
            warn!(action, %amount, "trade rejected: {error}");
            let _ = self.bus.publish(BusEvent::TradeFailed {
                action: action.to_string(),
                reason: error.to_string(),
            });
            return Err(error);
        }
        Ok(())
    }

    fn rejected(&self, action: &str, error: StateError) -> TradeError {
        warn!(action, "trade rejected: {error}");
        let _ = self.bus.publish(BusEvent::TradeFailed {
            action: action.to_string(),
            reason: error.to_string(),
        });
        TradeError::State(error)
    }

    fn bridge_failure(&self, action: &str, error: anyhow::Error) -> TradeError {
        warn!(action, error = %error, "execution bridge failed");
        let _ = self.bus.publish(BusEvent::TradeFailed {
            action: action.to_string(),
            reason: error.to_string(),
        });
        TradeError::Bridge(error.to_string())
    }
}
