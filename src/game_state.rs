// =============================================================================
// Game State — thread-safe wallet, position, and sidebet container
// =============================================================================
//
// The single local source of truth the strategy trades against. Mutators
// are serialized by one lock; each publishes its state-change event while
// still holding the lock (publish only enqueues), so bus order always
// matches mutation order. A rejected call mutates nothing.
//
// Money rules:
//   - everything is `Decimal`; no floats past the wire boundary
//   - balance can never go negative
//   - at most one open position, at most one unresolved sidebet
//   - partial sells only in the fixed fraction set; a full exit uses close
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::bus::EventBus;
use crate::events::{BusEvent, PhaseTransition, SellPercentageChange, SidebetResolution, TradeEvent};
use crate::types::{GameSignal, Phase};

/// The only sell fractions the upstream UI exposes. Downstream analytics
/// depend on this exact set; do not broaden it.
pub const SELL_PERCENTAGES: [Decimal; 4] = [dec!(0.10), dec!(0.25), dec!(0.50), dec!(1.00)];

/// Sidebet pays 5x the stake back on a win (4x net profit).
pub const SIDEBET_PAYOUT_MULTIPLIER: Decimal = dec!(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("a position is already open")]
    AlreadyHasPosition,
    #[error("no open position")]
    NoOpenPosition,
    #[error("sell percentage {0} is not one of the allowed fractions")]
    InvalidSellPercentage(Decimal),
    #[error("full exit must use close_position, not a partial reduce")]
    UseCloseForFullExit,
    #[error("an unresolved sidebet already exists")]
    SidebetPending,
    #[error("no unresolved sidebet")]
    NoSidebetPending,
    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },
    #[error("amount must be positive")]
    NonPositiveAmount,
}

/// An open or closed long position. Amount is the staked quantity in SOL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub entry_price: Decimal,
    pub amount: Decimal,
    pub entry_tick: u64,
    pub open: bool,
    #[serde(default)]
    pub exit_price: Option<Decimal>,
    #[serde(default)]
    pub exit_tick: Option<u64>,
}

/// A fixed-window rug bet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidebet {
    pub amount: Decimal,
    pub start_tick: u64,
    pub target_ticks: u32,
    pub resolved: bool,
    pub won: Option<bool>,
}

impl Sidebet {
    /// Last tick (inclusive) at which a rug still wins this bet.
    pub fn window_end(&self) -> u64 {
        self.start_tick + self.target_ticks as u64
    }
}

/// Immutable copy handed to read-only consumers.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub balance: Decimal,
    pub current_tick: u64,
    pub current_price: Decimal,
    pub phase: Phase,
    pub game_id: String,
    pub position: Option<Position>,
    pub sidebet: Option<Sidebet>,
    pub sell_percentage: Decimal,
}

/// Outcome payload for a partial position reduction.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReduceResult {
    pub percentage: Decimal,
    pub amount_sold: Decimal,
    pub remaining_amount: Decimal,
    pub proceeds: Decimal,
    pub pnl_sol: Decimal,
    pub pnl_percent: Decimal,
}

/// Outcome payload for a full close.
#[derive(Debug, Clone, Serialize)]
pub struct CloseResult {
    pub amount: Decimal,
    pub proceeds: Decimal,
    pub pnl_sol: Decimal,
    pub pnl_percent: Decimal,
}

/// Partial mutation applied by `update`.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub tick: Option<u64>,
    pub price: Option<Decimal>,
    pub phase: Option<Phase>,
    pub game_id: Option<String>,
}

struct StateInner {
    balance: Decimal,
    current_tick: u64,
    current_price: Decimal,
    phase: Phase,
    game_id: String,
    position: Option<Position>,
    sidebet: Option<Sidebet>,
    sell_percentage: Decimal,
}

pub struct GameState {
    inner: Mutex<StateInner>,
    bus: Arc<EventBus>,
}

impl GameState {
    pub fn new(bus: Arc<EventBus>, initial_balance: Decimal) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                balance: initial_balance,
                current_tick: 0,
                current_price: Decimal::ONE,
                phase: Phase::Unknown,
                game_id: String::new(),
                position: None,
                sidebet: None,
                sell_percentage: dec!(1.00),
            }),
            bus,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock();
        StateSnapshot {
            balance: inner.balance,
            current_tick: inner.current_tick,
            current_price: inner.current_price,
            phase: inner.phase,
            game_id: inner.game_id.clone(),
            position: inner.position.clone(),
            sidebet: inner.sidebet.clone(),
            sell_percentage: inner.sell_percentage,
        }
    }

    pub fn balance(&self) -> Decimal {
        self.inner.lock().balance
    }

    pub fn sell_percentage(&self) -> Decimal {
        self.inner.lock().sell_percentage
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    /// Apply a partial update. Emits `TickUpdated` when tick or price moved
    /// and `PhaseChanged` when the phase moved. An expired sidebet window is
    /// resolved (lost) on the tick that crosses it.
    pub fn update(&self, patch: StatePatch) {
        let mut inner = self.inner.lock();
        let mut tick_moved = false;

        if let Some(game_id) = patch.game_id {
            inner.game_id = game_id;
        }
        if let Some(tick) = patch.tick {
            tick_moved = tick != inner.current_tick;
            inner.current_tick = tick;
        }
        if let Some(price) = patch.price {
            tick_moved |= price != inner.current_price;
            inner.current_price = price;
        }
        if let Some(phase) = patch.phase {
            if phase != inner.phase {
                let transition = PhaseTransition {
                    game_id: inner.game_id.clone(),
                    previous: inner.phase,
                    current: phase,
                    tick: inner.current_tick,
                };
                inner.phase = phase;
                let _ = self.bus.publish(BusEvent::PhaseChanged(transition));
            }
        }

        if tick_moved {
            let _ = self.bus.publish(BusEvent::TickUpdated {
                tick: inner.current_tick,
                price: inner.current_price,
            });
        }

        // Window expiry: resolved as lost on the first tick past the end.
        let expired = inner
            .sidebet
            .as_ref()
            .map(|s| !s.resolved && inner.current_tick > s.window_end())
            .unwrap_or(false);
        if expired {
            let resolve_tick = inner.current_tick;
            self.resolve_sidebet_locked(&mut inner, resolve_tick, false);
        }
    }

    /// Fold a classified broadcast signal into local state. On the rug
    /// frame, an open position is liquidated at zero and an in-window
    /// sidebet resolves as won.
    pub fn apply_signal(&self, signal: &GameSignal, game_completed: bool) {
        self.update(StatePatch {
            tick: Some(signal.tick),
            price: Some(signal.price),
            phase: Some(signal.phase),
            game_id: Some(signal.game_id.clone()),
        });

        if game_completed {
            let mut inner = self.inner.lock();

            let in_window = inner
                .sidebet
                .as_ref()
                .map(|s| !s.resolved && signal.tick <= s.window_end())
                .unwrap_or(false);
            if in_window {
                self.resolve_sidebet_locked(&mut inner, signal.tick, true);
            }

            if inner.position.as_ref().map(|p| p.open).unwrap_or(false) {
                // Position value goes to ~0 on a rug; realize the loss.
                let _ = self.close_position_locked(&mut inner, Decimal::ZERO, signal.tick);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Position lifecycle
    // -------------------------------------------------------------------------

    pub fn open_position(
        &self,
        entry_price: Decimal,
        amount: Decimal,
        entry_tick: u64,
    ) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        if amount <= Decimal::ZERO {
            return Err(StateError::NonPositiveAmount);
        }
        if inner.position.as_ref().map(|p| p.open).unwrap_or(false) {
            return Err(StateError::AlreadyHasPosition);
        }
        if inner.balance < amount {
            return Err(StateError::InsufficientBalance {
                required: amount,
                available: inner.balance,
            });
        }

        inner.balance -= amount;
        inner.position = Some(Position {
            entry_price,
            amount,
            entry_tick,
            open: true,
            exit_price: None,
            exit_tick: None,
        });
        info!(%entry_price, %amount, entry_tick, "position opened");
        Ok(())
    }

    /// Proportionally close `percentage` of the open position. Only the
    /// partial fractions are accepted; 1.0 must go through `close_position`.
    pub fn reduce_position(
        &self,
        percentage: Decimal,
        exit_price: Decimal,
        exit_tick: u64,
    ) -> Result<ReduceResult, StateError> {
        if percentage == dec!(1.00) {
            return Err(StateError::UseCloseForFullExit);
        }
        if !SELL_PERCENTAGES.contains(&percentage) {
            return Err(StateError::InvalidSellPercentage(percentage));
        }

        let mut inner = self.inner.lock();
        let position = match inner.position.as_mut() {
            Some(p) if p.open => p,
            _ => return Err(StateError::NoOpenPosition),
        };

        let amount_sold = position.amount * percentage;
        let entry_price = position.entry_price;
        position.amount -= amount_sold;
        let remaining_amount = position.amount;

        let proceeds = if entry_price > Decimal::ZERO {
            amount_sold * exit_price / entry_price
        } else {
            Decimal::ZERO
        };
        let pnl_sol = proceeds - amount_sold;
        let pnl_percent = if entry_price > Decimal::ZERO {
            (exit_price - entry_price) / entry_price * dec!(100)
        } else {
            Decimal::ZERO
        };

        inner.balance += proceeds;

        let result = ReduceResult {
            percentage,
            amount_sold,
            remaining_amount,
            proceeds,
            pnl_sol,
            pnl_percent,
        };
        let _ = self.bus.publish(BusEvent::PositionReduced(TradeEvent {
            trade_id: String::new(),
            game_id: inner.game_id.clone(),
            tick: exit_tick,
            price: exit_price,
            amount: amount_sold,
            partial: true,
            percentage: Some(percentage),
            remaining_amount: Some(remaining_amount),
            pnl_sol: Some(pnl_sol),
            pnl_percent: Some(pnl_percent),
        }));
        info!(%percentage, %amount_sold, %remaining_amount, %pnl_sol, "position reduced");
        Ok(result)
    }

    pub fn close_position(
        &self,
        exit_price: Decimal,
        exit_tick: u64,
    ) -> Result<CloseResult, StateError> {
        let mut inner = self.inner.lock();
        self.close_position_locked(&mut inner, exit_price, exit_tick)
    }

    fn close_position_locked(
        &self,
        inner: &mut StateInner,
        exit_price: Decimal,
        exit_tick: u64,
    ) -> Result<CloseResult, StateError> {
        let position = match inner.position.as_mut() {
            Some(p) if p.open => p,
            _ => return Err(StateError::NoOpenPosition),
        };

        let amount = position.amount;
        let entry_price = position.entry_price;
        let proceeds = if entry_price > Decimal::ZERO {
            amount * exit_price / entry_price
        } else {
            Decimal::ZERO
        };
        let pnl_sol = proceeds - amount;
        let pnl_percent = if entry_price > Decimal::ZERO {
            (exit_price - entry_price) / entry_price * dec!(100)
        } else {
            Decimal::ZERO
        };

        position.open = false;
        position.amount = Decimal::ZERO;
        position.exit_price = Some(exit_price);
        position.exit_tick = Some(exit_tick);
        inner.balance += proceeds;

        info!(%amount, %exit_price, %pnl_sol, "position closed");
        Ok(CloseResult {
            amount,
            proceeds,
            pnl_sol,
            pnl_percent,
        })
    }

    // -------------------------------------------------------------------------
    // Sidebet lifecycle
    // -------------------------------------------------------------------------

    pub fn place_sidebet(
        &self,
        amount: Decimal,
        start_tick: u64,
        target_ticks: u32,
    ) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        if amount <= Decimal::ZERO {
            return Err(StateError::NonPositiveAmount);
        }
        if inner.sidebet.as_ref().map(|s| !s.resolved).unwrap_or(false) {
            return Err(StateError::SidebetPending);
        }
        if inner.balance < amount {
            return Err(StateError::InsufficientBalance {
                required: amount,
                available: inner.balance,
            });
        }

        inner.balance -= amount;
        inner.sidebet = Some(Sidebet {
            amount,
            start_tick,
            target_ticks,
            resolved: false,
            won: None,
        });
        info!(%amount, start_tick, target_ticks, "sidebet placed");
        Ok(())
    }

    pub fn resolve_sidebet(&self, resolve_tick: u64, won: bool) -> Result<(), StateError> {
        let mut inner = self.inner.lock();
        if !inner.sidebet.as_ref().map(|s| !s.resolved).unwrap_or(false) {
            return Err(StateError::NoSidebetPending);
        }
        self.resolve_sidebet_locked(&mut inner, resolve_tick, won);
        Ok(())
    }

    fn resolve_sidebet_locked(&self, inner: &mut StateInner, resolve_tick: u64, won: bool) {
        let Some(sidebet) = inner.sidebet.as_mut() else {
            return;
        };
        sidebet.resolved = true;
        sidebet.won = Some(won);
        let amount = sidebet.amount;
        let start_tick = sidebet.start_tick;

        let payout = if won {
            amount * SIDEBET_PAYOUT_MULTIPLIER
        } else {
            Decimal::ZERO
        };
        inner.balance += payout;

        let _ = self.bus.publish(BusEvent::SidebetResolved(SidebetResolution {
            amount,
            start_tick,
            resolve_tick,
            won,
            payout,
        }));
        info!(%amount, won, %payout, "sidebet resolved");
    }

    // -------------------------------------------------------------------------
    // Sell percentage
    // -------------------------------------------------------------------------

    pub fn set_sell_percentage(&self, percentage: Decimal) -> Result<(), StateError> {
        if !SELL_PERCENTAGES.contains(&percentage) {
            return Err(StateError::InvalidSellPercentage(percentage));
        }
        let mut inner = self.inner.lock();
        if inner.sell_percentage == percentage {
            return Ok(());
        }
        let old = inner.sell_percentage;
        inner.sell_percentage = percentage;
        let _ = self
            .bus
            .publish(BusEvent::SellPercentageChanged(SellPercentageChange {
                old,
                new: percentage,
            }));
        debug!(%old, new = %percentage, "sell percentage changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::epoch_ms_now;

    fn state_with_balance(balance: Decimal) -> GameState {
        // Bus intentionally not started: publishes only enqueue.
        GameState::new(Arc::new(EventBus::new(10_000)), balance)
    }

    fn signal(game_id: &str, tick: u64, price: Decimal, phase: Phase, rugged: bool) -> GameSignal {
        GameSignal {
            game_id: game_id.into(),
            active: phase == Phase::ActiveGameplay,
            rugged,
            tick,
            price,
            cooldown_timer: 0,
            allow_pre_round_buys: false,
            trade_count: 0,
            phase,
            is_valid: true,
            timestamp_ms: epoch_ms_now(),
            latency_ms: 0.0,
        }
    }

    #[test]
    fn open_rejects_second_position() {
        let state = state_with_balance(dec!(1.0));
        state.open_position(dec!(1.0), dec!(0.01), 5).unwrap();
        assert_eq!(
            state.open_position(dec!(1.1), dec!(0.01), 6),
            Err(StateError::AlreadyHasPosition)
        );
    }

    #[test]
    fn open_rejects_insufficient_balance() {
        let state = state_with_balance(dec!(0.005));
        let err = state.open_position(dec!(1.0), dec!(0.01), 5).unwrap_err();
        assert!(matches!(err, StateError::InsufficientBalance { .. }));
        // Rejected call mutates nothing.
        assert_eq!(state.balance(), dec!(0.005));
    }

    #[test]
    fn partial_sell_fifty_percent() {
        let state = state_with_balance(dec!(0.100));
        state.open_position(dec!(1.000), dec!(0.010), 10).unwrap();
        assert_eq!(state.balance(), dec!(0.090));

        let result = state.reduce_position(dec!(0.50), dec!(1.5), 15).unwrap();
        assert_eq!(result.amount_sold, dec!(0.005));
        assert_eq!(result.remaining_amount, dec!(0.005));
        assert_eq!(result.pnl_sol, dec!(0.0025));
        assert_eq!(result.pnl_percent, dec!(50));
        assert_eq!(state.balance(), dec!(0.090) + dec!(0.0075));
    }

    #[test]
    fn partial_sell_at_double_returns_stake_math() {
        let state = state_with_balance(dec!(0.100));
        state.open_position(dec!(1.000), dec!(0.010), 10).unwrap();

        let result = state.reduce_position(dec!(0.50), dec!(2.000), 20).unwrap();
        assert_eq!(result.amount_sold, dec!(0.005));
        assert_eq!(result.proceeds, dec!(0.010));
        // 0.100 - 0.010 + 0.010 = 0.100
        assert_eq!(state.balance(), dec!(0.100));
        assert_eq!(result.pnl_percent, dec!(100));
    }

    #[test]
    fn reduce_rejects_full_and_odd_percentages() {
        let state = state_with_balance(dec!(0.100));
        state.open_position(dec!(1.0), dec!(0.010), 10).unwrap();
        assert_eq!(
            state.reduce_position(dec!(1.00), dec!(2.0), 20),
            Err(StateError::UseCloseForFullExit)
        );
        assert_eq!(
            state.reduce_position(dec!(0.33), dec!(2.0), 20),
            Err(StateError::InvalidSellPercentage(dec!(0.33)))
        );
        // Position untouched by rejected calls.
        assert_eq!(state.snapshot().position.unwrap().amount, dec!(0.010));
    }

    #[test]
    fn position_accounting_across_open_reduce_close() {
        let initial = dec!(1.000);
        let state = state_with_balance(initial);
        state.open_position(dec!(1.0), dec!(0.100), 1).unwrap();

        let r1 = state.reduce_position(dec!(0.25), dec!(2.0), 2).unwrap();
        let r2 = state.reduce_position(dec!(0.10), dec!(4.0), 3).unwrap();
        let close = state.close_position(dec!(3.0), 4).unwrap();

        let proceeds = r1.proceeds + r2.proceeds + close.proceeds;
        let pnl = r1.pnl_sol + r2.pnl_sol + close.pnl_sol;
        assert_eq!(proceeds - dec!(0.100), pnl);
        assert_eq!(state.balance(), initial - dec!(0.100) + proceeds);
        assert!(state.snapshot().position.map(|p| !p.open).unwrap_or(true));
    }

    #[test]
    fn sidebet_win_credits_five_times_stake() {
        let state = state_with_balance(dec!(0.100));
        state.place_sidebet(dec!(0.010), 50, 40).unwrap();
        assert_eq!(state.balance(), dec!(0.090));

        // Rug at tick 80, inside the 40-tick window.
        state.apply_signal(&signal("g1", 80, Decimal::ZERO, Phase::RugEvent1, true), true);

        let snapshot = state.snapshot();
        let sidebet = snapshot.sidebet.unwrap();
        assert!(sidebet.resolved);
        assert_eq!(sidebet.won, Some(true));
        assert_eq!(state.balance(), dec!(0.090) + dec!(0.050));
    }

    #[test]
    fn sidebet_expires_as_lost() {
        let state = state_with_balance(dec!(0.100));
        state.place_sidebet(dec!(0.010), 50, 40).unwrap();

        state.update(StatePatch {
            tick: Some(91),
            ..Default::default()
        });

        let sidebet = state.snapshot().sidebet.unwrap();
        assert!(sidebet.resolved);
        assert_eq!(sidebet.won, Some(false));
        assert_eq!(state.balance(), dec!(0.090));
    }

    #[test]
    fn second_unresolved_sidebet_rejected() {
        let state = state_with_balance(dec!(0.100));
        state.place_sidebet(dec!(0.010), 50, 40).unwrap();
        assert_eq!(
            state.place_sidebet(dec!(0.010), 51, 40),
            Err(StateError::SidebetPending)
        );
        // After resolution a new bet is allowed again.
        state.resolve_sidebet(90, false).unwrap();
        state.place_sidebet(dec!(0.010), 95, 40).unwrap();
    }

    #[test]
    fn rug_liquidates_open_position() {
        let state = state_with_balance(dec!(0.100));
        state.open_position(dec!(1.0), dec!(0.010), 10).unwrap();
        state.apply_signal(&signal("g1", 80, Decimal::ZERO, Phase::RugEvent1, true), true);

        let snapshot = state.snapshot();
        assert!(!snapshot.position.unwrap().open);
        // Entry cost is gone, nothing came back.
        assert_eq!(state.balance(), dec!(0.090));
    }

    #[test]
    fn sell_percentage_validation_and_event() {
        let state = state_with_balance(dec!(0.100));
        assert_eq!(state.sell_percentage(), dec!(1.00));
        for pct in SELL_PERCENTAGES {
            state.set_sell_percentage(pct).unwrap();
            assert_eq!(state.sell_percentage(), pct);
        }
        for pct in [dec!(0.05), dec!(0.33), dec!(0.75), dec!(2.0)] {
            assert_eq!(
                state.set_sell_percentage(pct),
                Err(StateError::InvalidSellPercentage(pct))
            );
        }
    }
}
