// =============================================================================
// Action telemetry — button presses grouped into trade attempt sequences
// =============================================================================
//
// Every press on the execution surface is recorded as a `ButtonEvent`.
// Related presses (bet adjustments, percentage selection, then the action
// itself) share a `sequence_id`; the sequence is sealed when its trade
// resolves or the game ends. Sealed sequences carry the realized outcome,
// which downstream analytics consume as labels.
//
// Outcome rules:
//   - sidebet resolved by a rug inside its window: WON, pnl = 4x stake
//   - sidebet window expired:                      LOST, pnl = -stake
//   - open position at the rug:                    LIQUIDATED, pnl = -stake
//   - otherwise profit / loss / break-even by realized pnl sign
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::types::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonCategory {
    /// Buy, sell, sidebet.
    Action,
    /// Bet amount up/down or pre-staged amounts.
    BetAdjust,
    /// Sell percentage selection.
    Percentage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalAction {
    Buy,
    Sell,
    Sidebet,
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeOutcome {
    Pending,
    Profit,
    Loss,
    Liquidated,
    BreakEven,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SidebetOutcome {
    Pending,
    Won,
    Lost,
}

/// One press on the execution surface, with the game context at press time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonEvent {
    pub ts: u64,
    #[serde(default)]
    pub server_ts: Option<u64>,
    pub button_id: String,
    pub category: ButtonCategory,
    pub tick: u64,
    pub price: Decimal,
    pub phase: Phase,
    pub game_id: String,
    pub balance: Decimal,
    pub position_qty: Decimal,
    pub bet_amount: Decimal,
    pub ticks_since_last_action: Option<u64>,
    pub sequence_id: String,
    pub sequence_position: u32,
    #[serde(default)]
    pub execution_tick: Option<u64>,
    #[serde(default)]
    pub execution_price: Option<Decimal>,
    #[serde(default)]
    pub trade_id: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub time_in_position: Option<u64>,
    /// Set when server truth disagreed with local state while this press
    /// was in flight.
    #[serde(default)]
    pub drift_detected: bool,
}

/// Context captured at press time, supplied by the caller.
#[derive(Debug, Clone)]
pub struct PressContext {
    pub button_id: String,
    pub category: ButtonCategory,
    pub tick: u64,
    pub price: Decimal,
    pub phase: Phase,
    pub game_id: String,
    pub balance: Decimal,
    pub position_qty: Decimal,
    pub bet_amount: Decimal,
    pub trade_id: Option<String>,
}

/// A trade attempt: ordered presses, sealed with a realized outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSequence {
    pub sequence_id: String,
    pub button_events: Vec<ButtonEvent>,
    pub final_action: FinalAction,
    pub success: bool,
    #[serde(default)]
    pub executed_price: Option<Decimal>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    pub trade_outcome: TradeOutcome,
    pub sidebet_outcome: SidebetOutcome,
    pub was_rugged: bool,
    pub pnl_amount: Decimal,
    pub pnl_percent: Decimal,
    pub sealed: bool,
}

impl ActionSequence {
    fn new(sequence_id: String) -> Self {
        Self {
            sequence_id,
            button_events: Vec::new(),
            final_action: FinalAction::Incomplete,
            success: false,
            executed_price: None,
            latency_ms: None,
            trade_outcome: TradeOutcome::Pending,
            sidebet_outcome: SidebetOutcome::Pending,
            was_rugged: false,
            pnl_amount: Decimal::ZERO,
            pnl_percent: Decimal::ZERO,
            sealed: false,
        }
    }

    /// Stake of the action press, if one was recorded.
    fn stake(&self) -> Decimal {
        self.button_events
            .iter()
            .rev()
            .find(|e| e.category == ButtonCategory::Action)
            .map(|e| e.bet_amount)
            .unwrap_or(Decimal::ZERO)
    }
}

struct TrackerInner {
    /// Sequence currently accumulating presses, if any.
    current: Option<ActionSequence>,
    sealed: Vec<ActionSequence>,
    /// trade_id -> sequence_id awaiting server confirmation.
    pending_trades: HashMap<String, String>,
    last_action_tick: Option<u64>,
}

/// Thread-safe sequence tracker. One per session.
pub struct ActionTracker {
    inner: Mutex<TrackerInner>,
}

impl ActionTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                current: None,
                sealed: Vec::new(),
                pending_trades: HashMap::new(),
                last_action_tick: None,
            }),
        }
    }

    /// Record one press. Adjustment presses accumulate; an action press
    /// assigns the sequence's final action. Returns the press as recorded.
    pub fn record_press(&self, context: PressContext) -> ButtonEvent {
        let mut inner = self.inner.lock();
        let ticks_since_last_action = inner
            .last_action_tick
            .map(|last| context.tick.saturating_sub(last));

        let (sequence_id, sequence_position) = {
            let sequence = inner
                .current
                .get_or_insert_with(|| ActionSequence::new(Uuid::new_v4().to_string()));
            (
                sequence.sequence_id.clone(),
                sequence.button_events.len() as u32,
            )
        };

        let event = ButtonEvent {
            ts: crate::types::epoch_ms_now(),
            server_ts: None,
            button_id: context.button_id.clone(),
            category: context.category,
            tick: context.tick,
            price: context.price,
            phase: context.phase,
            game_id: context.game_id,
            balance: context.balance,
            position_qty: context.position_qty,
            bet_amount: context.bet_amount,
            ticks_since_last_action,
            sequence_id,
            sequence_position,
            execution_tick: None,
            execution_price: None,
            trade_id: context.trade_id.clone(),
            latency_ms: None,
            time_in_position: None,
            drift_detected: false,
        };

        if let Some(sequence) = inner.current.as_mut() {
            sequence.button_events.push(event.clone());
            if context.category == ButtonCategory::Action {
                sequence.final_action = match context.button_id.as_str() {
                    id if id.contains("buy") => FinalAction::Buy,
                    id if id.contains("sell") => FinalAction::Sell,
                    id if id.contains("sidebet") => FinalAction::Sidebet,
                    _ => FinalAction::Incomplete,
                };
                sequence.success = true;
            }
        }

        // The action press closes the accumulation window; the sequence now
        // waits for its resolution.
        if context.category == ButtonCategory::Action {
            if let Some(finished) = inner.current.take() {
                if let Some(trade_id) = &context.trade_id {
                    inner
                        .pending_trades
                        .insert(trade_id.clone(), finished.sequence_id.clone());
                }
                inner.sealed.push(finished);
            }
            inner.last_action_tick = Some(context.tick);
        }

        event
    }

    /// Server echoed a `newTrade` for a previously submitted action; attach
    /// execution details.
    pub fn on_trade_confirmed(
        &self,
        trade_id: &str,
        execution_price: Decimal,
        execution_tick: u64,
        server_ts: Option<u64>,
    ) {
        let mut inner = self.inner.lock();
        let Some(sequence_id) = inner.pending_trades.remove(trade_id) else {
            debug!(trade_id, "trade echo without a matching sequence");
            return;
        };
        if let Some(sequence) = inner
            .sealed
            .iter_mut()
            .find(|s| s.sequence_id == sequence_id)
        {
            sequence.executed_price = Some(execution_price);
            if let Some(event) = sequence.button_events.last_mut() {
                event.execution_price = Some(execution_price);
                event.execution_tick = Some(execution_tick);
                event.server_ts = server_ts;
                if let Some(server_ts) = server_ts {
                    event.latency_ms = Some(server_ts.saturating_sub(event.ts) as f64);
                }
            }
        }
    }

    /// A sell realized pnl; label its sequence.
    pub fn on_trade_closed(&self, pnl_amount: Decimal, pnl_percent: Decimal) {
        let mut inner = self.inner.lock();
        if let Some(sequence) = inner
            .sealed
            .iter_mut()
            .rev()
            .find(|s| s.final_action == FinalAction::Buy && s.trade_outcome == TradeOutcome::Pending)
        {
            sequence.pnl_amount = pnl_amount;
            sequence.pnl_percent = pnl_percent;
            sequence.trade_outcome = if pnl_amount > Decimal::ZERO {
                TradeOutcome::Profit
            } else if pnl_amount < Decimal::ZERO {
                TradeOutcome::Loss
            } else {
                TradeOutcome::BreakEven
            };
        }
    }

    /// A sidebet resolved; label its sequence.
    pub fn on_sidebet_resolved(&self, won: bool) {
        let mut inner = self.inner.lock();
        if let Some(sequence) = inner.sealed.iter_mut().rev().find(|s| {
            s.final_action == FinalAction::Sidebet && s.sidebet_outcome == SidebetOutcome::Pending
        }) {
            let stake = sequence.stake();
            if won {
                sequence.sidebet_outcome = SidebetOutcome::Won;
                sequence.pnl_amount = stake * dec!(4);
                sequence.pnl_percent = dec!(400);
            } else {
                sequence.sidebet_outcome = SidebetOutcome::Lost;
                sequence.pnl_amount = -stake;
                sequence.pnl_percent = dec!(-100);
            }
        }
    }

    /// Server truth disagreed with local state; flag the in-flight press.
    pub fn flag_drift(&self) {
        let mut inner = self.inner.lock();
        let sequence = if inner.current.is_some() {
            inner.current.as_mut()
        } else {
            inner.sealed.last_mut()
        };
        if let Some(sequence) = sequence {
            if let Some(event) = sequence.button_events.last_mut() {
                event.drift_detected = true;
            }
        }
    }

    /// Seal everything still open at the end of a game. Unresolved buys
    /// during a rug are liquidations; a dangling adjustment-only sequence
    /// stays incomplete.
    pub fn seal_game(&self, was_rugged: bool) -> Vec<ActionSequence> {
        let mut inner = self.inner.lock();

        if let Some(mut dangling) = inner.current.take() {
            dangling.sealed = true;
            dangling.was_rugged = was_rugged;
            inner.sealed.push(dangling);
        }

        for sequence in inner.sealed.iter_mut() {
            sequence.sealed = true;
            sequence.was_rugged = was_rugged;
            if was_rugged
                && sequence.final_action == FinalAction::Buy
                && sequence.trade_outcome == TradeOutcome::Pending
            {
                let stake = sequence.stake();
                sequence.trade_outcome = TradeOutcome::Liquidated;
                sequence.pnl_amount = -stake;
                sequence.pnl_percent = dec!(-100);
            }
        }
        inner.pending_trades.clear();
        inner.last_action_tick = None;
        std::mem::take(&mut inner.sealed)
    }
}

/// Persist sealed sequences under `<dir>/<YYYY-MM-DD>/`, one file per
/// sequence. Write failures are logged; telemetry must never take the
/// pipeline down.
pub fn write_sequences(dir: &std::path::Path, sequences: &[ActionSequence]) {
    if sequences.is_empty() {
        return;
    }
    let dated = dir.join(chrono::Utc::now().format("%Y-%m-%d").to_string());
    if let Err(e) = std::fs::create_dir_all(&dated) {
        tracing::warn!(error = %e, "failed to create demonstrations directory");
        return;
    }
    for sequence in sequences {
        let path = dated.join(format!("seq_{}.json", sequence.sequence_id));
        match serde_json::to_vec_pretty(sequence) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(error = %e, path = %path.display(), "failed to write sequence");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize sequence"),
        }
    }
}
