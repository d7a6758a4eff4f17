// =============================================================================
// Server-truth reconciler — compare local state against upstream truth
// =============================================================================
//
// POLICY: drift is logged and flagged, never auto-corrected. The server
// view is authoritative for display; the local view stays authoritative for
// pre-trade validation so that latency cannot cause false rejects.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actions::ActionTracker;
use crate::bus::{EventBus, SubscriptionHandle};
use crate::events::{BusEvent, EventKind};
use crate::game_state::GameState;
use crate::types::{PlayerUpdate, UsernameStatus};

/// Maximum acceptable disagreement before a drift warning.
pub const DEFAULT_DRIFT_TOLERANCE: Decimal = dec!(0.000001);

/// Server-authoritative view of the player, exposed atomically.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerState {
    pub balance: Decimal,
    pub position_qty: Decimal,
    pub avg_cost: Decimal,
    pub cumulative_pnl: Decimal,
    pub total_invested: Decimal,
    pub player_id: Option<String>,
    pub username: Option<String>,
}

impl ServerState {
    pub fn is_authenticated(&self) -> bool {
        self.player_id.is_some()
    }
}

/// Result of one comparison pass.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub balance_drift: Decimal,
    pub position_drift: Decimal,
    pub within_tolerance: bool,
}

pub struct Reconciler {
    server: RwLock<ServerState>,
    game_state: Arc<GameState>,
    tracker: Arc<ActionTracker>,
    tolerance: Decimal,
}

impl Reconciler {
    pub fn new(game_state: Arc<GameState>, tracker: Arc<ActionTracker>) -> Self {
        Self {
            server: RwLock::new(ServerState::default()),
            game_state,
            tracker,
            tolerance: DEFAULT_DRIFT_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Decimal) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn server_state(&self) -> ServerState {
        self.server.read().clone()
    }

    /// Strong subscriptions for the authenticated events.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Vec<SubscriptionHandle> {
        let mut handles = Vec::new();
        let reconciler = Arc::clone(self);
        handles.push(bus.subscribe_strong(EventKind::PlayerIdentity, move |event| {
            if let BusEvent::PlayerIdentity(status) = event {
                reconciler.on_identity(status);
            }
        }));
        let reconciler = Arc::clone(self);
        handles.push(bus.subscribe_strong(EventKind::PlayerUpdated, move |event| {
            if let BusEvent::PlayerUpdated(update) = event {
                reconciler.on_player_update(update);
            }
        }));
        handles
    }

    pub fn on_identity(&self, status: &UsernameStatus) {
        if !status.is_authenticated() {
            warn!("usernameStatus without an id: session is unauthenticated");
            return;
        }
        let mut server = self.server.write();
        server.player_id = Some(status.id.clone());
        server.username = status.username.clone();
        info!(player_id = %status.id, username = %status.display_name(), "server identity updated");
    }

    /// Fold an authenticated `playerUpdate` into the server view and
    /// compare it against locally computed state.
    pub fn on_player_update(&self, update: &PlayerUpdate) -> DriftReport {
        {
            let mut server = self.server.write();
            server.balance = update.cash;
            server.position_qty = update.position_qty;
            server.avg_cost = update.avg_cost;
            server.cumulative_pnl = update.cumulative_pnl;
            server.total_invested = update.total_invested;
        }

        let local = self.game_state.snapshot();
        let local_position = local
            .position
            .as_ref()
            .filter(|p| p.open)
            .map(|p| p.amount)
            .unwrap_or(Decimal::ZERO);

        let balance_drift = (update.cash - local.balance).abs();
        let position_drift = (update.position_qty - local_position).abs();
        let within_tolerance =
            balance_drift <= self.tolerance && position_drift <= self.tolerance;

        if within_tolerance {
            debug!(%balance_drift, %position_drift, "server truth matches local state");
        } else {
            warn!(
                server_balance = %update.cash,
                local_balance = %local.balance,
                server_position = %update.position_qty,
                local_position = %local_position,
                "server truth drifted from local state"
            );
            // An in-flight action gets labelled so the discrepancy is
            // visible in the recorded data.
            self.tracker.flag_drift();
        }

        DriftReport {
            balance_drift,
            position_drift,
            within_tolerance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(balance: Decimal) -> (Arc<GameState>, Arc<Reconciler>) {
        let bus = Arc::new(EventBus::new(1_000));
        let game_state = Arc::new(GameState::new(bus, balance));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&game_state),
            Arc::new(ActionTracker::new()),
        ));
        (game_state, reconciler)
    }

    fn update(cash: Decimal, position_qty: Decimal) -> PlayerUpdate {
        PlayerUpdate {
            cash,
            position_qty,
            ..Default::default()
        }
    }

    #[test]
    fn identity_requires_id() {
        let (_state, reconciler) = setup(dec!(1.0));
        reconciler.on_identity(&UsernameStatus::default());
        assert!(!reconciler.server_state().is_authenticated());

        reconciler.on_identity(&UsernameStatus {
            id: "did:privy:abc".into(),
            username: Some("Dutch".into()),
            has_username: true,
        });
        let server = reconciler.server_state();
        assert!(server.is_authenticated());
        assert_eq!(server.username.as_deref(), Some("Dutch"));
    }

    #[test]
    fn matching_state_is_within_tolerance() {
        let (_state, reconciler) = setup(dec!(1.0));
        let report = reconciler.on_player_update(&update(dec!(1.0), Decimal::ZERO));
        assert!(report.within_tolerance);
        assert_eq!(report.balance_drift, Decimal::ZERO);
    }

    #[test]
    fn drift_beyond_tolerance_is_reported() {
        let (_state, reconciler) = setup(dec!(1.0));
        let report = reconciler.on_player_update(&update(dec!(0.9), Decimal::ZERO));
        assert!(!report.within_tolerance);
        assert_eq!(report.balance_drift, dec!(0.1));
        // Server view updated regardless.
        assert_eq!(reconciler.server_state().balance, dec!(0.9));
    }

    #[test]
    fn position_compared_against_open_amount() {
        let (state, reconciler) = setup(dec!(1.0));
        state.open_position(dec!(1.0), dec!(0.25), 5).unwrap();
        let report = reconciler.on_player_update(&update(dec!(0.75), dec!(0.25)));
        assert!(report.within_tolerance);
    }

    #[test]
    fn sub_tolerance_noise_is_accepted() {
        let (_state, reconciler) = setup(dec!(1.0));
        let report = reconciler.on_player_update(&update(dec!(1.0000000001), Decimal::ZERO));
        assert!(report.within_tolerance);
    }
}
