// =============================================================================
// Live-state provider — one atomic view of pipeline health and state
// =============================================================================
//
// Consumers (strategy, host UI) poll `snapshot()`; it is a single pointer
// load, never a lock. The provider task rebuilds the view on a fixed
// cadence from the feed monitors, degradation manager, reconciler, and
// game state. Mode changes already carry hysteresis, so a snapshot is safe
// to act on without additional smoothing.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::feed::ingestor::FeedIngestor;
use crate::game_state::{GameState, StateSnapshot};
use crate::reconcile::{Reconciler, ServerState};
use crate::types::OperatingMode;

/// Rebuild cadence for the shared view.
const REFRESH_INTERVAL: Duration = Duration::from_millis(250);

/// The atomic view handed to consumers.
#[derive(Debug, Clone, Serialize)]
pub struct LiveState {
    pub operating_mode: OperatingMode,
    pub connected: bool,
    /// Epoch ms of the last accepted signal.
    pub last_signal_ts: Option<u64>,
    pub latency_p95_ms: f64,
    pub drop_rate_pct: f64,
    pub error_rate_pct: f64,
    pub server_state: ServerState,
    pub game_state: StateSnapshot,
}

pub struct LiveStateProvider {
    view: ArcSwap<LiveState>,
    ingestor: Arc<FeedIngestor>,
    reconciler: Arc<Reconciler>,
    game_state: Arc<GameState>,
}

impl LiveStateProvider {
    pub fn new(
        ingestor: Arc<FeedIngestor>,
        reconciler: Arc<Reconciler>,
        game_state: Arc<GameState>,
    ) -> Arc<Self> {
        let initial = LiveState {
            operating_mode: OperatingMode::Normal,
            connected: false,
            last_signal_ts: None,
            latency_p95_ms: 0.0,
            drop_rate_pct: 0.0,
            error_rate_pct: 0.0,
            server_state: ServerState::default(),
            game_state: game_state.snapshot(),
        };
        Arc::new(Self {
            view: ArcSwap::from_pointee(initial),
            ingestor,
            reconciler,
            game_state,
        })
    }

    /// Current view; a single atomic pointer load.
    pub fn snapshot(&self) -> Arc<LiveState> {
        self.view.load_full()
    }

    /// Rebuild the view from the live components.
    pub fn refresh(&self) {
        let limiter = self.ingestor.rate_limiter_snapshot();
        let metrics = self.ingestor.metrics.snapshot();
        let error_rate_pct = if metrics.total_signals > 0 {
            metrics.errors as f64 / metrics.total_signals as f64 * 100.0
        } else {
            0.0
        };

        let state = LiveState {
            operating_mode: self.ingestor.degradation.mode(),
            connected: self.ingestor.health.is_connected(),
            last_signal_ts: self.ingestor.last_signal().map(|s| s.timestamp_ms),
            latency_p95_ms: self.ingestor.spike_detector.p95_ms(),
            drop_rate_pct: limiter.drop_rate_pct,
            error_rate_pct,
            server_state: self.reconciler.server_state(),
            game_state: self.game_state.snapshot(),
        };
        self.view.store(Arc::new(state));
    }

    /// Refresh loop; runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => self.refresh(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("live-state provider stopped");
                        return;
                    }
                }
            }
        }
    }
}
