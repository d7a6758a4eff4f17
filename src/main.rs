// =============================================================================
// Vectra core service — entry point
// =============================================================================
//
// Startup order: bus -> game state -> recorders -> ingestor. Teardown runs
// in reverse. Strategy code and host UIs attach through the library API;
// this binary runs the pipeline and records the session.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use vectra_player::actions::{self, ActionTracker, ButtonCategory, PressContext};
use vectra_player::bus::EventBus;
use vectra_player::config::Config;
use vectra_player::events::{BusEvent, EventKind};
use vectra_player::feed::{DegradationManager, FeedIngestor};
use vectra_player::game_state::{GameState, StatePatch};
use vectra_player::live_state::LiveStateProvider;
use vectra_player::reconcile::Reconciler;
use vectra_player::recorder::store::EventStore;
use vectra_player::recorder::SessionRecorder;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();
    let config = Config::parse();
    if let Err(reason) = config.validate() {
        eprintln!("configuration error: {reason}");
        return 2;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter())),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Vectra Core — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!(
        upstream = %config.upstream_url,
        data_dir = %config.resolved_data_dir().display(),
        rate_limit = config.rate_limit,
        "configured"
    );

    // ── 2. Event bus ─────────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new(config.ring_buffer_size));
    bus.start();

    // ── 3. Game state + action telemetry ─────────────────────────────────
    let game_state = Arc::new(GameState::new(Arc::clone(&bus), Decimal::ZERO));
    let tracker = Arc::new(ActionTracker::new());
    let _wiring_handles = wire_pipeline(&bus, &game_state, &tracker, &config);

    // ── 4. Persistence ───────────────────────────────────────────────────
    let session_id = Uuid::new_v4().to_string();
    let data_dir = config.resolved_data_dir();
    let store = match EventStore::open(&data_dir, &session_id, Arc::clone(&bus)) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to open event store");
            return 1;
        }
    };
    let _store_handles = store.attach();
    store.start_flusher();

    let recorder = SessionRecorder::new(&config, Arc::clone(&bus), Arc::clone(&store));
    let _recorder_handles = recorder.attach();
    let completion = recorder.completion_notify();

    // ── 5. Server-truth reconciliation ───────────────────────────────────
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&game_state),
        Arc::clone(&tracker),
    ));
    let _reconciler_handles = reconciler.attach(&bus);

    // ── 6. Feed ingestor + live-state provider ───────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let degradation = Arc::new(DegradationManager::new());
    let ingestor = Arc::new(FeedIngestor::new(
        &config,
        Arc::clone(&bus),
        Arc::clone(&degradation),
    ));

    let provider = LiveStateProvider::new(
        Arc::clone(&ingestor),
        Arc::clone(&reconciler),
        Arc::clone(&game_state),
    );
    let provider_task = tokio::spawn(Arc::clone(&provider).run(shutdown_rx.clone()));

    let mut ingest_task = tokio::spawn(Arc::clone(&ingestor).run(shutdown_rx));

    info!(session_id = %session_id, "pipeline running");

    // ── 7. Wait for shutdown ─────────────────────────────────────────────
    let mut exit_code = 0;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = completion.notified() => {
            info!(games = recorder.games_recorded(), "session limits reached, shutting down");
        }
        result = &mut ingest_task => {
            match result {
                Ok(Ok(())) => info!("feed ingestor stopped"),
                Ok(Err(e)) => {
                    error!(error = %e, "upstream connection unrecoverable");
                    exit_code = 3;
                }
                Err(e) => {
                    error!(error = %e, "ingestor task panicked");
                    exit_code = 1;
                }
            }
        }
    }

    // ── 8. Teardown (reverse of startup) ─────────────────────────────────
    let _ = shutdown_tx.send(true);
    if !ingest_task.is_finished() {
        if tokio::time::timeout(Duration::from_secs(5), &mut ingest_task)
            .await
            .is_err()
        {
            warn!("ingestor did not stop within deadline, aborting task");
            ingest_task.abort();
        }
    }
    let _ = provider_task.await;

    recorder.stop();
    store.stop(exit_code == 0);
    bus.stop();

    info!(
        games_recorded = recorder.games_recorded(),
        exit_code,
        "shutdown complete"
    );
    exit_code
}

/// Subscribe the pipeline hooks that fold bus events back into local state
/// and action telemetry.
fn wire_pipeline(
    bus: &Arc<EventBus>,
    game_state: &Arc<GameState>,
    tracker: &Arc<ActionTracker>,
    config: &Config,
) -> Vec<vectra_player::bus::SubscriptionHandle> {
    let mut handles = Vec::new();
    let demos_dir = config.resolved_data_dir().join("demonstrations");

    // Ticks drive local tick/price/phase and sidebet expiry.
    let state = Arc::clone(game_state);
    handles.push(bus.subscribe_strong(EventKind::GameTick, move |event| {
        if let BusEvent::GameTick(signal) = event {
            state.apply_signal(signal, false);
        }
    }));

    // Phase-only frames (presale, cooldown) still update the phase.
    let state = Arc::clone(game_state);
    handles.push(bus.subscribe_strong(EventKind::PhaseChanged, move |event| {
        if let BusEvent::PhaseChanged(transition) = event {
            state.update(StatePatch {
                phase: Some(transition.current),
                game_id: Some(transition.game_id.clone()),
                ..Default::default()
            });
        }
    }));

    // The rug frame liquidates positions, resolves in-window sidebets, and
    // seals the game's action sequences.
    let state = Arc::clone(game_state);
    let seal_tracker = Arc::clone(tracker);
    handles.push(bus.subscribe_strong(EventKind::GameEnd, move |event| {
        if let BusEvent::GameEnd(signal) = event {
            state.apply_signal(signal, true);
            let sealed = seal_tracker.seal_game(signal.rugged);
            actions::write_sequences(&demos_dir, &sealed);
        }
    }));

    // Trades become button telemetry.
    for (kind, button_id) in [
        (EventKind::TradeBuy, "buy"),
        (EventKind::TradeSell, "sell"),
        (EventKind::TradeSidebet, "sidebet"),
    ] {
        let state = Arc::clone(game_state);
        let press_tracker = Arc::clone(tracker);
        handles.push(bus.subscribe_strong(kind, move |event| {
            let trade = match event {
                BusEvent::TradeBuy(t) | BusEvent::TradeSell(t) | BusEvent::TradeSidebet(t) => t,
                _ => return,
            };
            let snapshot = state.snapshot();
            press_tracker.record_press(PressContext {
                button_id: button_id.to_string(),
                category: ButtonCategory::Action,
                tick: trade.tick,
                price: trade.price,
                phase: snapshot.phase,
                game_id: trade.game_id.clone(),
                balance: snapshot.balance,
                position_qty: snapshot
                    .position
                    .as_ref()
                    .filter(|p| p.open)
                    .map(|p| p.amount)
                    .unwrap_or(Decimal::ZERO),
                bet_amount: trade.amount,
                trade_id: Some(trade.trade_id.clone()),
            });
            if let (Some(pnl_sol), Some(pnl_percent)) = (trade.pnl_sol, trade.pnl_percent) {
                press_tracker.on_trade_closed(pnl_sol, pnl_percent);
            }
        }));
    }

    // Sidebet resolutions label their sequences.
    let resolve_tracker = Arc::clone(tracker);
    handles.push(bus.subscribe_strong(EventKind::SidebetResolved, move |event| {
        if let BusEvent::SidebetResolved(resolution) = event {
            resolve_tracker.on_sidebet_resolved(resolution.won);
        }
    }));

    // Server trade echoes resolve pending sequences by trade id.
    let echo_tracker = Arc::clone(tracker);
    handles.push(bus.subscribe_strong(EventKind::WsRaw, move |event| {
        let BusEvent::WsRaw(raw) = event else { return };
        if raw.name != "newTrade" && raw.name != "standard/newTrade" {
            return;
        }
        let Some(trade_id) = raw.payload.get("id").and_then(|v| v.as_str()) else {
            return;
        };
        let price = vectra_player::types::decimal_from_value(
            raw.payload.get("price"),
            Decimal::ZERO,
        );
        let tick = raw
            .payload
            .get("tickIndex")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        echo_tracker.on_trade_confirmed(trade_id, price, tick, Some(raw.timestamp_ms));
    }));

    handles
}
