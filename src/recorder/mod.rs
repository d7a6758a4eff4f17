// =============================================================================
// Session recorder — wires lifecycle events to state machine, integrity
// monitor, per-game capture, and the event store
// =============================================================================

pub mod integrity;
pub mod state_machine;
pub mod store;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::bus::{EventBus, SubscriptionHandle};
use crate::config::Config;
use crate::events::{BusEvent, EventKind, RecordingTransition};
use crate::types::GameSignal;

use integrity::{DataIntegrityMonitor, IntegrityOutcome};
use state_machine::{RecordingState, RecordingStateMachine, StepResult};
use store::EventStore;

/// In-memory capture of one game, written as a file only when the game
/// completes cleanly.
#[derive(Debug, Serialize)]
struct GameCapture {
    game_id: String,
    started_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    ended_at_ms: Option<u64>,
    prices: Vec<(u64, Decimal)>,
    peak_price: Decimal,
}

impl GameCapture {
    fn new(game_id: String) -> Self {
        Self {
            game_id,
            started_at_ms: crate::types::epoch_ms_now(),
            ended_at_ms: None,
            prices: Vec::new(),
            peak_price: Decimal::ZERO,
        }
    }

    fn push(&mut self, tick: u64, price: Decimal) {
        if price > self.peak_price {
            self.peak_price = price;
        }
        self.prices.push((tick, price));
    }
}

pub struct SessionRecorder {
    bus: Arc<EventBus>,
    pub state_machine: RecordingStateMachine,
    pub integrity: DataIntegrityMonitor,
    pub store: Arc<EventStore>,
    games_dir: PathBuf,
    capture: Mutex<Option<GameCapture>>,
    session_deadline: Option<Instant>,
    session_complete: AtomicBool,
    completion: Arc<tokio::sync::Notify>,
}

impl SessionRecorder {
    pub fn new(config: &Config, bus: Arc<EventBus>, store: Arc<EventStore>) -> Arc<Self> {
        let recorder = Arc::new(Self {
            bus,
            state_machine: RecordingStateMachine::new(),
            integrity: DataIntegrityMonitor::new(
                config.integrity_threshold_type,
                config.integrity_threshold_value,
            ),
            store,
            games_dir: config.resolved_data_dir().join("games"),
            capture: Mutex::new(None),
            session_deadline: (config.session_time_limit > 0)
                .then(|| Instant::now() + Duration::from_secs(config.session_time_limit * 60)),
            session_complete: AtomicBool::new(false),
            completion: Arc::new(tokio::sync::Notify::new()),
        });

        let limit = (config.session_game_limit > 0).then_some(config.session_game_limit);
        if let Ok(result) = recorder.state_machine.start_session(limit) {
            recorder.publish_step(&result);
        }
        recorder
    }

    /// Strong subscriptions for the lifecycle events the recorder consumes.
    pub fn attach(self: &Arc<Self>) -> Vec<SubscriptionHandle> {
        let mut handles = Vec::new();
        let recorder = Arc::clone(self);
        handles.push(self.bus.subscribe_strong(EventKind::GameStart, move |event| {
            if let BusEvent::GameStart(signal) = event {
                recorder.on_game_start(signal);
            }
        }));
        let recorder = Arc::clone(self);
        handles.push(self.bus.subscribe_strong(EventKind::GameTick, move |event| {
            if let BusEvent::GameTick(signal) = event {
                recorder.on_game_tick(signal);
            }
        }));
        let recorder = Arc::clone(self);
        handles.push(self.bus.subscribe_strong(EventKind::GameEnd, move |event| {
            if let BusEvent::GameEnd(signal) = event {
                recorder.on_game_end(signal);
            }
        }));
        let recorder = Arc::clone(self);
        handles.push(
            self.bus
                .subscribe_strong(EventKind::FeedDisconnected, move |_| {
                    recorder.on_connection_lost();
                }),
        );
        handles
    }

    /// Await point for session completion (game or time limit reached).
    pub fn completion_notify(&self) -> Arc<tokio::sync::Notify> {
        Arc::clone(&self.completion)
    }

    pub fn is_session_complete(&self) -> bool {
        self.session_complete.load(Ordering::SeqCst)
    }

    pub fn games_recorded(&self) -> u32 {
        self.state_machine.games_recorded()
    }

    fn on_game_start(&self, signal: &GameSignal) {
        self.integrity.on_game_start(&signal.game_id);

        // While triggered, the monitor keeps observing but nothing records.
        if self.integrity.triggered() {
            info!(game_id = %signal.game_id, "integrity triggered, game observed but not recorded");
            return;
        }

        let result = self.state_machine.on_game_start(&signal.game_id);
        if result.transition.is_some() {
            *self.capture.lock() = Some(GameCapture::new(signal.game_id.clone()));
        }
        self.publish_step(&result);
    }

    fn on_game_tick(&self, signal: &GameSignal) {
        match self.integrity.record_tick(signal.tick) {
            IntegrityOutcome::Triggered(issue) => {
                let _ = self.bus.publish(BusEvent::IntegrityIssue(issue));
                self.discard_current_game();
            }
            IntegrityOutcome::Recovered => {
                let _ = self.bus.publish(BusEvent::IntegrityRecovered);
            }
            IntegrityOutcome::Ok => {}
        }

        if self.state_machine.state() == RecordingState::Recording {
            if let Some(capture) = self.capture.lock().as_mut() {
                capture.push(signal.tick, signal.price);
            }
        }
    }

    fn on_game_end(&self, signal: &GameSignal) {
        // The rug pair is the ordinary terminator.
        match self.integrity.on_game_end(true) {
            IntegrityOutcome::Recovered => {
                let _ = self.bus.publish(BusEvent::IntegrityRecovered);
            }
            IntegrityOutcome::Triggered(issue) => {
                let _ = self.bus.publish(BusEvent::IntegrityIssue(issue));
            }
            IntegrityOutcome::Ok => {}
        }

        let result = self.state_machine.on_game_end();
        if let Some(game_id) = &result.game_recorded {
            self.write_game_file(game_id, signal);
        }
        self.publish_step(&result);

        if result.session_complete.is_none() {
            if let Some(deadline) = self.session_deadline {
                if Instant::now() >= deadline {
                    info!("session time limit reached");
                    let result = self.state_machine.stop_session();
                    self.publish_step(&result);
                    self.complete_session();
                }
            }
        }
    }

    fn on_connection_lost(&self) {
        if let IntegrityOutcome::Triggered(issue) = self.integrity.on_connection_lost() {
            let _ = self.bus.publish(BusEvent::IntegrityIssue(issue));
            self.discard_current_game();
        }
    }

    /// Stop the session from outside (shutdown). Mid-game stops wait for
    /// the boundary only if the caller lets them; shutdown does not.
    pub fn stop(&self) {
        let result = self.state_machine.stop_session();
        self.publish_step(&result);
    }

    fn discard_current_game(&self) {
        let discarded = self.capture.lock().take();
        if let Some(capture) = discarded {
            warn!(game_id = %capture.game_id, ticks = capture.prices.len(), "partial game discarded");
        }
        let result = self.state_machine.on_integrity_issue();
        self.publish_step(&result);
    }

    fn write_game_file(&self, game_id: &str, signal: &GameSignal) {
        let capture = self.capture.lock().take();
        let Some(mut capture) = capture else {
            return;
        };
        if capture.game_id != game_id {
            warn!(
                expected = game_id,
                captured = %capture.game_id,
                "capture/game id mismatch, discarding"
            );
            return;
        }
        capture.ended_at_ms = Some(signal.timestamp_ms);

        let dir = self.games_dir.join(Utc::now().format("%Y-%m-%d").to_string());
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!(error = %e, "failed to create games directory");
            return;
        }
        let path = dir.join(format!("game_{game_id}.json"));
        match serde_json::to_vec_pretty(&capture) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&path, bytes) {
                    warn!(error = %e, path = %path.display(), "failed to write game file");
                } else {
                    info!(path = %path.display(), ticks = capture.prices.len(), "game recorded");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize game capture"),
        }
    }

    fn publish_step(&self, result: &StepResult) {
        if let Some((from, to)) = result.transition {
            let _ = self
                .bus
                .publish(BusEvent::RecordingStateChanged(RecordingTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                    games_recorded: self.state_machine.games_recorded(),
                }));
        }
        if let Some(games) = result.session_complete {
            info!(games, "recording session complete");
            self.complete_session();
        }
    }

    fn complete_session(&self) {
        if !self.session_complete.swap(true, Ordering::SeqCst) {
            // notify_one stores a permit, so a waiter that arrives after
            // completion still wakes.
            self.completion.notify_one();
        }
    }
}
