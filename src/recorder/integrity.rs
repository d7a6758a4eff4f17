// =============================================================================
// Data-integrity monitor — tick cadence, connection continuity, game health
// =============================================================================
//
// The monitor watches every game, whether or not it is being recorded.
// Crossing a threshold enters the *triggered* state; while triggered the
// recorder discards the in-flight game. One fully clean game (stable
// connection, no gap over threshold, ordinary rug terminator) recovers.
// =============================================================================

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::IntegrityThresholdType;
use crate::events::IntegrityIssueInfo;

/// What a monitor step observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityOutcome {
    Ok,
    /// Threshold crossed; the recorder must discard the current game.
    Triggered(IntegrityIssueInfo),
    /// A clean game completed while triggered; recording may resume.
    Recovered,
}

#[derive(Debug, Default)]
struct MonitorInner {
    triggered: bool,
    current_game_id: Option<String>,
    last_tick: Option<u64>,
    /// Set when anything unhealthy happened during the current game.
    current_game_dirty: bool,
    unclean_game_streak: u32,
    games_observed: u64,
    issues_raised: u64,
}

pub struct DataIntegrityMonitor {
    threshold_type: IntegrityThresholdType,
    threshold_value: u32,
    inner: Mutex<MonitorInner>,
}

impl DataIntegrityMonitor {
    pub fn new(threshold_type: IntegrityThresholdType, threshold_value: u32) -> Self {
        Self {
            threshold_type,
            threshold_value,
            inner: Mutex::new(MonitorInner::default()),
        }
    }

    pub fn triggered(&self) -> bool {
        self.inner.lock().triggered
    }

    pub fn on_game_start(&self, game_id: &str) {
        let mut inner = self.inner.lock();
        inner.current_game_id = Some(game_id.to_string());
        inner.last_tick = None;
        inner.current_game_dirty = false;
    }

    /// Observe one tick; a gap over the threshold dirties the game and,
    /// for the TICKS threshold kind, trips the monitor immediately.
    pub fn record_tick(&self, tick: u64) -> IntegrityOutcome {
        let mut inner = self.inner.lock();
        let gap = match inner.last_tick {
            Some(last) if tick > last => tick - last,
            _ => {
                inner.last_tick = Some(tick);
                return IntegrityOutcome::Ok;
            }
        };
        inner.last_tick = Some(tick);

        if gap > self.threshold_value as u64 {
            inner.current_game_dirty = true;
            if self.threshold_type == IntegrityThresholdType::Ticks {
                return self.trigger(
                    &mut inner,
                    "tick_gap",
                    format!("gap of {gap} ticks exceeds threshold {}", self.threshold_value),
                );
            }
        }
        IntegrityOutcome::Ok
    }

    /// The transport dropped; always trips the monitor.
    pub fn on_connection_lost(&self) -> IntegrityOutcome {
        let mut inner = self.inner.lock();
        inner.current_game_dirty = true;
        self.trigger(&mut inner, "connection_lost", "transport disconnected".into())
    }

    /// The game ended. `clean_terminator` is false when the lifecycle ended
    /// without the ordinary rug pair (e.g. mid-game reconnect).
    pub fn on_game_end(&self, clean_terminator: bool) -> IntegrityOutcome {
        let mut inner = self.inner.lock();
        inner.games_observed += 1;
        let clean = clean_terminator && !inner.current_game_dirty;
        inner.current_game_id = None;
        inner.last_tick = None;
        inner.current_game_dirty = false;

        if clean {
            inner.unclean_game_streak = 0;
            if inner.triggered {
                inner.triggered = false;
                info!("integrity monitor recovered after clean game");
                return IntegrityOutcome::Recovered;
            }
            return IntegrityOutcome::Ok;
        }

        inner.unclean_game_streak += 1;
        if self.threshold_type == IntegrityThresholdType::Games
            && inner.unclean_game_streak >= self.threshold_value
            && !inner.triggered
        {
            let streak = inner.unclean_game_streak;
            return self.trigger(
                &mut inner,
                "unclean_games",
                format!("{streak} consecutive unclean games"),
            );
        }
        IntegrityOutcome::Ok
    }

    fn trigger(
        &self,
        inner: &mut MonitorInner,
        kind: &str,
        details: String,
    ) -> IntegrityOutcome {
        inner.issues_raised += 1;
        let issue = IntegrityIssueInfo {
            kind: kind.to_string(),
            details,
            game_id: inner.current_game_id.clone(),
        };
        if inner.triggered {
            // Already discarding; no second transition.
            return IntegrityOutcome::Ok;
        }
        inner.triggered = true;
        warn!(kind = %issue.kind, details = %issue.details, "data integrity issue");
        IntegrityOutcome::Triggered(issue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticks_monitor(threshold: u32) -> DataIntegrityMonitor {
        DataIntegrityMonitor::new(IntegrityThresholdType::Ticks, threshold)
    }

    #[test]
    fn contiguous_ticks_stay_clean() {
        let monitor = ticks_monitor(5);
        monitor.on_game_start("g1");
        for tick in 0..100 {
            assert_eq!(monitor.record_tick(tick), IntegrityOutcome::Ok);
        }
        assert!(!monitor.triggered());
    }

    #[test]
    fn tick_gap_over_threshold_triggers() {
        let monitor = ticks_monitor(5);
        monitor.on_game_start("g1");
        monitor.record_tick(123);
        match monitor.record_tick(140) {
            IntegrityOutcome::Triggered(issue) => {
                assert_eq!(issue.kind, "tick_gap");
                assert_eq!(issue.game_id.as_deref(), Some("g1"));
            }
            other => panic!("expected trigger, got {other:?}"),
        }
        assert!(monitor.triggered());
    }

    #[test]
    fn small_gap_within_threshold_is_ok() {
        let monitor = ticks_monitor(5);
        monitor.on_game_start("g1");
        monitor.record_tick(10);
        assert_eq!(monitor.record_tick(15), IntegrityOutcome::Ok);
        assert!(!monitor.triggered());
    }

    #[test]
    fn clean_game_recovers_triggered_state() {
        let monitor = ticks_monitor(5);
        monitor.on_game_start("g1");
        monitor.record_tick(0);
        monitor.record_tick(100);
        assert!(monitor.triggered());
        // The dirtied game ends; still triggered.
        assert_eq!(monitor.on_game_end(true), IntegrityOutcome::Ok);
        assert!(monitor.triggered());

        // One fully clean game recovers.
        monitor.on_game_start("g2");
        for tick in 0..50 {
            monitor.record_tick(tick);
        }
        assert_eq!(monitor.on_game_end(true), IntegrityOutcome::Recovered);
        assert!(!monitor.triggered());
    }

    #[test]
    fn connection_loss_triggers_any_threshold_type() {
        let monitor = DataIntegrityMonitor::new(IntegrityThresholdType::Games, 3);
        monitor.on_game_start("g1");
        assert!(matches!(
            monitor.on_connection_lost(),
            IntegrityOutcome::Triggered(_)
        ));
    }

    #[test]
    fn games_threshold_counts_unclean_streak() {
        let monitor = DataIntegrityMonitor::new(IntegrityThresholdType::Games, 2);
        // First unclean game (abnormal terminator): below threshold.
        monitor.on_game_start("g1");
        assert_eq!(monitor.on_game_end(false), IntegrityOutcome::Ok);
        assert!(!monitor.triggered());
        // Second in a row crosses it.
        monitor.on_game_start("g2");
        assert!(matches!(
            monitor.on_game_end(false),
            IntegrityOutcome::Triggered(_)
        ));
    }

    #[test]
    fn clean_game_resets_unclean_streak() {
        let monitor = DataIntegrityMonitor::new(IntegrityThresholdType::Games, 2);
        monitor.on_game_start("g1");
        monitor.on_game_end(false);
        monitor.on_game_start("g2");
        monitor.on_game_end(true);
        monitor.on_game_start("g3");
        assert_eq!(monitor.on_game_end(false), IntegrityOutcome::Ok);
        assert!(!monitor.triggered());
    }
}
