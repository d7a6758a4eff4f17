// =============================================================================
// Phase classifier — derives game lifecycle from broadcast frames
// =============================================================================
//
// A single `gameStateUpdate` carries `(active, rugged, cooldownTimer,
// tickCount, gameId, allowPreRoundBuys)`. The classifier folds each frame
// into a phase label:
//
//   PRESALE          !active, !rugged, cooldown == 0, tick == 0 (or pre-round
//                    buys allowed)
//   ACTIVE_GAMEPLAY  active, !rugged
//   RUG_EVENT_1      first rugged frame for the current game id
//   RUG_EVENT_2      subsequent rugged frame inside the pairing window
//   COOLDOWN         !active, cooldown > 0
//   UNKNOWN          anything else (frame marked invalid)
//
// Game-completion side effects key off RUG_EVENT_1 exactly once per game id.
// The second rugged frame only verifies the pair; one arriving outside the
// window is counted as an orphan.
// =============================================================================

use serde::Serialize;
use tracing::{debug, warn};

use crate::types::Phase;

/// Raw fields the classifier needs from a frame.
#[derive(Debug, Clone)]
pub struct SignalFields {
    pub game_id: String,
    pub active: bool,
    pub rugged: bool,
    pub tick: u64,
    pub cooldown_timer: u32,
    pub allow_pre_round_buys: bool,
}

/// Outcome of classifying one frame.
#[derive(Debug, Clone)]
pub struct Classification {
    pub phase: Phase,
    pub previous_phase: Phase,
    pub is_valid: bool,
    /// True exactly once per game, on the first rugged frame.
    pub game_completed: bool,
    /// True when this frame starts gameplay for a new game id.
    pub game_started: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseStats {
    pub transitions: u64,
    pub invalid_frames: u64,
    pub games_completed: u64,
    /// RUG_EVENT_1 frames whose partner never arrived inside the window.
    pub orphaned_rug_pairs: u64,
}

/// Pairing bookkeeping for the current game's rug events.
#[derive(Debug, Clone, Default)]
struct RugPairState {
    game_id: String,
    first_at_ms: u64,
    paired: bool,
}

pub struct PhaseClassifier {
    rug_pair_window_ms: u64,
    current_game_id: Option<String>,
    previous_phase: Phase,
    last_tick: u64,
    rug_pair: Option<RugPairState>,
    stats: PhaseStats,
}

impl PhaseClassifier {
    pub fn new(rug_pair_window_ms: u64) -> Self {
        Self {
            rug_pair_window_ms,
            current_game_id: None,
            previous_phase: Phase::Unknown,
            last_tick: 0,
            rug_pair: None,
            stats: PhaseStats::default(),
        }
    }

    pub fn stats(&self) -> PhaseStats {
        self.stats.clone()
    }

    pub fn previous_phase(&self) -> Phase {
        self.previous_phase
    }

    pub fn current_game_id(&self) -> Option<&str> {
        self.current_game_id.as_deref()
    }

    /// Fold one frame into the classifier. `now_ms` is the frame's receive
    /// instant; the classifier never reads a clock itself.
    pub fn classify(&mut self, fields: &SignalFields, now_ms: u64) -> Classification {
        let previous_phase = self.previous_phase;
        let game_changed = self
            .current_game_id
            .as_deref()
            .map(|id| id != fields.game_id)
            .unwrap_or(true);

        if game_changed {
            self.finish_rug_pair();
            self.current_game_id = Some(fields.game_id.clone());
            self.last_tick = 0;
        }

        let phase = self.derive_phase(fields, game_changed, now_ms);

        let mut is_valid = phase != Phase::Unknown;

        // Ticks must not run backwards within a game.
        if !game_changed && fields.tick < self.last_tick && fields.active {
            warn!(
                game_id = %fields.game_id,
                tick = fields.tick,
                last_tick = self.last_tick,
                "tick regression within game"
            );
            is_valid = false;
        }
        self.last_tick = fields.tick.max(self.last_tick);

        if is_valid && !transition_allowed(previous_phase, phase) {
            debug!(
                from = %previous_phase,
                to = %phase,
                "unexpected phase transition"
            );
            is_valid = false;
        }

        let game_completed = phase == Phase::RugEvent1;
        let game_started = phase == Phase::ActiveGameplay && previous_phase != Phase::ActiveGameplay;

        if phase != previous_phase {
            self.stats.transitions += 1;
        }
        if !is_valid {
            self.stats.invalid_frames += 1;
        }
        if game_completed {
            self.stats.games_completed += 1;
        }
        self.previous_phase = phase;

        Classification {
            phase,
            previous_phase,
            is_valid,
            game_completed,
            game_started,
        }
    }

    fn derive_phase(&mut self, fields: &SignalFields, game_changed: bool, now_ms: u64) -> Phase {
        if fields.rugged {
            return self.classify_rugged(fields, game_changed, now_ms);
        }

        if fields.active {
            return Phase::ActiveGameplay;
        }

        if fields.cooldown_timer > 0 {
            return Phase::Cooldown;
        }

        if fields.tick == 0 || fields.allow_pre_round_buys {
            return Phase::Presale;
        }

        Phase::Unknown
    }

    fn classify_rugged(&mut self, fields: &SignalFields, game_changed: bool, now_ms: u64) -> Phase {
        match &mut self.rug_pair {
            Some(pair) if !game_changed && pair.game_id == fields.game_id => {
                let within_window = now_ms.saturating_sub(pair.first_at_ms) <= self.rug_pair_window_ms;
                if within_window {
                    pair.paired = true;
                    Phase::RugEvent2
                } else {
                    // Partner arrived too late; the pair stays orphaned and
                    // this frame is treated as unclassifiable.
                    warn!(
                        game_id = %fields.game_id,
                        elapsed_ms = now_ms.saturating_sub(pair.first_at_ms),
                        window_ms = self.rug_pair_window_ms,
                        "rugged frame outside pairing window"
                    );
                    Phase::Unknown
                }
            }
            _ => {
                self.finish_rug_pair();
                self.rug_pair = Some(RugPairState {
                    game_id: fields.game_id.clone(),
                    first_at_ms: now_ms,
                    paired: false,
                });
                Phase::RugEvent1
            }
        }
    }

    /// Close out any in-flight rug pair, counting it if the partner frame
    /// never showed up.
    fn finish_rug_pair(&mut self) {
        if let Some(pair) = self.rug_pair.take() {
            if !pair.paired {
                self.stats.orphaned_rug_pairs += 1;
                warn!(game_id = %pair.game_id, "rug event pair orphaned");
            }
        }
    }

    /// Reset transient pairing state after a transport disconnect. The next
    /// frame reclassifies from scratch.
    pub fn recover_from_disconnect(&mut self) {
        self.finish_rug_pair();
        self.previous_phase = Phase::Unknown;
        debug!("phase classifier reset after disconnect");
    }
}

/// Small transition table; anything not listed marks the frame invalid
/// without blocking propagation. UNKNOWN may transition anywhere (recovery).
fn transition_allowed(from: Phase, to: Phase) -> bool {
    use Phase::*;
    if from == to || from == Unknown {
        return true;
    }
    matches!(
        (from, to),
        (Presale, ActiveGameplay)
            | (Presale, Cooldown)
            | (ActiveGameplay, RugEvent1)
            | (RugEvent1, RugEvent2)
            | (RugEvent1, Cooldown)
            | (RugEvent1, Presale)
            | (RugEvent2, Cooldown)
            | (RugEvent2, Presale)
            | (Cooldown, Presale)
            | (Cooldown, ActiveGameplay)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(game_id: &str, active: bool, rugged: bool, tick: u64, cooldown: u32) -> SignalFields {
        SignalFields {
            game_id: game_id.into(),
            active,
            rugged,
            tick,
            cooldown_timer: cooldown,
            allow_pre_round_buys: false,
        }
    }

    #[test]
    fn clean_game_lifecycle() {
        let mut classifier = PhaseClassifier::new(500);

        let presale = classifier.classify(&fields("g1", false, false, 0, 0), 0);
        assert_eq!(presale.phase, Phase::Presale);

        let start = classifier.classify(&fields("g1", true, false, 1, 0), 250);
        assert_eq!(start.phase, Phase::ActiveGameplay);
        assert!(start.game_started);

        for tick in 2..=500 {
            let c = classifier.classify(&fields("g1", true, false, tick, 0), 250 * tick);
            assert_eq!(c.phase, Phase::ActiveGameplay);
            assert!(c.is_valid);
            assert!(!c.game_started);
        }

        let rug1 = classifier.classify(&fields("g1", false, true, 500, 0), 130_000);
        assert_eq!(rug1.phase, Phase::RugEvent1);
        assert!(rug1.game_completed);

        let rug2 = classifier.classify(&fields("g1", false, true, 500, 0), 130_300);
        assert_eq!(rug2.phase, Phase::RugEvent2);
        assert!(!rug2.game_completed, "completion side effects fire once");

        let cooldown = classifier.classify(&fields("g1", false, false, 500, 15), 131_000);
        assert_eq!(cooldown.phase, Phase::Cooldown);

        let stats = classifier.stats();
        assert_eq!(stats.games_completed, 1);
        assert_eq!(stats.orphaned_rug_pairs, 0);
    }

    #[test]
    fn second_rug_outside_window_is_unknown() {
        let mut classifier = PhaseClassifier::new(500);
        classifier.classify(&fields("g1", true, false, 10, 0), 0);
        let rug1 = classifier.classify(&fields("g1", false, true, 10, 0), 1_000);
        assert_eq!(rug1.phase, Phase::RugEvent1);

        let late = classifier.classify(&fields("g1", false, true, 10, 0), 2_000);
        assert_eq!(late.phase, Phase::Unknown);
        assert!(!late.is_valid);
    }

    #[test]
    fn orphaned_pair_counted_on_game_change() {
        let mut classifier = PhaseClassifier::new(500);
        classifier.classify(&fields("g1", true, false, 10, 0), 0);
        classifier.classify(&fields("g1", false, true, 10, 0), 1_000);
        // New game starts without a second rugged frame.
        classifier.classify(&fields("g2", false, false, 0, 0), 10_000);
        assert_eq!(classifier.stats().orphaned_rug_pairs, 1);
    }

    #[test]
    fn rugged_frame_for_new_game_is_rug_event_1() {
        let mut classifier = PhaseClassifier::new(500);
        classifier.classify(&fields("g1", false, true, 10, 0), 0);
        classifier.classify(&fields("g1", false, true, 10, 0), 100);
        let next_game = classifier.classify(&fields("g2", false, true, 20, 0), 200);
        assert_eq!(next_game.phase, Phase::RugEvent1);
        assert!(next_game.game_completed);
    }

    #[test]
    fn tick_regression_marks_invalid() {
        let mut classifier = PhaseClassifier::new(500);
        classifier.classify(&fields("g1", true, false, 100, 0), 0);
        let regressed = classifier.classify(&fields("g1", true, false, 50, 0), 250);
        assert_eq!(regressed.phase, Phase::ActiveGameplay);
        assert!(!regressed.is_valid);
    }

    #[test]
    fn unexpected_transition_marks_invalid_but_propagates() {
        let mut classifier = PhaseClassifier::new(500);
        classifier.classify(&fields("g1", false, false, 0, 0), 0);
        // PRESALE cannot jump straight to a rug event.
        let jump = classifier.classify(&fields("g1", false, true, 0, 0), 100);
        assert_eq!(jump.phase, Phase::RugEvent1);
        assert!(!jump.is_valid);
    }

    #[test]
    fn disconnect_recovery_clears_pairing() {
        let mut classifier = PhaseClassifier::new(500);
        classifier.classify(&fields("g1", true, false, 10, 0), 0);
        classifier.classify(&fields("g1", false, true, 10, 0), 500);
        classifier.recover_from_disconnect();
        assert_eq!(classifier.previous_phase(), Phase::Unknown);
        // Pair closed out as orphaned by the reset.
        assert_eq!(classifier.stats().orphaned_rug_pairs, 1);

        // After recovery the next rugged frame for the same game id pairs
        // fresh rather than continuing the stale pair.
        let rug = classifier.classify(&fields("g1", false, true, 10, 0), 10_000);
        assert_eq!(rug.phase, Phase::RugEvent1);
    }

    #[test]
    fn presale_when_pre_round_buys_allowed() {
        let mut classifier = PhaseClassifier::new(500);
        let mut f = fields("g1", false, false, 42, 0);
        f.allow_pre_round_buys = true;
        let c = classifier.classify(&f, 0);
        assert_eq!(c.phase, Phase::Presale);
    }
}
