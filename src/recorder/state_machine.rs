// =============================================================================
// Recording state machine — session lifecycle for the recorder
// =============================================================================
//
//   IDLE --START_SESSION--> MONITORING --GAME_START--> RECORDING
//   RECORDING --GAME_END--> MONITORING            (counts the game)
//   RECORDING --INTEGRITY_ISSUE--> MONITORING     (discards, no count)
//   any --STOP_SESSION--> FINISHING_GAME if recording, else IDLE
//   FINISHING_GAME --GAME_END--> IDLE
//
// An optional game limit completes the session on the game end that
// reaches it.
// =============================================================================

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Monitoring,
    Recording,
    FinishingGame,
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Monitoring => write!(f, "monitoring"),
            Self::Recording => write!(f, "recording"),
            Self::FinishingGame => write!(f, "finishing_game"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot start a session from state {0}")]
    AlreadyActive(RecordingState),
}

/// Everything one machine step produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    /// `(from, to)` when the state moved.
    pub transition: Option<(RecordingState, RecordingState)>,
    /// Game id that was recorded to completion by this step.
    pub game_recorded: Option<String>,
    /// Total games recorded, set when the session completed.
    pub session_complete: Option<u32>,
}

struct MachineInner {
    state: RecordingState,
    games_recorded: u32,
    game_limit: Option<u32>,
    current_game_id: Option<String>,
}

pub struct RecordingStateMachine {
    inner: Mutex<MachineInner>,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MachineInner {
                state: RecordingState::Idle,
                games_recorded: 0,
                game_limit: None,
                current_game_id: None,
            }),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.inner.lock().state
    }

    pub fn games_recorded(&self) -> u32 {
        self.inner.lock().games_recorded
    }

    pub fn current_game_id(&self) -> Option<String> {
        self.inner.lock().current_game_id.clone()
    }

    /// Begin a session. Only legal from IDLE; the counter resets and the
    /// machine waits in MONITORING for the next game boundary.
    pub fn start_session(&self, game_limit: Option<u32>) -> Result<StepResult, SessionError> {
        let mut inner = self.inner.lock();
        if inner.state != RecordingState::Idle {
            return Err(SessionError::AlreadyActive(inner.state));
        }
        inner.games_recorded = 0;
        inner.game_limit = game_limit.filter(|limit| *limit > 0);
        inner.current_game_id = None;
        Ok(self.transition(&mut inner, RecordingState::Monitoring))
    }

    /// A game began. Ignored outside MONITORING (a mid-game session start
    /// waits for the next boundary; IDLE means no session).
    pub fn on_game_start(&self, game_id: &str) -> StepResult {
        let mut inner = self.inner.lock();
        if inner.state != RecordingState::Monitoring {
            debug!(state = %inner.state, game_id, "game start ignored");
            return StepResult::default();
        }
        inner.current_game_id = Some(game_id.to_string());
        self.transition(&mut inner, RecordingState::Recording)
    }

    /// The current game ended normally.
    pub fn on_game_end(&self) -> StepResult {
        let mut inner = self.inner.lock();
        match inner.state {
            RecordingState::Recording => {
                inner.games_recorded += 1;
                let game_id = inner.current_game_id.take();
                let limit_reached = inner
                    .game_limit
                    .map(|limit| inner.games_recorded >= limit)
                    .unwrap_or(false);

                let next = if limit_reached {
                    RecordingState::Idle
                } else {
                    RecordingState::Monitoring
                };
                let mut result = self.transition(&mut inner, next);
                result.game_recorded = game_id;
                if limit_reached {
                    result.session_complete = Some(inner.games_recorded);
                    info!(games = inner.games_recorded, "session game limit reached");
                }
                result
            }
            RecordingState::FinishingGame => {
                // The stop request was waiting for this boundary.
                inner.games_recorded += 1;
                let game_id = inner.current_game_id.take();
                let mut result = self.transition(&mut inner, RecordingState::Idle);
                result.game_recorded = game_id;
                result.session_complete = Some(inner.games_recorded);
                result
            }
            _ => {
                debug!(state = %inner.state, "game end ignored");
                StepResult::default()
            }
        }
    }

    /// Integrity issue mid-game: the partial game is discarded and does not
    /// count.
    pub fn on_integrity_issue(&self) -> StepResult {
        let mut inner = self.inner.lock();
        if inner.state != RecordingState::Recording {
            return StepResult::default();
        }
        let discarded = inner.current_game_id.take();
        debug!(game_id = ?discarded, "partial game discarded");
        self.transition(&mut inner, RecordingState::Monitoring)
    }

    /// Stop the session. Mid-game the machine finishes the current game
    /// first; otherwise it returns to IDLE immediately.
    pub fn stop_session(&self) -> StepResult {
        let mut inner = self.inner.lock();
        match inner.state {
            RecordingState::Idle => StepResult::default(),
            RecordingState::Recording => self.transition(&mut inner, RecordingState::FinishingGame),
            _ => {
                let mut result = self.transition(&mut inner, RecordingState::Idle);
                result.session_complete = Some(inner.games_recorded);
                result
            }
        }
    }

    fn transition(&self, inner: &mut MachineInner, to: RecordingState) -> StepResult {
        let from = inner.state;
        inner.state = to;
        info!(from = %from, to = %to, "recording state changed");
        StepResult {
            transition: Some((from, to)),
            game_recorded: None,
            session_complete: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_idle() {
        let sm = RecordingStateMachine::new();
        assert_eq!(sm.state(), RecordingState::Idle);
        assert_eq!(sm.games_recorded(), 0);
    }

    #[test]
    fn start_session_goes_to_monitoring() {
        let sm = RecordingStateMachine::new();
        let result = sm.start_session(None).unwrap();
        assert_eq!(sm.state(), RecordingState::Monitoring);
        assert_eq!(
            result.transition,
            Some((RecordingState::Idle, RecordingState::Monitoring))
        );
    }

    #[test]
    fn start_session_from_non_idle_is_error() {
        let sm = RecordingStateMachine::new();
        sm.start_session(None).unwrap();
        assert_eq!(
            sm.start_session(None),
            Err(SessionError::AlreadyActive(RecordingState::Monitoring))
        );
    }

    #[test]
    fn game_start_from_monitoring_records() {
        let sm = RecordingStateMachine::new();
        sm.start_session(None).unwrap();
        sm.on_game_start("g1");
        assert_eq!(sm.state(), RecordingState::Recording);
        assert_eq!(sm.current_game_id().as_deref(), Some("g1"));
    }

    #[test]
    fn game_start_from_idle_is_ignored() {
        let sm = RecordingStateMachine::new();
        sm.on_game_start("g1");
        assert_eq!(sm.state(), RecordingState::Idle);
    }

    #[test]
    fn game_end_counts_and_returns_to_monitoring() {
        let sm = RecordingStateMachine::new();
        sm.start_session(None).unwrap();
        sm.on_game_start("g1");
        let result = sm.on_game_end();
        assert_eq!(sm.state(), RecordingState::Monitoring);
        assert_eq!(sm.games_recorded(), 1);
        assert_eq!(result.game_recorded.as_deref(), Some("g1"));
        assert!(result.session_complete.is_none());
    }

    #[test]
    fn integrity_issue_discards_without_counting() {
        let sm = RecordingStateMachine::new();
        sm.start_session(None).unwrap();
        sm.on_game_start("g1");
        let result = sm.on_integrity_issue();
        assert_eq!(sm.state(), RecordingState::Monitoring);
        assert_eq!(sm.games_recorded(), 0);
        assert!(result.game_recorded.is_none());
        // The eventual game end for the discarded game is ignored.
        sm.on_game_end();
        assert_eq!(sm.games_recorded(), 0);
    }

    #[test]
    fn game_limit_completes_session() {
        let sm = RecordingStateMachine::new();
        sm.start_session(Some(1)).unwrap();
        sm.on_game_start("g1");
        let result = sm.on_game_end();
        assert_eq!(sm.state(), RecordingState::Idle);
        assert_eq!(result.session_complete, Some(1));
    }

    #[test]
    fn limit_after_multiple_games() {
        let sm = RecordingStateMachine::new();
        sm.start_session(Some(3)).unwrap();
        for (index, game) in ["g1", "g2"].iter().enumerate() {
            sm.on_game_start(game);
            sm.on_game_end();
            assert_eq!(sm.state(), RecordingState::Monitoring);
            assert_eq!(sm.games_recorded(), index as u32 + 1);
        }
        sm.on_game_start("g3");
        let result = sm.on_game_end();
        assert_eq!(sm.state(), RecordingState::Idle);
        assert_eq!(result.session_complete, Some(3));
    }

    #[test]
    fn stop_mid_game_finishes_first() {
        let sm = RecordingStateMachine::new();
        sm.start_session(None).unwrap();
        sm.on_game_start("g1");
        sm.stop_session();
        assert_eq!(sm.state(), RecordingState::FinishingGame);

        let result = sm.on_game_end();
        assert_eq!(sm.state(), RecordingState::Idle);
        assert_eq!(result.game_recorded.as_deref(), Some("g1"));
        assert_eq!(result.session_complete, Some(1));
    }

    #[test]
    fn stop_outside_game_goes_straight_to_idle() {
        let sm = RecordingStateMachine::new();
        sm.start_session(None).unwrap();
        let result = sm.stop_session();
        assert_eq!(sm.state(), RecordingState::Idle);
        assert_eq!(result.session_complete, Some(0));
    }

    #[test]
    fn session_restart_resets_counter() {
        let sm = RecordingStateMachine::new();
        sm.start_session(None).unwrap();
        sm.on_game_start("g1");
        sm.on_game_end();
        sm.stop_session();
        sm.start_session(None).unwrap();
        assert_eq!(sm.games_recorded(), 0);
    }
}
