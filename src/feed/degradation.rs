// =============================================================================
// Degradation manager — operating-mode state machine with hysteresis
// =============================================================================
//
// Mode only ever worsens one level at a time in response to observed
// trouble, and recovers one level per clean hysteresis window. Consumers
// must treat the mode as slow-moving truth; transient blips never reach it.
//
//   NORMAL   -> DEGRADED   sustained spike rate
//   DEGRADED -> MINIMAL    repeated disconnects within the window
//   MINIMAL  -> OFFLINE    prolonged silence
//   any      -> one level better after HYSTERESIS of clean operation
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::events::ModeChange;
use crate::types::OperatingMode;

/// Spikes inside this window count toward degradation.
const SPIKE_WINDOW: Duration = Duration::from_secs(60);
const SPIKE_THRESHOLD: usize = 5;

/// Disconnects inside this window push DEGRADED down to MINIMAL.
const DISCONNECT_WINDOW: Duration = Duration::from_secs(120);
const DISCONNECT_THRESHOLD: usize = 3;

/// Silence that takes MINIMAL to OFFLINE.
const OFFLINE_SILENCE: Duration = Duration::from_secs(30);

/// Clean time required before stepping one level back up.
const HYSTERESIS: Duration = Duration::from_secs(30);

struct ModeState {
    mode: OperatingMode,
    spikes: VecDeque<Instant>,
    disconnects: VecDeque<Instant>,
    last_signal: Option<Instant>,
    /// Start of the current clean stretch; reset by any adverse event.
    clean_since: Instant,
}

pub struct DegradationManager {
    state: Mutex<ModeState>,
}

impl DegradationManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ModeState {
                mode: OperatingMode::Normal,
                spikes: VecDeque::new(),
                disconnects: VecDeque::new(),
                last_signal: None,
                clean_since: Instant::now(),
            }),
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.state.lock().mode
    }

    /// A latency spike was observed.
    pub fn record_spike(&self) -> Option<ModeChange> {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.clean_since = now;
        prune(&mut state.spikes, now, SPIKE_WINDOW);
        state.spikes.push_back(now);
        if state.mode == OperatingMode::Normal && state.spikes.len() >= SPIKE_THRESHOLD {
            return transition(&mut state, OperatingMode::Degraded, "sustained latency spikes");
        }
        None
    }

    /// The transport dropped.
    pub fn record_disconnect(&self) -> Option<ModeChange> {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.clean_since = now;
        prune(&mut state.disconnects, now, DISCONNECT_WINDOW);
        state.disconnects.push_back(now);
        match state.mode {
            OperatingMode::Normal => {
                transition(&mut state, OperatingMode::Degraded, "transport disconnect")
            }
            OperatingMode::Degraded if state.disconnects.len() >= DISCONNECT_THRESHOLD => {
                transition(&mut state, OperatingMode::Minimal, "repeated disconnects")
            }
            _ => None,
        }
    }

    /// The transport came back. Clean-stretch timing restarts here; the
    /// mode itself only improves after the hysteresis window.
    pub fn record_reconnect(&self) {
        let mut state = self.state.lock();
        state.clean_since = Instant::now();
    }

    /// A signal arrived.
    pub fn record_signal(&self) {
        let mut state = self.state.lock();
        state.last_signal = Some(Instant::now());
    }

    /// Periodic evaluation: silence worsens the mode, a long-enough clean
    /// stretch improves it one level.
    pub fn evaluate(&self) -> Option<ModeChange> {
        let mut state = self.state.lock();
        let now = Instant::now();

        if state.mode == OperatingMode::Minimal {
            let silent_for = state
                .last_signal
                .map(|at| now.duration_since(at))
                .unwrap_or(OFFLINE_SILENCE);
            if silent_for >= OFFLINE_SILENCE {
                return transition(&mut state, OperatingMode::Offline, "prolonged silence");
            }
        }

        if state.mode != OperatingMode::Normal
            && now.duration_since(state.clean_since) >= HYSTERESIS
        {
            let recovered = match state.mode {
                OperatingMode::Offline => OperatingMode::Minimal,
                OperatingMode::Minimal => OperatingMode::Degraded,
                OperatingMode::Degraded => OperatingMode::Normal,
                OperatingMode::Normal => unreachable!(),
            };
            state.clean_since = now;
            return transition(&mut state, recovered, "clean operation");
        }
        None
    }
}

fn prune(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = events.front() {
        if now.duration_since(*front) > window {
            events.pop_front();
        } else {
            break;
        }
    }
}

fn transition(state: &mut ModeState, to: OperatingMode, reason: &str) -> Option<ModeChange> {
    let from = state.mode;
    if from == to {
        return None;
    }
    state.mode = to;
    if to == OperatingMode::Normal {
        info!(from = %from, to = %to, reason, "operating mode recovered");
    } else {
        warn!(from = %from, to = %to, reason, "operating mode changed");
    }
    Some(ModeChange {
        from,
        to,
        reason: reason.to_string(),
    })
}
