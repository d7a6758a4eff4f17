// =============================================================================
// Feed ingestor — upstream Socket.IO client and signal pipeline
// =============================================================================
//
// Owns the network task. Each received frame is timestamped, gap-checked,
// rate-limited (critical events bypass), converted to a `GameSignal` with
// decimal prices, classified, and published:
//
//   - every upstream event, known or unknown, as `WsRaw` (persisted verbatim)
//   - typed `GameStart` / `GameTick` / `GameEnd` / `RugDetected` on the
//     relevant phases
//   - authenticated `usernameStatus` / `playerUpdate` as typed events
//
// Reconnects use exponential backoff from 1 s to 10 s, at most 10 attempts;
// exhaustion is an unrecoverable upstream error surfaced to the caller.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::Config;
use crate::events::{BusEvent, WsRawEvent};
use crate::feed::degradation::DegradationManager;
use crate::feed::monitors::{ConnectionHealthMonitor, LatencySpikeDetector};
use crate::feed::rate_limit::PriorityRateLimiter;
use crate::feed::socketio::{self, EngineFrame, SocketPacket};
use crate::phase::{PhaseClassifier, SignalFields};
use crate::types::{
    decimal_from_value, epoch_ms_now, Direction, EventSource, GameSignal, Phase, PlayerUpdate,
    UsernameStatus,
};

/// Handshake deadline for the initial WebSocket upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
/// Reconnect backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// An inter-tick gap beyond this resets the latency baseline instead of
/// feeding the spike detector.
const MAX_REASONABLE_GAP_MS: f64 = 5_000.0;
/// Cadence of background mode evaluation while the stream is quiet.
const EVALUATE_INTERVAL: Duration = Duration::from_millis(250);

/// Lock-free ingest counters.
#[derive(Default)]
pub struct FeedMetrics {
    pub total_signals: AtomicU64,
    pub total_ticks: AtomicU64,
    pub total_games: AtomicU64,
    pub noise_filtered: AtomicU64,
    pub rate_limited: AtomicU64,
    pub latency_spikes: AtomicU64,
    pub errors: AtomicU64,
    pub phase_transitions: AtomicU64,
    pub anomalies: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedMetricsSnapshot {
    pub total_signals: u64,
    pub total_ticks: u64,
    pub total_games: u64,
    pub noise_filtered: u64,
    pub rate_limited: u64,
    pub latency_spikes: u64,
    pub errors: u64,
    pub phase_transitions: u64,
    pub anomalies: u64,
}

impl FeedMetrics {
    pub fn snapshot(&self) -> FeedMetricsSnapshot {
        FeedMetricsSnapshot {
            total_signals: self.total_signals.load(Ordering::Relaxed),
            total_ticks: self.total_ticks.load(Ordering::Relaxed),
            total_games: self.total_games.load(Ordering::Relaxed),
            noise_filtered: self.noise_filtered.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            latency_spikes: self.latency_spikes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            phase_transitions: self.phase_transitions.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
        }
    }
}

enum StreamExit {
    Shutdown,
    Dropped(Option<String>),
}

pub struct FeedIngestor {
    upstream_url: String,
    bus: Arc<EventBus>,
    classifier: Mutex<PhaseClassifier>,
    rate_limiter: PriorityRateLimiter,
    pub health: ConnectionHealthMonitor,
    pub spike_detector: LatencySpikeDetector,
    pub degradation: Arc<DegradationManager>,
    pub metrics: FeedMetrics,
    last_signal: Mutex<Option<GameSignal>>,
    last_tick_instant: Mutex<Option<Instant>>,
}

impl FeedIngestor {
    pub fn new(config: &Config, bus: Arc<EventBus>, degradation: Arc<DegradationManager>) -> Self {
        Self {
            upstream_url: config.upstream_url.clone(),
            bus,
            classifier: Mutex::new(PhaseClassifier::new(config.rug_pair_window_ms)),
            rate_limiter: PriorityRateLimiter::new(config.rate_limit),
            health: ConnectionHealthMonitor::new(),
            spike_detector: LatencySpikeDetector::new(),
            degradation,
            metrics: FeedMetrics::default(),
            last_signal: Mutex::new(None),
            last_tick_instant: Mutex::new(None),
        }
    }

    /// Most recent classified signal, if any.
    pub fn last_signal(&self) -> Option<GameSignal> {
        self.last_signal.lock().clone()
    }

    pub fn rate_limiter_snapshot(&self) -> crate::feed::rate_limit::RateLimiterSnapshot {
        self.rate_limiter.snapshot()
    }

    /// Run the connect/stream/reconnect loop until shutdown is signalled or
    /// reconnect attempts are exhausted (unrecoverable upstream error).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.connect_and_stream(&mut shutdown, attempt).await {
                Ok(StreamExit::Shutdown) => {
                    self.health.set_connected(false);
                    return Ok(());
                }
                Ok(StreamExit::Dropped(reason)) => {
                    // A connection was established, so the outage counter
                    // starts fresh.
                    attempt = 0;
                    self.on_disconnect(reason).await;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "feed connection failed");
                    self.on_disconnect(Some(e.to_string())).await;
                }
            }

            attempt += 1;
            if attempt > MAX_RECONNECT_ATTEMPTS {
                error!(attempts = attempt - 1, "reconnect attempts exhausted");
                return Err(anyhow!("upstream unrecoverable: reconnect attempts exhausted"));
            }

            let backoff = backoff_delay(attempt);
            warn!(attempt, backoff_ms = backoff.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn on_disconnect(&self, reason: Option<String>) {
        self.health.set_connected(false);
        // Stale pairing and latency history must not poison the next
        // connection.
        self.classifier.lock().recover_from_disconnect();
        self.spike_detector.reset();
        *self.last_tick_instant.lock() = None;
        if let Some(change) = self.degradation.record_disconnect() {
            let _ = self.bus.publish(BusEvent::ModeChanged(change));
        }
        let _ = self.bus.publish(BusEvent::FeedDisconnected { reason });
    }

    async fn connect_and_stream(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        attempt: u32,
    ) -> Result<StreamExit> {
        let ws_url = socketio::websocket_url(&self.upstream_url)?;
        info!(url = %ws_url, attempt, "connecting to upstream feed");

        let connect = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(&ws_url)).await;
        let (ws_stream, _response) = match connect {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                // Direct upgrade failed; try the polling handshake to obtain
                // a session id, then upgrade with it.
                warn!(error = %e, "websocket upgrade failed, trying polling handshake");
                let sid = self.polling_handshake().await?;
                let sid_url = format!("{ws_url}&sid={sid}");
                tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(&sid_url))
                    .await
                    .context("handshake timed out")?
                    .context("websocket upgrade after polling handshake failed")?
            }
            Err(_) => return Err(anyhow!("handshake timed out after {HANDSHAKE_TIMEOUT:?}")),
        };

        let (mut write, mut read) = ws_stream.split();
        // Socket.IO expects an explicit default-namespace connect.
        write
            .send(Message::Text(socketio::connect_frame().into()))
            .await
            .context("failed to send namespace connect")?;

        self.health.set_connected(true);
        if attempt > 0 {
            self.degradation.record_reconnect();
            let _ = self.bus.publish(BusEvent::FeedReconnected { attempt });
            info!(attempt, "reconnected to upstream feed");
        }

        let mut evaluate = tokio::time::interval(EVALUATE_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(StreamExit::Shutdown);
                    }
                }
                _ = evaluate.tick() => {
                    if let Some(change) = self.degradation.evaluate() {
                        let _ = self.bus.publish(BusEvent::ModeChanged(change));
                    }
                }
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_frame(&text) {
                                write
                                    .send(Message::Text(reply.into()))
                                    .await
                                    .context("failed to send frame reply")?;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            write.send(Message::Pong(payload)).await.ok();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Ok(StreamExit::Dropped(
                                frame.map(|f| f.reason.to_string()),
                            ));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                            return Ok(StreamExit::Dropped(Some(e.to_string())));
                        }
                        None => return Ok(StreamExit::Dropped(Some("stream ended".into()))),
                    }
                }
            }
        }
    }

    async fn polling_handshake(&self) -> Result<String> {
        let url = socketio::polling_url(&self.upstream_url)?;
        let body = reqwest::Client::new()
            .get(&url)
            .timeout(HANDSHAKE_TIMEOUT)
            .send()
            .await
            .context("polling handshake request failed")?
            .text()
            .await
            .context("polling handshake body unreadable")?;
        match socketio::parse_frame(strip_length_prefix(&body))? {
            EngineFrame::Open(open) => Ok(open.sid),
            other => Err(anyhow!("unexpected polling handshake frame: {other:?}")),
        }
    }

    /// Decode one text frame; returns an encoded reply when the protocol
    /// requires one (pong).
    fn handle_frame(&self, text: &str) -> Option<&'static str> {
        match socketio::parse_frame(text) {
            Ok(EngineFrame::Ping) => return Some(socketio::pong_frame()),
            Ok(EngineFrame::Open(open)) => {
                debug!(sid = %open.sid, ping_interval_ms = open.ping_interval_ms, "engine.io open");
            }
            Ok(EngineFrame::Message(SocketPacket::Connect)) => {
                info!("socket.io namespace connected");
                let _ = self.bus.publish(BusEvent::FeedConnected { socket_id: None });
            }
            Ok(EngineFrame::Message(SocketPacket::Event { name, args })) => {
                self.handle_event(&name, &args);
            }
            Ok(EngineFrame::Message(SocketPacket::ConnectError(payload))) => {
                warn!(payload = %payload, "socket.io connect error");
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "failed to parse upstream frame");
            }
        }
        None
    }

    /// Catch-all event path: every upstream event is preserved as a raw bus
    /// event; known names additionally get typed handling.
    fn handle_event(&self, name: &str, args: &[serde_json::Value]) {
        // The payload is the last argument; auth events prepend a trace blob.
        let payload = args.last().cloned().unwrap_or(serde_json::Value::Null);

        if self.bus.has_subscribers(crate::events::EventKind::WsRaw) {
            let _ = self.bus.publish(BusEvent::WsRaw(WsRawEvent {
                name: name.to_string(),
                payload: payload.clone(),
                source: EventSource::PublicWs,
                direction: Direction::Received,
                timestamp_ms: epoch_ms_now(),
            }));
        }

        match name {
            "gameStateUpdate" => self.handle_game_state_update(&payload),
            "usernameStatus" => match serde_json::from_value::<UsernameStatus>(payload) {
                Ok(status) => {
                    info!(player_id = %status.id, username = %status.display_name(), "player identity confirmed");
                    let _ = self.bus.publish(BusEvent::PlayerIdentity(status));
                }
                Err(e) => {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "malformed usernameStatus payload");
                }
            },
            "playerUpdate" => match serde_json::from_value::<PlayerUpdate>(payload) {
                Ok(update) => {
                    let _ = self.bus.publish(BusEvent::PlayerUpdated(update));
                }
                Err(e) => {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "malformed playerUpdate payload");
                }
            },
            _ => {
                // Known-noise and unknown events alike: already preserved
                // above, only counted here.
                self.metrics.noise_filtered.fetch_add(1, Ordering::Relaxed);
                debug!(event = name, "noise event recorded");
            }
        }
    }

    fn handle_game_state_update(&self, payload: &serde_json::Value) {
        let receive_instant = Instant::now();
        let receive_ms = epoch_ms_now();

        // Inter-tick interval bookkeeping. A gap past the threshold resets
        // the baseline instead of polluting the spike window.
        let interval_ms = {
            let mut last = self.last_tick_instant.lock();
            let interval = last.map(|at| at.elapsed().as_secs_f64() * 1_000.0);
            *last = Some(receive_instant);
            interval
        };
        if let Some(interval) = interval_ms {
            if interval > MAX_REASONABLE_GAP_MS {
                info!(gap_ms = interval as u64, "large gap detected, resetting latency baseline");
                self.spike_detector.reset();
            } else if let Some(spike) = self.spike_detector.record(interval) {
                self.metrics.latency_spikes.fetch_add(1, Ordering::Relaxed);
                warn!(reason = %spike.reason, "latency spike detected");
                if let Some(change) = self.degradation.record_spike() {
                    let _ = self.bus.publish(BusEvent::ModeChanged(change));
                }
                let _ = self.bus.publish(BusEvent::LatencySpike(spike));
            }
        }

        self.health.record_signal();
        self.degradation.record_signal();

        let fields = SignalFields {
            game_id: payload
                .get("gameId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            active: payload.get("active").and_then(|v| v.as_bool()).unwrap_or(false),
            rugged: payload.get("rugged").and_then(|v| v.as_bool()).unwrap_or(false),
            tick: payload.get("tickCount").and_then(|v| v.as_u64()).unwrap_or(0),
            cooldown_timer: payload
                .get("cooldownTimer")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            allow_pre_round_buys: payload
                .get("allowPreRoundBuys")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        };

        // Rug signals and game-end markers must survive any flood.
        let critical = fields.rugged || (!fields.active && fields.cooldown_timer > 0);
        if !self.rate_limiter.should_process(critical) {
            let limited = self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed) + 1;
            if limited % 100 == 1 {
                let snapshot = self.rate_limiter.snapshot();
                warn!(
                    dropped = limited,
                    drop_rate_pct = snapshot.drop_rate_pct,
                    "rate limiting active"
                );
            }
            return;
        }

        let classification = self.classifier.lock().classify(&fields, receive_ms);

        self.metrics.total_signals.fetch_add(1, Ordering::Relaxed);
        self.metrics.total_ticks.fetch_add(1, Ordering::Relaxed);
        if classification.phase != classification.previous_phase {
            self.metrics.phase_transitions.fetch_add(1, Ordering::Relaxed);
            info!(from = %classification.previous_phase, to = %classification.phase, "phase transition");
        }
        if !classification.is_valid {
            self.metrics.anomalies.fetch_add(1, Ordering::Relaxed);
        }

        let signal = GameSignal {
            game_id: fields.game_id.clone(),
            active: fields.active,
            rugged: fields.rugged,
            tick: fields.tick,
            price: decimal_from_value(payload.get("price"), rust_decimal::Decimal::ONE),
            cooldown_timer: fields.cooldown_timer,
            allow_pre_round_buys: fields.allow_pre_round_buys,
            trade_count: payload
                .get("tradeCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            phase: classification.phase,
            is_valid: classification.is_valid,
            timestamp_ms: receive_ms,
            latency_ms: receive_instant.elapsed().as_secs_f64() * 1_000.0,
        };

        *self.last_signal.lock() = Some(signal.clone());

        if classification.game_started {
            let _ = self.bus.publish(BusEvent::GameStart(signal.clone()));
        }
        if signal.phase == Phase::ActiveGameplay {
            let _ = self.bus.publish(BusEvent::GameTick(signal.clone()));
        }
        if classification.game_completed {
            self.metrics.total_games.fetch_add(1, Ordering::Relaxed);
            let _ = self.bus.publish(BusEvent::RugDetected(signal.clone()));
            let _ = self.bus.publish(BusEvent::GameEnd(signal.clone()));
        }
        if classification.phase != classification.previous_phase {
            let _ = self.bus.publish(BusEvent::PhaseChanged(crate::events::PhaseTransition {
                game_id: signal.game_id.clone(),
                previous: classification.previous_phase,
                current: classification.phase,
                tick: signal.tick,
            }));
        }
    }
}

/// Older Engine.IO polling responses carry a `<length>:` prefix before the
/// packet; strip it when present.
fn strip_length_prefix(body: &str) -> &str {
    if let Some(pos) = body.find(|c: char| !c.is_ascii_digit()) {
        if pos > 0 && body[pos..].starts_with(':') {
            return &body[pos + 1..];
        }
    }
    body
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_INITIAL.saturating_mul(1 << (attempt.saturating_sub(1)).min(4));
    exp.min(BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventKind;
    use clap::Parser;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> Config {
        Config::parse_from(["vectra", "--rate-limit", "100000"])
    }

    fn ingestor_with_bus() -> (Arc<FeedIngestor>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(10_000));
        bus.start();
        let ingestor = Arc::new(FeedIngestor::new(
            &test_config(),
            Arc::clone(&bus),
            Arc::new(DegradationManager::new()),
        ));
        (ingestor, bus)
    }

    fn game_frame(game_id: &str, active: bool, rugged: bool, tick: u64, price: f64) -> serde_json::Value {
        serde_json::json!({
            "gameId": game_id,
            "active": active,
            "rugged": rugged,
            "tickCount": tick,
            "price": price,
            "cooldownTimer": 0,
            "allowPreRoundBuys": false,
            "tradeCount": 3,
        })
    }

    fn wait_until(deadline_ms: u64, predicate: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }

    #[test]
    fn clean_game_emits_lifecycle_events() {
        let (ingestor, bus) = ingestor_with_bus();
        let starts = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::new(AtomicUsize::new(0));
        let ends = Arc::new(AtomicUsize::new(0));
        let (s, t, e) = (Arc::clone(&starts), Arc::clone(&ticks), Arc::clone(&ends));
        let _h1 = bus.subscribe(EventKind::GameStart, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let _h2 = bus.subscribe(EventKind::GameTick, move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });
        let _h3 = bus.subscribe(EventKind::GameEnd, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        ingestor.handle_event("gameStateUpdate", &[game_frame("g1", false, false, 0, 1.0)]);
        for tick in 1..=500u64 {
            ingestor.handle_event(
                "gameStateUpdate",
                &[game_frame("g1", true, false, tick, 1.0 + tick as f64 * 0.00274)],
            );
        }
        // Rug pair: completion side effects exactly once.
        ingestor.handle_event("gameStateUpdate", &[game_frame("g1", false, true, 500, 0.0)]);
        ingestor.handle_event("gameStateUpdate", &[game_frame("g1", false, true, 500, 0.0)]);

        assert!(wait_until(2000, || ends.load(Ordering::SeqCst) == 1));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(ticks.load(Ordering::SeqCst), 500);
        assert_eq!(ingestor.metrics.total_games.load(Ordering::Relaxed), 1);
        bus.stop();
    }

    #[test]
    fn signal_price_is_decimal_from_string() {
        let (ingestor, bus) = ingestor_with_bus();
        ingestor.handle_event("gameStateUpdate", &[game_frame("g1", true, false, 1, 2.37)]);
        let signal = ingestor.last_signal().expect("signal expected");
        assert_eq!(signal.price, dec!(2.37));
        assert_eq!(signal.trade_count, 3);
        bus.stop();
    }

    #[test]
    fn unknown_events_are_preserved_as_raw() {
        let (ingestor, bus) = ingestor_with_bus();
        let raw_names = Arc::new(Mutex::new(Vec::new()));
        let names = Arc::clone(&raw_names);
        let _h = bus.subscribe(EventKind::WsRaw, move |event| {
            if let BusEvent::WsRaw(raw) = event {
                names.lock().push(raw.name.clone());
            }
        });

        ingestor.handle_event("someWeirdLeaderboardThing", &[serde_json::json!({"x": 1})]);
        assert!(wait_until(2000, || raw_names.lock().len() == 1));
        assert_eq!(raw_names.lock()[0], "someWeirdLeaderboardThing");
        assert_eq!(ingestor.metrics.noise_filtered.load(Ordering::Relaxed), 1);
        bus.stop();
    }

    #[test]
    fn rug_frames_bypass_rate_limiting() {
        let bus = Arc::new(EventBus::new(10_000));
        bus.start();
        let config = Config::parse_from(["vectra", "--rate-limit", "1"]);
        let ingestor = FeedIngestor::new(&config, Arc::clone(&bus), Arc::new(DegradationManager::new()));

        // Flood with ordinary ticks until the bucket is dry.
        for tick in 0..50u64 {
            ingestor.handle_event("gameStateUpdate", &[game_frame("g1", true, false, tick, 1.0)]);
        }
        assert!(ingestor.metrics.rate_limited.load(Ordering::Relaxed) > 0);

        let games_before = ingestor.metrics.total_games.load(Ordering::Relaxed);
        ingestor.handle_event("gameStateUpdate", &[game_frame("g1", false, true, 50, 0.0)]);
        assert_eq!(
            ingestor.metrics.total_games.load(Ordering::Relaxed),
            games_before + 1,
            "critical rug frame must not be dropped"
        );
        bus.stop();
    }

    #[test]
    fn auth_events_publish_typed_payloads() {
        let (ingestor, bus) = ingestor_with_bus();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let _h = bus.subscribe(EventKind::PlayerUpdated, move |event| {
            if let BusEvent::PlayerUpdated(update) = event {
                sink.lock().push(update.clone());
            }
        });

        ingestor.handle_event(
            "playerUpdate",
            &[serde_json::json!({"cash": 3.967072345, "positionQty": 0.25})],
        );
        assert!(wait_until(2000, || updates.lock().len() == 1));
        assert_eq!(updates.lock()[0].cash, dec!(3.967072345));
        bus.stop();
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(10));
        assert_eq!(backoff_delay(10), Duration::from_secs(10));
    }
}
