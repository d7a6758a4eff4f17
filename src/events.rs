// =============================================================================
// Bus event model — one tagged variant per event kind
// =============================================================================
//
// Event identity is the `EventKind` discriminant; subscribers key on it.
// Payloads travel as `BusEvent` variants so consumers never reach into
// untyped maps. Unknown upstream events are preserved verbatim in `WsRaw`
// so the event store can persist them unchanged.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{
    Direction, DocType, EventSource, GameSignal, OperatingMode, Phase, PlayerUpdate,
    UsernameStatus,
};

/// Subscription key. Every `BusEvent` variant maps to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    // Game lifecycle
    GameStart,
    GameEnd,
    GameTick,
    RugDetected,
    PhaseChanged,
    TickUpdated,

    // Trading
    TradeBuy,
    TradeSell,
    TradeSidebet,
    TradeFailed,
    SellPercentageChanged,
    PositionReduced,
    SidebetResolved,

    // Server truth
    PlayerIdentity,
    PlayerUpdated,

    // Feed / transport
    WsRaw,
    FeedConnected,
    FeedDisconnected,
    FeedReconnected,
    ModeChanged,
    LatencySpike,

    // Recording / integrity
    IntegrityIssue,
    IntegrityRecovered,
    RecordingStateChanged,
    StoreIncident,
}

impl EventKind {
    /// Every kind, for subscribers that persist the full stream.
    pub const ALL: [EventKind; 25] = [
        EventKind::GameStart,
        EventKind::GameEnd,
        EventKind::GameTick,
        EventKind::RugDetected,
        EventKind::PhaseChanged,
        EventKind::TickUpdated,
        EventKind::TradeBuy,
        EventKind::TradeSell,
        EventKind::TradeSidebet,
        EventKind::TradeFailed,
        EventKind::SellPercentageChanged,
        EventKind::PositionReduced,
        EventKind::SidebetResolved,
        EventKind::PlayerIdentity,
        EventKind::PlayerUpdated,
        EventKind::WsRaw,
        EventKind::FeedConnected,
        EventKind::FeedDisconnected,
        EventKind::FeedReconnected,
        EventKind::ModeChanged,
        EventKind::LatencySpike,
        EventKind::IntegrityIssue,
        EventKind::IntegrityRecovered,
        EventKind::RecordingStateChanged,
        EventKind::StoreIncident,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::GameStart => "game.start",
            Self::GameEnd => "game.end",
            Self::GameTick => "game.tick",
            Self::RugDetected => "game.rug_detected",
            Self::PhaseChanged => "game.phase_changed",
            Self::TickUpdated => "game.tick_updated",
            Self::TradeBuy => "trade.buy",
            Self::TradeSell => "trade.sell",
            Self::TradeSidebet => "trade.sidebet",
            Self::TradeFailed => "trade.failed",
            Self::SellPercentageChanged => "trade.sell_percentage_changed",
            Self::PositionReduced => "trade.position_reduced",
            Self::SidebetResolved => "trade.sidebet_resolved",
            Self::PlayerIdentity => "player.identity",
            Self::PlayerUpdated => "player.update",
            Self::WsRaw => "ws.raw_event",
            Self::FeedConnected => "ws.connected",
            Self::FeedDisconnected => "ws.disconnected",
            Self::FeedReconnected => "ws.reconnected",
            Self::ModeChanged => "ws.mode_changed",
            Self::LatencySpike => "ws.latency_spike",
            Self::IntegrityIssue => "recorder.integrity_issue",
            Self::IntegrityRecovered => "recorder.integrity_recovered",
            Self::RecordingStateChanged => "recorder.state_changed",
            Self::StoreIncident => "store.incident",
        };
        write!(f, "{name}")
    }
}

/// A raw upstream frame, known or unknown, captured by the catch-all
/// listener. Always persisted verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRawEvent {
    /// Upstream event name (e.g. `gameStateUpdate`, or anything unknown).
    pub name: String,
    pub payload: serde_json::Value,
    pub source: EventSource,
    pub direction: Direction,
    pub timestamp_ms: u64,
}

/// Result payload published on every accepted trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub trade_id: String,
    pub game_id: String,
    pub tick: u64,
    pub price: Decimal,
    pub amount: Decimal,
    /// Set on partial sells.
    pub partial: bool,
    pub percentage: Option<Decimal>,
    pub remaining_amount: Option<Decimal>,
    pub pnl_sol: Option<Decimal>,
    pub pnl_percent: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub game_id: String,
    pub previous: Phase,
    pub current: Phase,
    pub tick: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellPercentageChange {
    pub old: Decimal,
    pub new: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidebetResolution {
    pub amount: Decimal,
    pub start_tick: u64,
    pub resolve_tick: u64,
    pub won: bool,
    /// Credited on win: 5x stake back (4x net profit).
    pub payout: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeChange {
    pub from: OperatingMode,
    pub to: OperatingMode,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySpikeInfo {
    pub interval_ms: f64,
    pub baseline_ms: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssueInfo {
    pub kind: String,
    pub details: String,
    pub game_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreIncidentInfo {
    pub doc_type: DocType,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingTransition {
    pub from: String,
    pub to: String,
    pub games_recorded: u32,
}

/// Every event that can flow through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusEvent {
    GameStart(GameSignal),
    GameEnd(GameSignal),
    GameTick(GameSignal),
    RugDetected(GameSignal),
    PhaseChanged(PhaseTransition),
    TickUpdated { tick: u64, price: Decimal },

    TradeBuy(TradeEvent),
    TradeSell(TradeEvent),
    TradeSidebet(TradeEvent),
    TradeFailed { action: String, reason: String },
    SellPercentageChanged(SellPercentageChange),
    PositionReduced(TradeEvent),
    SidebetResolved(SidebetResolution),

    PlayerIdentity(UsernameStatus),
    PlayerUpdated(PlayerUpdate),

    WsRaw(WsRawEvent),
    FeedConnected { socket_id: Option<String> },
    FeedDisconnected { reason: Option<String> },
    FeedReconnected { attempt: u32 },
    ModeChanged(ModeChange),
    LatencySpike(LatencySpikeInfo),

    IntegrityIssue(IntegrityIssueInfo),
    IntegrityRecovered,
    RecordingStateChanged(RecordingTransition),
    StoreIncident(StoreIncidentInfo),
}

impl BusEvent {
    /// The subscription key this event is delivered under.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::GameStart(_) => EventKind::GameStart,
            Self::GameEnd(_) => EventKind::GameEnd,
            Self::GameTick(_) => EventKind::GameTick,
            Self::RugDetected(_) => EventKind::RugDetected,
            Self::PhaseChanged(_) => EventKind::PhaseChanged,
            Self::TickUpdated { .. } => EventKind::TickUpdated,
            Self::TradeBuy(_) => EventKind::TradeBuy,
            Self::TradeSell(_) => EventKind::TradeSell,
            Self::TradeSidebet(_) => EventKind::TradeSidebet,
            Self::TradeFailed { .. } => EventKind::TradeFailed,
            Self::SellPercentageChanged(_) => EventKind::SellPercentageChanged,
            Self::PositionReduced(_) => EventKind::PositionReduced,
            Self::SidebetResolved(_) => EventKind::SidebetResolved,
            Self::PlayerIdentity(_) => EventKind::PlayerIdentity,
            Self::PlayerUpdated(_) => EventKind::PlayerUpdated,
            Self::WsRaw(_) => EventKind::WsRaw,
            Self::FeedConnected { .. } => EventKind::FeedConnected,
            Self::FeedDisconnected { .. } => EventKind::FeedDisconnected,
            Self::FeedReconnected { .. } => EventKind::FeedReconnected,
            Self::ModeChanged(_) => EventKind::ModeChanged,
            Self::LatencySpike(_) => EventKind::LatencySpike,
            Self::IntegrityIssue(_) => EventKind::IntegrityIssue,
            Self::IntegrityRecovered => EventKind::IntegrityRecovered,
            Self::RecordingStateChanged(_) => EventKind::RecordingStateChanged,
            Self::StoreIncident(_) => EventKind::StoreIncident,
        }
    }

    /// Partition the event store files this event lands in.
    pub fn doc_type(&self) -> DocType {
        match self {
            Self::GameTick(_) | Self::TickUpdated { .. } => DocType::GameTick,
            Self::TradeBuy(_)
            | Self::TradeSell(_)
            | Self::TradeSidebet(_)
            | Self::TradeFailed { .. }
            | Self::PositionReduced(_)
            | Self::SidebetResolved(_) => DocType::Trade,
            Self::SellPercentageChanged(_) => DocType::PlayerAction,
            Self::PlayerIdentity(_) | Self::PlayerUpdated(_) => DocType::ServerState,
            Self::WsRaw(_) => DocType::WsEvent,
            _ => DocType::System,
        }
    }
}
