// =============================================================================
// Shared types used across the Vectra event pipeline
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Derived game-lifecycle label for a single broadcast frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Presale,
    ActiveGameplay,
    RugEvent1,
    RugEvent2,
    Cooldown,
    Unknown,
}

impl Phase {
    /// Phases during which trade submission is rejected outright.
    pub fn is_blocked_for_trading(self) -> bool {
        matches!(
            self,
            Self::Cooldown | Self::RugEvent1 | Self::RugEvent2 | Self::Unknown
        )
    }
}

impl Default for Phase {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Presale => write!(f, "PRESALE"),
            Self::ActiveGameplay => write!(f, "ACTIVE_GAMEPLAY"),
            Self::RugEvent1 => write!(f, "RUG_EVENT_1"),
            Self::RugEvent2 => write!(f, "RUG_EVENT_2"),
            Self::Cooldown => write!(f, "COOLDOWN"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// The nine-field signal extracted from every `gameStateUpdate` frame, plus
/// classification metadata stamped by the ingestor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSignal {
    pub game_id: String,
    pub active: bool,
    pub rugged: bool,
    pub tick: u64,
    pub price: Decimal,
    pub cooldown_timer: u32,
    pub allow_pre_round_buys: bool,
    pub trade_count: u32,
    /// Phase derived by the classifier for this frame.
    pub phase: Phase,
    /// False when the frame failed field validation or arrived via an
    /// unexpected phase transition. Invalid frames still propagate.
    pub is_valid: bool,
    /// Receive instant, UTC epoch milliseconds.
    pub timestamp_ms: u64,
    /// Handler processing latency in milliseconds (not network latency).
    pub latency_ms: f64,
}

/// Coarse connection-health label derived from observed feed behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionHealth {
    Healthy,
    Degraded,
    Minimal,
    Offline,
}

impl std::fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Minimal => write!(f, "MINIMAL"),
            Self::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Operating mode surfaced to strategy and UI consumers. Transitions are
/// managed by the degradation manager, not by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    Normal,
    Degraded,
    Minimal,
    Offline,
}

impl Default for OperatingMode {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Minimal => write!(f, "MINIMAL"),
            Self::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Where a stored event entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Cdp,
    PublicWs,
    Replay,
    Ui,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cdp => write!(f, "cdp"),
            Self::PublicWs => write!(f, "public_ws"),
            Self::Replay => write!(f, "replay"),
            Self::Ui => write!(f, "ui"),
        }
    }
}

/// Wire direction of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Received => write!(f, "received"),
        }
    }
}

/// Partition key for the event store. One parquet directory per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    WsEvent,
    GameTick,
    PlayerAction,
    ServerState,
    System,
    Trade,
}

impl DocType {
    pub const ALL: [DocType; 6] = [
        DocType::WsEvent,
        DocType::GameTick,
        DocType::PlayerAction,
        DocType::ServerState,
        DocType::System,
        DocType::Trade,
    ];
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WsEvent => write!(f, "ws_event"),
            Self::GameTick => write!(f, "game_tick"),
            Self::PlayerAction => write!(f, "player_action"),
            Self::ServerState => write!(f, "server_state"),
            Self::System => write!(f, "system"),
            Self::Trade => write!(f, "trade"),
        }
    }
}

/// Player identity confirmation, sent once per authenticated connection.
/// Absence of this event means the session is unauthenticated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsernameStatus {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, rename = "hasUsername")]
    pub has_username: bool,
}

impl UsernameStatus {
    pub fn is_authenticated(&self) -> bool {
        !self.id.is_empty()
    }

    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or("Anonymous")
    }
}

/// Server-authoritative player state, sent after each server-side trade.
/// Local calculations are verified against this, never the other way round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerUpdate {
    #[serde(default, deserialize_with = "decimal_from_json")]
    pub cash: Decimal,
    #[serde(default, rename = "cumulativePnL", deserialize_with = "decimal_from_json")]
    pub cumulative_pnl: Decimal,
    #[serde(default, rename = "positionQty", deserialize_with = "decimal_from_json")]
    pub position_qty: Decimal,
    #[serde(default, rename = "avgCost", deserialize_with = "decimal_from_json")]
    pub avg_cost: Decimal,
    #[serde(default, rename = "totalInvested", deserialize_with = "decimal_from_json")]
    pub total_invested: Decimal,
}

impl PlayerUpdate {
    pub fn has_position(&self) -> bool {
        self.position_qty > Decimal::ZERO
    }
}

/// Convert a JSON number to `Decimal` through a string round-trip so that
/// binary-float representation error never reaches a money path.
pub fn decimal_from_f64(value: f64) -> Decimal {
    Decimal::from_str(&value.to_string()).unwrap_or(Decimal::ZERO)
}

/// Extract a decimal from a JSON value that may be a number, a string, or
/// absent. Missing and malformed values fall back to `default`.
pub fn decimal_from_value(value: Option<&serde_json::Value>, default: Decimal) -> Decimal {
    match value {
        Some(serde_json::Value::Number(n)) => match n.as_f64() {
            Some(f) => decimal_from_f64(f),
            None => default,
        },
        Some(serde_json::Value::String(s)) => Decimal::from_str(s).unwrap_or(default),
        _ => default,
    }
}

fn decimal_from_json<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(decimal_from_value(Some(&value), Decimal::ZERO))
}

/// UTC now as epoch milliseconds.
pub fn epoch_ms_now() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Format an epoch-milliseconds timestamp as an RFC 3339 string.
pub fn format_epoch_ms(ts_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn decimal_round_trips_through_string() {
        // 0.1 is not representable in binary; the string round-trip must
        // yield the exact decimal the JSON text carried.
        assert_eq!(decimal_from_f64(0.1), dec!(0.1));
        assert_eq!(decimal_from_f64(2.37), dec!(2.37));
        assert_eq!(decimal_from_f64(0.000001), dec!(0.000001));
    }

    #[test]
    fn decimal_from_value_handles_shapes() {
        let n: serde_json::Value = serde_json::json!(1.25);
        let s: serde_json::Value = serde_json::json!("3.5");
        assert_eq!(decimal_from_value(Some(&n), Decimal::ZERO), dec!(1.25));
        assert_eq!(decimal_from_value(Some(&s), Decimal::ZERO), dec!(3.5));
        assert_eq!(decimal_from_value(None, dec!(1.0)), dec!(1.0));
    }

    #[test]
    fn player_update_parses_camel_case() {
        let raw = r#"{"cash": 3.967072345, "cumulativePnL": 0.264879755,
                      "positionQty": 0.2222919, "avgCost": 1.259605046,
                      "totalInvested": 0.251352892}"#;
        let update: PlayerUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(update.cash, dec!(3.967072345));
        assert_eq!(update.position_qty, dec!(0.2222919));
        assert!(update.has_position());
    }

    #[test]
    fn blocked_phases() {
        assert!(Phase::Cooldown.is_blocked_for_trading());
        assert!(Phase::RugEvent1.is_blocked_for_trading());
        assert!(Phase::RugEvent2.is_blocked_for_trading());
        assert!(Phase::Unknown.is_blocked_for_trading());
        assert!(!Phase::Presale.is_blocked_for_trading());
        assert!(!Phase::ActiveGameplay.is_blocked_for_trading());
    }
}
