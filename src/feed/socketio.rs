// =============================================================================
// Socket.IO wire codec — Engine.IO framing over a raw WebSocket
// =============================================================================
//
// The upstream speaks Socket.IO; each WebSocket text frame is an Engine.IO
// packet whose first byte is the packet type:
//
//   0  open (handshake JSON: sid, pingInterval, pingTimeout)
//   1  close
//   2  ping            -> we answer "3"
//   3  pong
//   4  message         -> a Socket.IO packet follows:
//        40      namespace connect ack
//        41      namespace disconnect
//        42[...] event: JSON array of [name, args...]
//        43[...] ack
//
// Unknown frames are preserved rather than rejected so the catch-all path
// can persist them.
// =============================================================================

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

/// Engine.IO handshake payload.
#[derive(Debug, Clone)]
pub struct OpenPacket {
    pub sid: String,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
}

/// A decoded Socket.IO packet (the `4`-prefixed message family).
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect,
    Disconnect,
    Event { name: String, args: Vec<Value> },
    Ack(Vec<Value>),
    ConnectError(Value),
    Unknown(String),
}

/// A decoded Engine.IO frame.
#[derive(Debug, Clone)]
pub enum EngineFrame {
    Open(OpenPacket),
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Noop,
    Unknown(String),
}

/// Decode one WebSocket text frame.
pub fn parse_frame(text: &str) -> Result<EngineFrame> {
    let mut chars = text.chars();
    let Some(kind) = chars.next() else {
        return Ok(EngineFrame::Unknown(String::new()));
    };
    let rest = chars.as_str();

    match kind {
        '0' => parse_open(rest).map(EngineFrame::Open),
        '1' => Ok(EngineFrame::Close),
        '2' => Ok(EngineFrame::Ping),
        '3' => Ok(EngineFrame::Pong),
        '4' => Ok(EngineFrame::Message(parse_socket_packet(rest)?)),
        '6' => Ok(EngineFrame::Noop),
        _ => Ok(EngineFrame::Unknown(text.to_string())),
    }
}

fn parse_open(body: &str) -> Result<OpenPacket> {
    let value: Value = serde_json::from_str(body).context("malformed open packet")?;
    let sid = value
        .get("sid")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("open packet missing sid"))?
        .to_string();
    Ok(OpenPacket {
        sid,
        ping_interval_ms: value
            .get("pingInterval")
            .and_then(|v| v.as_u64())
            .unwrap_or(25_000),
        ping_timeout_ms: value
            .get("pingTimeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(20_000),
    })
}

fn parse_socket_packet(body: &str) -> Result<SocketPacket> {
    let mut chars = body.chars();
    let Some(kind) = chars.next() else {
        return Ok(SocketPacket::Unknown(String::new()));
    };

    match kind {
        '0' => Ok(SocketPacket::Connect),
        '1' => Ok(SocketPacket::Disconnect),
        '2' => parse_event(chars.as_str()),
        '3' => Ok(SocketPacket::Ack(parse_json_array(chars.as_str()).unwrap_or_default())),
        '4' => {
            let payload = serde_json::from_str(chars.as_str()).unwrap_or(Value::Null);
            Ok(SocketPacket::ConnectError(payload))
        }
        _ => Ok(SocketPacket::Unknown(body.to_string())),
    }
}

/// Parse `42` event bodies, tolerating an optional namespace and ack id
/// prefix (`42/nsp,17["name", {...}]`).
fn parse_event(body: &str) -> Result<SocketPacket> {
    let array_start = body
        .find('[')
        .ok_or_else(|| anyhow!("event packet without array body"))?;
    let mut args = parse_json_array(&body[array_start..])
        .context("malformed event array")?;
    if args.is_empty() {
        return Err(anyhow!("event packet with empty array"));
    }
    let name = match args.remove(0) {
        Value::String(name) => name,
        other => return Err(anyhow!("event name is not a string: {other}")),
    };
    Ok(SocketPacket::Event { name, args })
}

fn parse_json_array(text: &str) -> Result<Vec<Value>> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => Ok(items),
        other => Err(anyhow!("expected JSON array, got {other}")),
    }
}

/// Encoded pong reply to a server ping.
pub fn pong_frame() -> &'static str {
    "3"
}

/// Encoded default-namespace connect request.
pub fn connect_frame() -> &'static str {
    "40"
}

/// Encode an outbound event on the default namespace.
pub fn encode_event(name: &str, payload: &Value) -> String {
    format!("42{}", Value::Array(vec![Value::String(name.into()), payload.clone()]))
}

/// Derive the WebSocket endpoint from the configured upstream URL,
/// preserving its query string (the upstream keys on `frontend-version`).
pub fn websocket_url(upstream_url: &str) -> Result<String> {
    let (scheme, rest) = upstream_url
        .split_once("://")
        .ok_or_else(|| anyhow!("upstream URL missing scheme: {upstream_url}"))?;
    let ws_scheme = match scheme {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(anyhow!("unsupported upstream scheme: {other}")),
    };
    let (host, query) = match rest.split_once('?') {
        Some((host, query)) => (host.trim_end_matches('/'), Some(query)),
        None => (rest.trim_end_matches('/'), None),
    };
    let mut url = format!("{ws_scheme}://{host}/socket.io/?EIO=4&transport=websocket");
    if let Some(query) = query {
        url.push('&');
        url.push_str(query);
    }
    Ok(url)
}

/// Derive the HTTP polling endpoint used as a handshake fallback when the
/// direct WebSocket upgrade fails.
pub fn polling_url(upstream_url: &str) -> Result<String> {
    let (scheme, rest) = upstream_url
        .split_once("://")
        .ok_or_else(|| anyhow!("upstream URL missing scheme: {upstream_url}"))?;
    let http_scheme = match scheme {
        "https" | "wss" => "https",
        "http" | "ws" => "http",
        other => return Err(anyhow!("unsupported upstream scheme: {other}")),
    };
    let (host, query) = match rest.split_once('?') {
        Some((host, query)) => (host.trim_end_matches('/'), Some(query)),
        None => (rest.trim_end_matches('/'), None),
    };
    let mut url = format!("{http_scheme}://{host}/socket.io/?EIO=4&transport=polling");
    if let Some(query) = query {
        url.push('&');
        url.push_str(query);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_open_packet() {
        let frame = parse_frame(r#"0{"sid":"abc123","pingInterval":25000,"pingTimeout":20000}"#)
            .unwrap();
        match frame {
            EngineFrame::Open(open) => {
                assert_eq!(open.sid, "abc123");
                assert_eq!(open.ping_interval_ms, 25_000);
            }
            other => panic!("expected open frame, got {other:?}"),
        }
    }

    #[test]
    fn parses_ping_and_connect_ack() {
        assert!(matches!(parse_frame("2").unwrap(), EngineFrame::Ping));
        assert!(matches!(
            parse_frame("40").unwrap(),
            EngineFrame::Message(SocketPacket::Connect)
        ));
    }

    #[test]
    fn parses_event_frame() {
        let frame = parse_frame(r#"42["gameStateUpdate",{"gameId":"g1","price":1.5}]"#).unwrap();
        match frame {
            EngineFrame::Message(SocketPacket::Event { name, args }) => {
                assert_eq!(name, "gameStateUpdate");
                assert_eq!(args.len(), 1);
                assert_eq!(args[0]["gameId"], json!("g1"));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn parses_event_with_trace_argument() {
        // usernameStatus arrives as 42["usernameStatus", {trace}, {payload}]
        let frame =
            parse_frame(r#"42["usernameStatus",{"__trace":true},{"id":"did:x","hasUsername":true}]"#)
                .unwrap();
        match frame {
            EngineFrame::Message(SocketPacket::Event { name, args }) => {
                assert_eq!(name, "usernameStatus");
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn parses_event_with_ack_id_prefix() {
        let frame = parse_frame(r#"4217["buyOrder",{"ok":true}]"#).unwrap();
        match frame {
            EngineFrame::Message(SocketPacket::Event { name, .. }) => {
                assert_eq!(name, "buyOrder");
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn malformed_event_is_error() {
        assert!(parse_frame("42{not-an-array}").is_err());
        assert!(parse_frame("42[]").is_err());
    }

    #[test]
    fn unknown_frame_is_preserved() {
        match parse_frame("9zzz").unwrap() {
            EngineFrame::Unknown(raw) => assert_eq!(raw, "9zzz"),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn encodes_outbound_event() {
        let encoded = encode_event("buyOrder", &json!({"amount": "0.01"}));
        assert!(encoded.starts_with("42["));
        assert!(encoded.contains("buyOrder"));
    }

    #[test]
    fn websocket_url_preserves_query() {
        let url = websocket_url("https://backend.rugs.fun?frontend-version=1.0").unwrap();
        assert_eq!(
            url,
            "wss://backend.rugs.fun/socket.io/?EIO=4&transport=websocket&frontend-version=1.0"
        );
    }

    #[test]
    fn polling_url_uses_http_scheme() {
        let url = polling_url("wss://backend.rugs.fun").unwrap();
        assert_eq!(url, "https://backend.rugs.fun/socket.io/?EIO=4&transport=polling");
    }
}
