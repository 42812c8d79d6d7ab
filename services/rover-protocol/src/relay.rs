use crate::command::Command;

/// Text liveness probe understood on the relay endpoint.
pub const PING: &str = "ping";
/// Reply to [`PING`].
pub const PONG: &str = "pong";

/// Path of the relay WebSocket endpoint.
pub const RELAY_PATH: &str = "/auto-control";

/// What a text payload on the relay channel means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPayload {
    Ping,
    Pong,
    Command(Command),
    Empty,
    Unrecognized,
}

impl RelayPayload {
    pub fn classify(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Self::Empty;
        }
        if text == PING {
            return Self::Ping;
        }
        if text == PONG {
            return Self::Pong;
        }
        match text.parse::<Command>() {
            Ok(cmd) => Self::Command(cmd),
            Err(_) => Self::Unrecognized,
        }
    }
}

/// Strip any URL scheme and trailing slashes, leaving `host[:port][/path]`.
pub fn normalize_host(raw: &str) -> String {
    let mut host = raw.trim();
    for scheme in ["https://", "http://", "wss://", "ws://"] {
        if let Some(rest) = host.strip_prefix(scheme) {
            host = rest;
            break;
        }
    }
    host.trim_end_matches('/').to_string()
}

fn is_local(host: &str) -> bool {
    host.starts_with("localhost") || host.starts_with("127.0.0.1")
}

/// Full relay endpoint URL for a public host. Local hosts are plain `ws://`.
pub fn relay_url(host: &str) -> String {
    let host = normalize_host(host);
    let scheme = if is_local(&host) { "ws" } else { "wss" };
    format!("{scheme}://{host}{RELAY_PATH}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(RelayPayload::classify("ping"), RelayPayload::Ping);
        assert_eq!(RelayPayload::classify(" pong\n"), RelayPayload::Pong);
        assert_eq!(
            RelayPayload::classify("L"),
            RelayPayload::Command(Command::Left)
        );
        assert_eq!(RelayPayload::classify("   "), RelayPayload::Empty);
        assert_eq!(RelayPayload::classify("Z"), RelayPayload::Unrecognized);
        assert_eq!(RelayPayload::classify("PING"), RelayPayload::Unrecognized);
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("https://abc.ngrok.app/"), "abc.ngrok.app");
        assert_eq!(normalize_host("wss://abc.ngrok.app//"), "abc.ngrok.app");
        assert_eq!(normalize_host("localhost:3000"), "localhost:3000");
    }

    #[test]
    fn test_relay_url() {
        assert_eq!(
            relay_url("https://abc.ngrok.app"),
            "wss://abc.ngrok.app/auto-control"
        );
        assert_eq!(
            relay_url("localhost:3000"),
            "ws://localhost:3000/auto-control"
        );
        assert_eq!(
            relay_url("http://127.0.0.1:8080/"),
            "ws://127.0.0.1:8080/auto-control"
        );
    }
}
