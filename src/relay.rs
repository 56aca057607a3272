//! Relay endpoint helpers for MeshCentral `meshrelay.ashx` / `control.ashx`

use serde_json::{json, Value};

use crate::protocol::RELAY_PROTOCOL_FILES;

/// Percent-encode like `encodeURIComponent`
pub fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Normalize a server base (`host/path`, `https://host/path`, `wss://...`)
/// to a WebSocket URL without a trailing slash
pub fn ws_base(base: &str) -> String {
    let s = base.trim().trim_end_matches('/');
    let lower = s.to_ascii_lowercase();
    let (scheme, rest) = if let Some(r) = lower.strip_prefix("wss://") {
        ("wss", &s[s.len() - r.len()..])
    } else if let Some(r) = lower.strip_prefix("ws://") {
        ("ws", &s[s.len() - r.len()..])
    } else if let Some(r) = lower.strip_prefix("https://") {
        ("wss", &s[s.len() - r.len()..])
    } else if let Some(r) = lower.strip_prefix("http://") {
        ("ws", &s[s.len() - r.len()..])
    } else {
        ("wss", s)
    };
    format!("{}://{}", scheme, rest)
}

/// Data-tunnel URL the client opens for one relay session
pub fn relay_url(base: &str, node_id: &str, relay_id: &str, auth: &str) -> String {
    format!(
        "{}/meshrelay.ashx?browser=1&p={}&nodeid={}&id={}&auth={}",
        ws_base(base),
        RELAY_PROTOCOL_FILES,
        encode_component(node_id),
        encode_component(relay_id),
        encode_component(auth)
    )
}

/// Control-session URL used to obtain cookies and pair tunnels
pub fn control_url(base: &str, auth: Option<&str>) -> String {
    match auth {
        Some(a) if !a.is_empty() => format!(
            "{}/control.ashx?auth={}",
            ws_base(base),
            encode_component(a)
        ),
        _ => format!("{}/control.ashx", ws_base(base)),
    }
}

/// Relay path handed to the agent so it joins the same relay session
pub fn pairing_value(
    node_id: &str,
    relay_id: &str,
    relay_cookie: Option<&str>,
    domain_prefix: &str,
) -> String {
    let prefix = domain_prefix.trim_matches('/');
    let prefix = if prefix.is_empty() {
        String::new()
    } else {
        format!("{}/", prefix)
    };
    let rauth = relay_cookie
        .filter(|c| !c.is_empty())
        .map(|c| format!("&rauth={}", encode_component(c)))
        .unwrap_or_default();
    format!(
        "*/{}meshrelay.ashx?p={}&nodeid={}&id={}{}",
        prefix,
        RELAY_PROTOCOL_FILES,
        encode_component(node_id),
        encode_component(relay_id),
        rauth
    )
}

/// Control-session message asking the agent to open the tunnel
pub fn tunnel_request(node_id: &str, value: &str) -> Value {
    json!({"action": "msg", "type": "tunnel", "nodeid": node_id, "value": value})
}

pub fn new_relay_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_component() {
        assert_eq!(encode_component("node//abc$@"), "node%2F%2Fabc%24%40");
        assert_eq!(encode_component("a b+c"), "a%20b%2Bc");
        assert_eq!(encode_component("ok-_.!~*'()"), "ok-_.!~*'()");
    }

    #[test]
    fn test_ws_base() {
        assert_eq!(ws_base("https://mesh.example.com/"), "wss://mesh.example.com");
        assert_eq!(ws_base("http://localhost:8080/x"), "ws://localhost:8080/x");
        assert_eq!(ws_base("mesh.example.com/ws/tools"), "wss://mesh.example.com/ws/tools");
        assert_eq!(ws_base("WSS://Host"), "wss://Host");
    }

    #[test]
    fn test_relay_url() {
        let url = relay_url("https://mesh.io", "node//N1", "r1", "tok=");
        assert_eq!(
            url,
            "wss://mesh.io/meshrelay.ashx?browser=1&p=5&nodeid=node%2F%2FN1&id=r1&auth=tok%3D"
        );
        assert_eq!(control_url("mesh.io", None), "wss://mesh.io/control.ashx");
        assert_eq!(control_url("mesh.io", Some("a b")), "wss://mesh.io/control.ashx?auth=a%20b");
    }

    #[test]
    fn test_pairing_value() {
        assert_eq!(
            pairing_value("node//N1", "r1", Some("rc"), "/tenant/"),
            "*/tenant/meshrelay.ashx?p=5&nodeid=node%2F%2FN1&id=r1&rauth=rc"
        );
        assert_eq!(
            pairing_value("n", "r", None, ""),
            "*/meshrelay.ashx?p=5&nodeid=n&id=r"
        );
        let req = tunnel_request("n", "v");
        assert_eq!(req["type"], "tunnel");
        assert_eq!(new_relay_id().len(), 32);
    }
}
