use std::{net::SocketAddr, time::Duration};

use chrono::{DateTime, Utc};
use http::{header, HeaderMap, Method, Uri};
use serde::Serialize;
use tokio::time::Instant;

const FORWARDED_FOR: &str = "x-forwarded-for";
const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Identifier of an admitted request.
///
/// Identifiers strictly increase and are never reused within the lifetime of a process.
pub type RequestId = u64;

/// What the registry needs to know about a request in order to admit it.
#[derive(Clone, Debug)]
pub struct AdmissionRequest {
    /// Request method.
    pub method: Method,

    /// Request URI, as received.
    pub uri: Uri,

    /// Protocol version, for the access log.
    pub version: http::Version,

    /// Request headers.
    pub headers: HeaderMap,

    /// Transport-level peer address, if known.
    pub peer_addr: Option<SocketAddr>,
}

impl AdmissionRequest {
    /// Creates an admission request from the parts of an HTTP request.
    pub fn from_parts(parts: &http::request::Parts, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
            peer_addr,
        }
    }

    /// Returns `true` if the client asked to upgrade to a websocket.
    pub fn wants_websocket(&self) -> bool {
        self.headers
            .get(header::UPGRADE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
    }

    fn header_str(&self, name: impl header::AsHeaderName) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }
}

/// Client address and protocol, as derived at admission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientAddress {
    /// Client address: the transport address, or the trusted hop from `X-Forwarded-For`.
    pub remote_ip: String,

    /// Whether the client connected over HTTPS, as reported by `X-Forwarded-Proto`.
    pub is_https: bool,
}

impl ClientAddress {
    /// Derives the client address of a request.
    ///
    /// When `trust_forwarded_headers` is set, the last hop of `X-Forwarded-For` is taken as the client address: only a
    /// proxy directly in front of us can be trusted to have appended it. HTTPS is derived from `X-Forwarded-Proto`.
    /// Otherwise the transport address is used and the request is never considered HTTPS.
    pub fn derive(request: &AdmissionRequest, trust_forwarded_headers: bool) -> Self {
        let transport_ip = request
            .peer_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "-".to_string());

        if !trust_forwarded_headers {
            return Self {
                remote_ip: transport_ip,
                is_https: false,
            };
        }

        let remote_ip = request
            .header_str(FORWARDED_FOR)
            .and_then(|chain| last_forwarded_hop(&chain).map(str::to_string))
            .unwrap_or(transport_ip);
        let is_https = request
            .header_str(FORWARDED_PROTO)
            .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"));

        Self { remote_ip, is_https }
    }
}

/// Gets the last hop of a forwarded-for chain, trimmed of whitespace.
///
/// Returns `None` for an empty header.
pub fn last_forwarded_hop(chain: &str) -> Option<&str> {
    if chain.trim().is_empty() {
        return None;
    }
    chain.rsplit(',').next().map(str::trim)
}

/// A request that has been admitted and not yet retired.
#[derive(Clone, Debug)]
pub struct InFlightRequest {
    /// Request identifier.
    pub id: RequestId,

    /// When the request was admitted.
    pub started_at: Instant,

    /// Wall-clock time the request was admitted.
    pub started_at_wall: DateTime<Utc>,

    /// Request method.
    pub method: Method,

    /// Request URI.
    pub url: String,

    /// Protocol version.
    pub version: http::Version,

    /// Client address.
    pub remote_ip: String,

    /// Whether the client connected over HTTPS.
    pub is_https: bool,

    /// Whether the request has been upgraded to a long-lived streaming session.
    pub is_streaming: bool,

    /// Whether the handler declared that this request may legitimately run long.
    pub can_be_slow: bool,

    /// Response status, once known.
    pub response_status: Option<u16>,

    /// Response body bytes written so far.
    pub bytes_written: u64,

    /// `Referer` header.
    pub referrer: Option<String>,

    /// `User-Agent` header.
    pub user_agent: Option<String>,
}

impl InFlightRequest {
    pub(crate) fn admit(id: RequestId, request: &AdmissionRequest, client: &ClientAddress) -> Self {
        Self {
            id,
            started_at: Instant::now(),
            started_at_wall: Utc::now(),
            method: request.method.clone(),
            url: request.uri.to_string(),
            version: request.version,
            remote_ip: client.remote_ip.clone(),
            is_https: client.is_https,
            is_streaming: request.wants_websocket(),
            can_be_slow: false,
            response_status: None,
            bytes_written: 0,
            referrer: request.header_str(header::REFERER),
            user_agent: request.header_str(header::USER_AGENT),
        }
    }

    /// Time since the request was admitted.
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Renders this request for the observability endpoints.
    pub fn summary(&self) -> InFlightSummary {
        InFlightSummary {
            id: self.id,
            method: self.method.to_string(),
            url: self.url.clone(),
            duration_secs: self.age().as_secs_f64(),
            remote_ip: self.remote_ip.clone(),
            is_https: self.is_https,
            is_streaming: self.is_streaming,
        }
    }
}

/// Serializable view of an in-flight request.
#[derive(Clone, Debug, Serialize)]
pub struct InFlightSummary {
    /// Request identifier.
    pub id: RequestId,

    /// Request method.
    pub method: String,

    /// Request URI.
    pub url: String,

    /// Seconds since admission.
    pub duration_secs: f64,

    /// Client address.
    pub remote_ip: String,

    /// Whether the client connected over HTTPS.
    pub is_https: bool,

    /// Whether the request is a streaming session.
    pub is_streaming: bool,
}

/// How a request ended.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RequestOutcome {
    /// Response status sent, or `0` if the client went away before any response was produced.
    pub status: u16,

    /// Response body bytes written.
    pub bytes_written: u64,
}

/// Aggregate request counters.
#[derive(Clone, Copy, Debug)]
pub struct AppStats {
    /// When the registry started.
    pub started_at: Instant,

    /// Wall-clock time the registry started.
    pub started_at_wall: DateTime<Utc>,

    /// Requests admitted and not yet retired.
    pub current_requests: u64,

    /// Streaming sessions admitted and not yet retired.
    pub current_streaming_requests: u64,

    /// Requests ever admitted.
    pub total_requests: u64,

    /// Requests ever retired.
    pub completed_requests: u64,
}

impl AppStats {
    pub(crate) fn new() -> Self {
        Self {
            started_at: Instant::now(),
            started_at_wall: Utc::now(),
            current_requests: 0,
            current_streaming_requests: 0,
            total_requests: 0,
            completed_requests: 0,
        }
    }

    /// Time since the registry started.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn admission(headers: &[(&'static str, &'static str)]) -> AdmissionRequest {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            header_map.append(*name, value.parse().unwrap());
        }

        AdmissionRequest {
            method: Method::GET,
            uri: "/widgets?id=1".parse().unwrap(),
            version: http::Version::HTTP_11,
            headers: header_map,
            peer_addr: Some("10.0.0.7:51234".parse().unwrap()),
        }
    }

    #[test]
    fn transport_address_without_trust() {
        let request = admission(&[("x-forwarded-for", "1.2.3.4"), ("x-forwarded-proto", "https")]);
        let client = ClientAddress::derive(&request, false);
        assert_eq!(client.remote_ip, "10.0.0.7");
        assert!(!client.is_https);
    }

    #[test]
    fn last_hop_with_trust() {
        let request = admission(&[
            ("x-forwarded-for", "6.6.6.6, 1.2.3.4 ,  5.6.7.8 "),
            ("x-forwarded-proto", "HTTPS"),
        ]);
        let client = ClientAddress::derive(&request, true);
        assert_eq!(client.remote_ip, "5.6.7.8");
        assert!(client.is_https);
    }

    #[test]
    fn trusted_but_absent_headers() {
        let client = ClientAddress::derive(&admission(&[]), true);
        assert_eq!(client.remote_ip, "10.0.0.7");
        assert!(!client.is_https);
    }

    #[test]
    fn websocket_upgrade_detected() {
        assert!(admission(&[("upgrade", "WebSocket")]).wants_websocket());
        assert!(!admission(&[("upgrade", "h2c")]).wants_websocket());
        assert!(!admission(&[]).wants_websocket());
    }

    #[test]
    fn empty_chain_has_no_hop() {
        assert_eq!(last_forwarded_hop(""), None);
        assert_eq!(last_forwarded_hop("   "), None);
    }

    proptest! {
        #[test]
        fn last_hop_is_final_trimmed_element(hops in prop::collection::vec("[0-9a-f.:]{1,15}", 1..8), pad in " {0,3}") {
            let chain = hops
                .iter()
                .map(|hop| format!("{pad}{hop}{pad}"))
                .collect::<Vec<_>>()
                .join(",");
            prop_assert_eq!(last_forwarded_hop(&chain), hops.last().map(String::as_str));
        }
    }
}
