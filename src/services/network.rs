use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use ipnetwork::IpNetwork;
use serde::Serialize;

use crate::services::authorization::{AuthorizationDecision, DenyReason};

/// Network gate settings for one deployment.
#[derive(Debug, Clone)]
pub struct NetworkGateConfig {
    /// When false the gate allows everything.
    pub enabled: bool,
    /// When false an enabled gate only logs what it would have denied.
    pub required: bool,
    pub trusted_subnets: Vec<IpNetwork>,
    /// Read forwarded-address headers. Only safe behind a proxy that sets them.
    pub trust_proxy_headers: bool,
    /// How many proxies append to `X-Forwarded-For`. The client address is
    /// the entry this many positions from the right.
    pub trusted_proxy_hops: usize,
}

/// Diagnostic view of how the gate sees the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
    pub client_ip: Option<String>,
    pub in_trusted_network: bool,
    pub enforced: bool,
}

/// Decides whether a caller is on the private overlay network.
///
/// Independent of identity: passing it never substitutes for a role check.
#[derive(Debug, Clone)]
pub struct NetworkAccessGate {
    config: NetworkGateConfig,
}

impl NetworkAccessGate {
    pub fn new(config: NetworkGateConfig) -> Self {
        Self { config }
    }

    pub fn is_enforced(&self) -> bool {
        self.config.enabled && self.config.required
    }

    /// Resolves the client address.
    ///
    /// Headers are skipped unless proxy headers are trusted. Otherwise an
    /// `X-Forwarded-For` header is read from the right: the entry
    /// `trusted_proxy_hops` positions in is the one our outermost proxy
    /// appended, and anything left of it is client-supplied. A header too
    /// short or unparseable at that position falls back to the socket peer.
    /// Without `X-Forwarded-For`, `X-Real-IP` is used before the peer.
    pub fn resolve_client_ip(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
        if !self.config.trust_proxy_headers {
            return peer.map(normalize);
        }

        if let Some(forwarded) = headers.get("x-forwarded-for") {
            let hop = forwarded.to_str().ok().and_then(|value| {
                let entries: Vec<&str> = value.split(',').collect();
                let index = entries.len().checked_sub(self.config.trusted_proxy_hops.max(1))?;
                parse_ip(entries[index])
            });
            if hop.is_none() {
                tracing::debug!("Unusable X-Forwarded-For, using socket peer");
            }
            return hop.or(peer).map(normalize);
        }

        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_ip)
            .or(peer)
            .map(normalize)
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        let ip = normalize(ip);
        self.config
            .trusted_subnets
            .iter()
            .any(|subnet| subnet.contains(ip))
    }

    /// Gate decision for a resolved client address.
    pub fn check(&self, ip: Option<IpAddr>) -> AuthorizationDecision {
        if !self.config.enabled {
            return AuthorizationDecision::Allow;
        }

        let decision = match ip {
            None => AuthorizationDecision::Deny(DenyReason::ClientAddressUnknown),
            Some(ip) if self.is_trusted(ip) => AuthorizationDecision::Allow,
            Some(_) => AuthorizationDecision::Deny(DenyReason::OutsideTrustedNetwork),
        };

        if !self.config.required {
            if let AuthorizationDecision::Deny(reason) = decision {
                tracing::info!(?reason, client_ip = ?ip, "Network gate not enforced, allowing");
            }
            return AuthorizationDecision::Allow;
        }
        decision
    }

    pub fn status(&self, ip: Option<IpAddr>) -> NetworkStatus {
        NetworkStatus {
            client_ip: ip.map(|ip| ip.to_string()),
            in_trusted_network: ip.is_some_and(|ip| self.is_trusted(ip)),
            enforced: self.is_enforced(),
        }
    }
}

/// Accepts a bare address or `address:port`.
fn parse_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

/// Folds IPv4-mapped IPv6 addresses back to IPv4.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
