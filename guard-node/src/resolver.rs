use axum::http::HeaderMap;
use ipnet::IpNet;
use std::net::IpAddr;

/// Header carrying the proxy chain, folded to lowercase by the HTTP layer.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Parse a textual IP address into its canonical form.
pub fn normalize_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse().ok()
}

/// True when the address falls inside any of the given networks.
pub fn is_trusted(ip: IpAddr, trusted: &[IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&ip))
}

/// Resolve the true client address for a request.
///
/// When the connecting peer is a trusted proxy and forwarded headers are
/// honored, the `X-Forwarded-For` chain is scanned right to left and the
/// nearest hop that is not itself a trusted proxy wins. An untrusted client
/// can prepend arbitrary entries but can never appear closer to the edge
/// than the trusted proxies themselves, so the scan direction defeats
/// spoofing. Invalid chain entries are skipped.
pub fn resolve_client_ip(
    peer: Option<IpAddr>,
    headers: &HeaderMap,
    trusted_proxies: &[IpNet],
    honor_forwarded: bool,
) -> Option<IpAddr> {
    let peer = peer?;

    if !honor_forwarded || !is_trusted(peer, trusted_proxies) {
        return Some(peer);
    }

    let forwarded = headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|value| value.to_str().ok());
    let Some(forwarded) = forwarded else {
        return Some(peer);
    };

    // The connecting peer is the final hop of the chain.
    let chain: Vec<Option<IpAddr>> = forwarded
        .split(',')
        .map(normalize_ip)
        .chain(std::iter::once(Some(peer)))
        .collect();

    for hop in chain.iter().rev().flatten() {
        if !is_trusted(*hop, trusted_proxies) {
            return Some(*hop);
        }
    }

    // Every hop is a trusted proxy: fall back to the left-most valid entry.
    chain.iter().flatten().next().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn trusted(cidrs: &[&str]) -> Vec<IpNet> {
        cidrs.iter().map(|c| c.parse().unwrap()).collect()
    }

    fn headers_with_xff(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_no_peer_is_unresolvable() {
        let headers = headers_with_xff("8.8.8.8");
        assert_eq!(
            resolve_client_ip(None, &headers, &trusted(&["10.0.0.0/8"]), true),
            None
        );
    }

    #[test]
    fn test_direct_peer_when_forwarding_disabled() {
        let headers = headers_with_xff("8.8.8.8");
        let resolved =
            resolve_client_ip(Some(ip("10.0.0.1")), &headers, &trusted(&["10.0.0.0/8"]), false);
        assert_eq!(resolved, Some(ip("10.0.0.1")));
    }

    #[test]
    fn test_untrusted_peer_ignores_chain() {
        let headers = headers_with_xff("8.8.8.8");
        let resolved =
            resolve_client_ip(Some(ip("203.0.113.9")), &headers, &trusted(&["10.0.0.0/8"]), true);
        assert_eq!(resolved, Some(ip("203.0.113.9")));
    }

    #[test]
    fn test_empty_trusted_set_returns_peer() {
        let headers = headers_with_xff("8.8.8.8");
        let resolved = resolve_client_ip(Some(ip("203.0.113.9")), &headers, &[], true);
        assert_eq!(resolved, Some(ip("203.0.113.9")));
    }

    #[test]
    fn test_nearest_untrusted_hop_wins() {
        // Peer 10.0.0.1 is a trusted proxy; 10.0.0.2 in the chain is too, so
        // the nearest non-proxy hop is 8.8.8.8.
        let headers = headers_with_xff("8.8.8.8, 10.0.0.2");
        let resolved =
            resolve_client_ip(Some(ip("10.0.0.1")), &headers, &trusted(&["10.0.0.0/8"]), true);
        assert_eq!(resolved, Some(ip("8.8.8.8")));
    }

    #[test]
    fn test_spoofed_prefix_cannot_override() {
        // An attacker at 203.0.113.9 prepends a victim address; the scan
        // from the right stops at the attacker first.
        let headers = headers_with_xff("1.1.1.1, 203.0.113.9");
        let resolved =
            resolve_client_ip(Some(ip("10.0.0.1")), &headers, &trusted(&["10.0.0.0/8"]), true);
        assert_eq!(resolved, Some(ip("203.0.113.9")));
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let headers = headers_with_xff("garbage, 8.8.8.8, also-bad");
        let resolved =
            resolve_client_ip(Some(ip("10.0.0.1")), &headers, &trusted(&["10.0.0.0/8"]), true);
        assert_eq!(resolved, Some(ip("8.8.8.8")));
    }

    #[test]
    fn test_all_trusted_chain_returns_leftmost() {
        let headers = headers_with_xff("10.1.1.1, 10.2.2.2");
        let resolved =
            resolve_client_ip(Some(ip("10.0.0.1")), &headers, &trusted(&["10.0.0.0/8"]), true);
        assert_eq!(resolved, Some(ip("10.1.1.1")));
    }

    #[test]
    fn test_missing_header_returns_peer() {
        let headers = HeaderMap::new();
        let resolved =
            resolve_client_ip(Some(ip("10.0.0.1")), &headers, &trusted(&["10.0.0.0/8"]), true);
        assert_eq!(resolved, Some(ip("10.0.0.1")));
    }

    #[test]
    fn test_resolution_is_idempotent_on_empty_chain() {
        let headers = HeaderMap::new();
        let trusted = trusted(&["10.0.0.0/8"]);
        let once = resolve_client_ip(Some(ip("203.0.113.9")), &headers, &trusted, true).unwrap();
        let twice = resolve_client_ip(Some(once), &headers, &trusted, true).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_ipv6_chain_entries() {
        let headers = headers_with_xff("2001:db8::1, 10.0.0.2");
        let resolved =
            resolve_client_ip(Some(ip("10.0.0.1")), &headers, &trusted(&["10.0.0.0/8"]), true);
        assert_eq!(resolved, Some(ip("2001:db8::1")));
    }
}
