//! Client IP extraction and CIDR allow/deny matching.

use actix_web::HttpRequest;
use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;

/// Extracts the client IP the way the IP-hash strategies and the admin
/// API's CIDR filter both need it: `X-Forwarded-For` first hop, else
/// `X-Real-IP`, else the socket's peer address with the port split off.
pub fn client_ip(req: &HttpRequest) -> String {
    if let Some(xff) = req.headers().get("X-Forwarded-For") {
        if let Ok(value) = xff.to_str() {
            if let Some(first) = value.split(',').next() {
                let candidate = first.trim();
                if !candidate.is_empty() {
                    return candidate.to_string();
                }
            }
        }
    }

    if let Some(xri) = req.headers().get("X-Real-IP") {
        if let Ok(value) = xri.to_str() {
            let candidate = value.trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }

    req.connection_info()
        .peer_addr()
        .map(split_host_port)
        .unwrap_or_else(|| "unknown".to_string())
}

fn split_host_port(addr: &str) -> String {
    // IPv6 literals show up bracketed, e.g. "[::1]:8080".
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => addr.to_string(),
    }
}

/// Evaluates an IP against allow/deny CIDR lists: deny wins; an empty allow
/// list means allow-all-except-denied.
pub fn ip_permitted(ip: &str, allow: &[String], deny: &[String]) -> bool {
    let addr = match IpAddr::from_str(ip) {
        Ok(addr) => addr,
        Err(_) => return false,
    };

    if deny.iter().any(|cidr| matches_cidr(&addr, cidr)) {
        return false;
    }

    if allow.is_empty() {
        return true;
    }

    allow.iter().any(|cidr| matches_cidr(&addr, cidr))
}

fn matches_cidr(addr: &IpAddr, cidr: &str) -> bool {
    if let Ok(net) = IpNet::from_str(cidr) {
        return net.contains(addr);
    }
    IpAddr::from_str(cidr).map(|single| &single == addr).unwrap_or(false)
}
