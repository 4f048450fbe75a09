use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use reqwest::Url;
use tracing::warn;

const ALLOWED_SCHEMES: [&str; 2] = ["http", "https"];

pub fn is_valid_url(candidate: &str) -> bool {
    parse_safe(candidate).is_some()
}

pub fn sanitize_url(candidate: &str) -> Option<String> {
    let url = parse_safe(candidate)?;
    let host = url.host_str()?;
    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();
    Some(format!(
        "{}://{}{}{}{}",
        url.scheme(),
        host,
        port,
        url.path(),
        query
    ))
}

/// Shortens long URLs for display, keeping the total at `max_len` characters.
pub fn display_url(url: &str, max_len: usize) -> String {
    if url.chars().count() <= max_len {
        return url.to_string();
    }
    let kept: String = url.chars().take(max_len.saturating_sub(3)).collect();
    format!("{kept}...")
}

pub trait LinkOpener {
    fn open(&self, url: &str) -> Result<(), String>;
}

pub fn open_external(opener: &dyn LinkOpener, candidate: &str) -> bool {
    let safe = match sanitize_url(candidate) {
        Some(safe) => safe,
        None => {
            warn!(url = candidate, "refusing to open unsafe link");
            return false;
        }
    };
    match opener.open(&safe) {
        Ok(()) => true,
        Err(err) => {
            warn!(url = %safe, "failed to open link: {err}");
            false
        }
    }
}

fn parse_safe(candidate: &str) -> Option<Url> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return None;
    }

    let url = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => {
            warn!(url = trimmed, "invalid URL format");
            return None;
        }
    };

    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        warn!(url = trimmed, scheme = url.scheme(), "disallowed scheme");
        return None;
    }
    // https://trusted.example@attacker.example
    if !url.username().is_empty() || url.password().is_some() {
        warn!(url = trimmed, "credentials in authority");
        return None;
    }
    let host = url.host_str()?;
    if is_local_or_private(host) {
        warn!(url = trimmed, "local or private host");
        return None;
    }
    Some(url)
}

fn is_local_or_private(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => is_private_v4(&addr),
        Ok(IpAddr::V6(addr)) => is_private_v6(&addr),
        Err(_) => {
            let domain = bare.trim_end_matches('.').to_ascii_lowercase();
            domain.is_empty() || domain == "localhost" || domain.ends_with(".localhost")
        }
    }
}

fn is_private_v4(addr: &Ipv4Addr) -> bool {
    addr.is_loopback() || addr.is_private() || addr.is_link_local() || addr.is_unspecified()
}

fn is_private_v6(addr: &Ipv6Addr) -> bool {
    if addr.is_loopback() || addr.is_unspecified() {
        return true;
    }
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_private_v4(&v4);
    }
    let first = addr.segments()[0];
    // fc00::/7 unique local, fe80::/10 link local
    (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}
