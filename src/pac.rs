//! Proxy auto-config script served at `/proxy.pac`.
//!
//! [`script`] renders the JavaScript handed to browsers and [`route_for_host`]
//! applies the same decision rules in Rust, so both can be checked against each other.

use std::sync::OnceLock;

use regex::Regex;

pub const CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxy(String),
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => f.write_str("DIRECT"),
            Self::Proxy(addr) => write!(f, "PROXY {addr}"),
        }
    }
}

/// Renders `FindProxyForURL` for `proxy_addr`, sending `skipped` top-level names direct.
pub fn script(proxy_addr: &str, skipped: &[String]) -> String {
    let skipped = skipped
        .iter()
        .map(|name| format!("'{}'", escape_js_single_quoted(name)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"
function FindProxyForURL(url, host) {{
    var skipped = [ {skipped} ];

    // skip any TLD in the list
    var tld = host;
    var lastDot = tld.lastIndexOf('.');
    if (lastDot != -1) {{
      tld = tld.substr(lastDot+1);
    }}
    tld = tld.toLowerCase();

    if (skipped.includes(tld)) {{
      return 'DIRECT';
    }}

    // skip IP addresses
    var isIpV4Addr = /^(\d+.){{3}}\d+$/;
    if (isIpV4Addr.test(host)) {{
       return "DIRECT";
    }}

    // loosely check if IPv6
    if (lastDot == -1 && host.split(':').length > 2) {{
      return "DIRECT";
    }}

    return "PROXY {proxy_addr}";
}}
"#
    )
}

/// Decision the rendered script makes for `host`.
pub fn route_for_host(host: &str, proxy_addr: &str, skipped: &[String]) -> Route {
    let last_dot = host.rfind('.');
    let tld = match last_dot {
        Some(idx) => &host[idx + 1..],
        None => host,
    }
    .to_lowercase();

    if skipped.iter().any(|name| *name == tld) {
        return Route::Direct;
    }
    if ipv4_like_regex().is_match(host) {
        return Route::Direct;
    }
    if last_dot.is_none() && host.split(':').count() > 2 {
        return Route::Direct;
    }
    Route::Proxy(proxy_addr.to_owned())
}

// The script's pattern with JavaScript semantics: `\d` is ASCII only, `.` is unescaped.
fn ipv4_like_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^([0-9]+.){3}[0-9]+$").expect("IPv4 host regex should compile")
    })
}

fn escape_js_single_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
