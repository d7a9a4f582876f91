//! Network targets parsed from a setting's `Url`.

use std::fmt;

/// Default port used when a `Url` omits one.
pub const DEFAULT_PORT: u16 = 6379;

/// Network target for a single store node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Wrap the TCP stream with TLS (`rediss://` scheme).
    pub tls: bool,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            tls: false,
        }
    }

    /// Parse `host:port`, optionally prefixed by `redis://` or `rediss://`.
    ///
    /// The port defaults to [`DEFAULT_PORT`]. Bracketed IPv6 literals
    /// (`[::1]:6379`) are accepted.
    pub fn parse(url: &str) -> Result<Self, String> {
        let url = url.trim();
        let (rest, tls) = if let Some(rest) = url.strip_prefix("rediss://") {
            (rest, true)
        } else if let Some(rest) = url.strip_prefix("redis://") {
            (rest, false)
        } else {
            (url, false)
        };
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(format!("empty address in url '{url}'"));
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| format!("unterminated ipv6 literal in '{url}'"))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p, url)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(format!("unexpected trailing data in '{url}'")),
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, p)) => (host, parse_port(p, url)?),
                None => (rest, DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(format!("missing host in url '{url}'"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(port: &str, url: &str) -> Result<u16, String> {
    port.parse::<u16>()
        .map_err(|e| format!("invalid port '{port}' in url '{url}': {e}"))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "rediss" } else { "redis" };
        write!(f, "{scheme}://{}", self.authority())
    }
}
