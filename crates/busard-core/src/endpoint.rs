//! Transport URLs and endpoint selection.
//!
//! A URL is `scheme://host[:port][/path]`. The scheme set is closed;
//! `mem://<channel>` has no port, its host is a process-unique channel id.

use std::fmt;

/// The closed set of recognized transport schemes, in dial-preference
/// order: shared memory beats TCP beats WebSocket beats HTTP beats UDP
/// beats QUIC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    Mem,
    Tcp,
    Ws,
    Wss,
    Http,
    Https,
    Udp,
    Quic,
}

impl Scheme {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "mem" => Scheme::Mem,
            "tcp" => Scheme::Tcp,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "udp" => Scheme::Udp,
            "quic" => Scheme::Quic,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Mem => "mem",
            Scheme::Tcp => "tcp",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Udp => "udp",
            Scheme::Quic => "quic",
        }
    }

    pub fn has_port(self) -> bool {
        self != Scheme::Mem
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed transport URL. Equality is the full tuple.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            scheme,
            host: host.into(),
            port,
            path: String::new(),
        }
    }

    /// Parse `scheme://host[:port][/path]`.
    pub fn parse(url: &str) -> Result<Self, EndpointParseError> {
        let (scheme_str, rest) = url
            .split_once("://")
            .ok_or_else(|| EndpointParseError::MissingScheme(url.to_string()))?;
        let scheme = Scheme::parse(scheme_str)
            .ok_or_else(|| EndpointParseError::UnknownScheme(scheme_str.to_string()))?;

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, String::new()),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if scheme.has_port() => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| EndpointParseError::BadPort(p.to_string()))?;
                (h, port)
            }
            _ => (authority, 0),
        };
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(url.to_string()));
        }

        Ok(Endpoint {
            scheme,
            host: host.to_string(),
            port,
            path,
        })
    }

    /// The `mem://` channel id (the host part).
    pub fn channel(&self) -> &str {
        &self.host
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme.has_port() {
            write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
        } else {
            write!(f, "{}://{}{}", self.scheme, self.host, self.path)
        }
    }
}

/// Error parsing a transport URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointParseError {
    MissingScheme(String),
    UnknownScheme(String),
    BadPort(String),
    EmptyHost(String),
}

impl fmt::Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointParseError::MissingScheme(url) => write!(f, "missing scheme in {url:?}"),
            EndpointParseError::UnknownScheme(s) => write!(f, "unknown scheme {s:?}"),
            EndpointParseError::BadPort(p) => write!(f, "invalid port {p:?}"),
            EndpointParseError::EmptyHost(url) => write!(f, "empty host in {url:?}"),
        }
    }
}

impl std::error::Error for EndpointParseError {}

/// Parse a semicolon-separated URL list, skipping empty entries.
/// Unparseable entries are dropped (a peer may advertise schemes newer
/// than this runtime).
pub fn parse_url_list(urls: &str) -> Vec<Endpoint> {
    urls.split(';')
        .filter(|s| !s.is_empty())
        .filter_map(|s| Endpoint::parse(s).ok())
        .collect()
}

/// Pick the endpoint to dial out of an advertised list: the first entry
/// of the most-preferred scheme the local runtime has enabled.
pub fn select_endpoint(candidates: &[Endpoint], enabled: &[Scheme]) -> Option<Endpoint> {
    let mut best: Option<&Endpoint> = None;
    for ep in candidates {
        if !enabled.contains(&ep.scheme) {
            continue;
        }
        match best {
            Some(b) if b.scheme <= ep.scheme => {}
            _ => best = Some(ep),
        }
    }
    best.cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp_url() {
        let ep = Endpoint::parse("tcp://localhost:9160").unwrap();
        assert_eq!(ep.scheme, Scheme::Tcp);
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 9160);
        assert_eq!(ep.to_string(), "tcp://localhost:9160");
    }

    #[test]
    fn parse_mem_url_has_no_port() {
        let ep = Endpoint::parse("mem://calc-channel").unwrap();
        assert_eq!(ep.scheme, Scheme::Mem);
        assert_eq!(ep.channel(), "calc-channel");
        assert_eq!(ep.port, 0);
        assert_eq!(ep.to_string(), "mem://calc-channel");
    }

    #[test]
    fn parse_http_url_with_path() {
        let ep = Endpoint::parse("http://example.org:8080/rpc").unwrap();
        assert_eq!(ep.path, "/rpc");
        assert_eq!(ep.to_string(), "http://example.org:8080/rpc");
    }

    #[test]
    fn parse_rejects_unknown_scheme_and_bad_port() {
        assert!(matches!(
            Endpoint::parse("gopher://x:1"),
            Err(EndpointParseError::UnknownScheme(_))
        ));
        assert!(matches!(
            Endpoint::parse("tcp://x:70000"),
            Err(EndpointParseError::BadPort(_))
        ));
        assert!(matches!(
            Endpoint::parse("localhost:9160"),
            Err(EndpointParseError::MissingScheme(_))
        ));
    }

    #[test]
    fn equality_is_the_tuple() {
        let a = Endpoint::parse("tcp://h:1").unwrap();
        let b = Endpoint::parse("tcp://h:1").unwrap();
        let c = Endpoint::parse("tcp://h:2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn selection_prefers_mem_then_tcp() {
        let list = parse_url_list("udp://h:3;tcp://h:1;mem://chan;ws://h:2");
        assert_eq!(list.len(), 4);

        let all = [
            Scheme::Mem,
            Scheme::Tcp,
            Scheme::Ws,
            Scheme::Wss,
            Scheme::Http,
            Scheme::Https,
            Scheme::Udp,
            Scheme::Quic,
        ];
        let pick = select_endpoint(&list, &all).unwrap();
        assert_eq!(pick.scheme, Scheme::Mem);

        let no_mem = [Scheme::Tcp, Scheme::Ws, Scheme::Udp];
        let pick = select_endpoint(&list, &no_mem).unwrap();
        assert_eq!(pick.scheme, Scheme::Tcp);

        assert_eq!(select_endpoint(&list, &[Scheme::Quic]), None);
    }

    #[test]
    fn url_list_skips_empty_and_unknown() {
        let list = parse_url_list("tcp://h:1;;bogus://x;udp://h:2");
        assert_eq!(list.len(), 2);
    }
}
