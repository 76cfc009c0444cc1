// Copyright 2024 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Endpoint helpers for local plugin sockets.

pub mod pluginwatcher;

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const TCP_PROTOCOL: &str = "tcp";
const UNIX_PROTOCOL: &str = "unix";
const NPIPE_PROTOCOL: &str = "npipe";

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Using {0:?} as endpoint is deprecated, please consider using full url format")]
    Deprecated(String),

    #[error("protocol {0:?} not supported")]
    Unsupported(String),

    #[error("invalid endpoint {endpoint:?}: {source}")]
    Parse { endpoint: String, source: url::ParseError },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Split an endpoint URL into its protocol and address.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, String), EndpointError> {
    let endpoint = endpoint.replace('\\', "/");
    // URL parsing would drop the "." segment of a full pipe path.
    if let Some(path) = endpoint.strip_prefix("npipe://") {
        if path.starts_with("//./pipe") {
            return Ok((NPIPE_PROTOCOL.to_string(), path.to_string()));
        }
    }
    let u = match Url::parse(&endpoint) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => return Err(EndpointError::Deprecated(endpoint)),
        Err(source) => return Err(EndpointError::Parse { endpoint, source }),
    };

    match u.scheme() {
        TCP_PROTOCOL => {
            let host = u.host_str().unwrap_or_default();
            let addr = match u.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            Ok((TCP_PROTOCOL.to_string(), addr))
        }
        UNIX_PROTOCOL => Ok((UNIX_PROTOCOL.to_string(), u.path().to_string())),
        NPIPE_PROTOCOL => {
            let path = u.path();
            let host = match u.host_str() {
                Some(h) if !h.is_empty() => h,
                _ => ".",
            };
            Ok((NPIPE_PROTOCOL.to_string(), format!("//{}{}", host, path)))
        }
        scheme => Err(EndpointError::Unsupported(scheme.to_string())),
    }
}

/// Listener is a bound tcp or unix socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Conn is a connected tcp or unix stream.
#[derive(Debug)]
pub enum Conn {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Conn::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Conn::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Conn::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Conn::Unix(s) => s.flush(),
        }
    }
}

/// Bind `endpoint`. A stale unix socket file is removed first.
pub fn create_listener(endpoint: &str) -> Result<Listener, EndpointError> {
    let (protocol, addr) = parse_endpoint(endpoint)?;
    match protocol.as_str() {
        TCP_PROTOCOL => Ok(Listener::Tcp(TcpListener::bind(addr)?)),
        #[cfg(unix)]
        UNIX_PROTOCOL => {
            match std::fs::remove_file(&addr) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            Ok(Listener::Unix(UnixListener::bind(Path::new(&addr))?))
        }
        _ => Err(EndpointError::Unsupported(protocol)),
    }
}

pub type Dialer = fn(&str, Duration) -> io::Result<Conn>;

fn tcp_dial(addr: &str, timeout: Duration) -> io::Result<Conn> {
    let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, format!("no addresses for {}", addr));
    for sock_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&sock_addr, timeout) {
            Ok(stream) => return Ok(Conn::Tcp(stream)),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

#[cfg(unix)]
fn unix_dial(addr: &str, timeout: Duration) -> io::Result<Conn> {
    let stream = UnixStream::connect(addr)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(Conn::Unix(stream))
}

/// Returns the address of `endpoint` and the dialer for its protocol.
pub fn get_address_and_dialer(endpoint: &str) -> Result<(String, Dialer), EndpointError> {
    let (protocol, addr) = parse_endpoint(endpoint)?;
    match protocol.as_str() {
        TCP_PROTOCOL => Ok((addr, tcp_dial as Dialer)),
        #[cfg(unix)]
        UNIX_PROTOCOL => Ok((addr, unix_dial as Dialer)),
        _ => Err(EndpointError::Unsupported(protocol)),
    }
}

/// Connect to `endpoint`.
pub fn dial(endpoint: &str, timeout: Duration) -> Result<Conn, EndpointError> {
    let (addr, dialer) = get_address_and_dialer(endpoint)?;
    Ok(dialer(&addr, timeout)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        struct TestCase {
            name: &'static str,
            endpoint: &'static str,
            expected: Result<(&'static str, &'static str), &'static str>,
        }
        let test_cases = vec![
            TestCase {
                name: "tcp",
                endpoint: "tcp://localhost:15880",
                expected: Ok(("tcp", "localhost:15880")),
            },
            TestCase {
                name: "unix",
                endpoint: "unix:///var/lib/kubelet/plugins/csi.sock",
                expected: Ok(("unix", "/var/lib/kubelet/plugins/csi.sock")),
            },
            TestCase {
                name: "npipe full path",
                endpoint: "npipe:////./pipe/dockershim",
                expected: Ok(("npipe", "//./pipe/dockershim")),
            },
            TestCase {
                name: "npipe with host",
                endpoint: "npipe://./pipe/dockershim",
                expected: Ok(("npipe", "//./pipe/dockershim")),
            },
            TestCase {
                name: "npipe backslashes",
                endpoint: "npipe:\\\\.\\pipe\\dockershim",
                expected: Ok(("npipe", "//./pipe/dockershim")),
            },
            TestCase {
                name: "no scheme",
                endpoint: "/var/run/dockershim.sock",
                expected: Err("Using \"/var/run/dockershim.sock\" as endpoint is deprecated, please consider using full url format"),
            },
            TestCase {
                name: "unsupported",
                endpoint: "http://localhost:80",
                expected: Err("protocol \"http\" not supported"),
            },
        ];
        for tc in test_cases {
            let result = parse_endpoint(tc.endpoint);
            match tc.expected {
                Ok((protocol, addr)) => {
                    let (p, a) = result.unwrap_or_else(|e| panic!("{}: unexpected error {}", tc.name, e));
                    assert_eq!(p, protocol, "{}: protocol", tc.name);
                    assert_eq!(a, addr, "{}: address", tc.name);
                }
                Err(msg) => {
                    let err = result.err().unwrap_or_else(|| panic!("{}: expected error", tc.name));
                    assert_eq!(err.to_string(), msg, "{}: unexpected error", tc.name);
                }
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_create_listener_and_dial_unix() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("plugin.sock");
        // A stale file must not block the bind.
        std::fs::write(&sock, "").unwrap();
        let endpoint = format!("unix://{}", sock.display());

        let listener = create_listener(&endpoint).unwrap();
        assert!(matches!(listener, Listener::Unix(_)));
        let conn = dial(&endpoint, Duration::from_secs(1)).unwrap();
        assert!(matches!(conn, Conn::Unix(_)));
    }

    #[test]
    fn test_create_listener_and_dial_tcp() {
        let listener = create_listener("tcp://127.0.0.1:0").unwrap();
        let Listener::Tcp(l) = listener else {
            panic!("expected a tcp listener");
        };
        let port = l.local_addr().unwrap().port();
        let conn = dial(&format!("tcp://127.0.0.1:{}", port), Duration::from_secs(1)).unwrap();
        assert!(matches!(conn, Conn::Tcp(_)));
    }

    #[test]
    fn test_npipe_not_supported_here() {
        let err = create_listener("npipe:////./pipe/dockershim").unwrap_err();
        assert_eq!(err.to_string(), "protocol \"npipe\" not supported");
    }
}
