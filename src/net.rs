//! Address resolution and socket creation.

use crate::error::Error;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// IP family preference used when resolving addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IpFamily {
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
    /// Either family, in resolver order.
    #[default]
    Any,
}

impl IpFamily {
    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            IpFamily::V4 => addr.is_ipv4(),
            IpFamily::V6 => addr.is_ipv6(),
            IpFamily::Any => true,
        }
    }

    fn wildcards(self) -> Vec<IpAddr> {
        match self {
            IpFamily::V4 => vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            IpFamily::V6 => vec![IpAddr::V6(Ipv6Addr::UNSPECIFIED)],
            IpFamily::Any => vec![
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            ],
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IpFamily::V4 => "v4",
            IpFamily::V6 => "v6",
            IpFamily::Any => "any",
        };
        f.write_str(name)
    }
}

impl FromStr for IpFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v4" | "ipv4" => Ok(IpFamily::V4),
            "v6" | "ipv6" => Ok(IpFamily::V6),
            "any" | "all" => Ok(IpFamily::Any),
            _ => Err(Error::InvalidIpFamily {
                got: s.to_string(),
                valid: vec!["any".to_string(), "v4".to_string(), "v6".to_string()],
            }),
        }
    }
}

/// Resolves `host:port` to the candidate addresses of the requested family,
/// preserving resolver order.
pub(crate) fn resolve(host: &str, port: u16, family: IpFamily) -> Result<Vec<SocketAddr>, Error> {
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| Error::Resolve {
            host: host.to_string(),
            port,
            source,
        })?
        .filter(|addr| family.accepts(addr))
        .collect();

    if candidates.is_empty() {
        return Err(Error::NoAddress {
            host: host.to_string(),
            port,
            family: family.to_string(),
        });
    }
    Ok(candidates)
}

/// Connects to the first candidate that accepts the connection.
pub(crate) fn connect_first(
    host: &str,
    port: u16,
    family: IpFamily,
) -> Result<(TcpStream, SocketAddr), Error> {
    for addr in resolve(host, port, family)? {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                debug!(%addr, "Connected");
                return Ok((stream, addr));
            }
            Err(err) => {
                info!(%addr, ?err, "Connect attempt failed");
            }
        }
    }
    Err(Error::NoAddressSucceeded {
        host: host.to_string(),
        port,
    })
}

/// Creates, configures and binds a listening socket on the first candidate
/// that succeeds. `None` binds the wildcard address of the family.
pub(crate) fn bind_first(
    addr: Option<&str>,
    port: u16,
    backlog: i32,
    family: IpFamily,
) -> Result<TcpListener, Error> {
    let candidates = match addr {
        Some(host) => resolve(host, port, family)?,
        None => family
            .wildcards()
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect(),
    };

    for candidate in candidates {
        match bind_one(candidate, backlog) {
            Ok(listener) => return Ok(listener),
            Err(err) => warn!(%candidate, ?err, "Bind attempt failed"),
        }
    }
    Err(Error::NoAddressSucceeded {
        host: addr.unwrap_or("*").to_string(),
        port,
    })
}

fn bind_one(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}
