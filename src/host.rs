use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;

/// The remote end of a circuit. This is a pure value used as a lookup key: two hosts are the same
///  if and only if address and port are the same.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Host {
    pub socket_addr: SocketAddr,
}

impl Host {
    pub fn new(socket_addr: SocketAddr) -> Host {
        Host { socket_addr }
    }
}

impl From<SocketAddr> for Host {
    fn from(socket_addr: SocketAddr) -> Self {
        Host { socket_addr }
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr)
    }
}

impl Debug for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.socket_addr)
    }
}
