use crate::host::Host;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// The datagram primitive that circuits send original packets, resends, pings and acks through.
///  Sending is fire-and-forget: it never waits, and a `false` return only means the packet did
///  not leave this process.
#[cfg_attr(test, mockall::automock)]
pub trait RawTransport: Send + Sync {
    fn send(&self, to: &Host, buf: &[u8]) -> bool;
}

impl RawTransport for UdpSocket {
    fn send(&self, to: &Host, buf: &[u8]) -> bool {
        match self.try_send_to(buf, to.socket_addr) {
            Ok(len) => {
                trace!("sent {} bytes to {:?}", len, to);
                true
            }
            Err(e) => {
                error!("error sending packet to {:?}: {}", to, e);
                false
            }
        }
    }
}
