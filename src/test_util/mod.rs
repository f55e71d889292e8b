//! This module contains utilities that are useful for testing code based on circuits. They are
//!  used for testing the circuit layer itself, but they are also exported for application testing.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use tokio::time::Instant;
use crate::control_messages::ControlMessage;
use crate::host::Host;
use crate::packet_header::PacketHeader;
use crate::raw_transport::RawTransport;
use crate::throttle::BandwidthThrottle;

/// convenience method for unit test code: create a [Host] based on a number, the same number
///  generating the same host and different numbers different hosts
pub fn test_host_from_number(number: u16) -> Host {
    Host::new(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number)))
}

/// A [RawTransport] that records all packets instead of sending them
#[derive(Debug, Default)]
pub struct TrackingRawTransport {
    tracker: Mutex<Vec<(Host, Vec<u8>)>>,
}
impl TrackingRawTransport {
    pub fn new() -> Self {
        Default::default()
    }

    /// returns sent packets, clearing the internal buffer
    pub fn sent_packets(&self) -> Vec<(Host, Vec<u8>)> {
        let mut lock = self.tracker.lock()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *lock)
    }

    /// returns sent packets that contain control messages, decoded and with their packet header,
    ///  clearing the internal buffer. Appended acks are stripped.
    pub fn sent_control_messages(&self) -> Vec<(Host, PacketHeader, ControlMessage)> {
        self.sent_packets().into_iter()
            .filter_map(|(to, buf)| {
                let mut buf = buf.as_slice();
                let header = PacketHeader::deser(&mut buf).ok()?;
                if !header.is_control() {
                    return None;
                }
                let (mut payload, _) = header.split_appended_acks(buf).ok()?;
                let msg = ControlMessage::deser(&mut payload).ok()?;
                Some((to, header, msg))
            })
            .collect()
    }
}

impl RawTransport for TrackingRawTransport {
    fn send(&self, to: &Host, buf: &[u8]) -> bool {
        self.tracker.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((*to, buf.to_vec()));
        true
    }
}

/// A [BandwidthThrottle] that overflows if and only if it is told to
#[derive(Debug, Default)]
pub struct ManualThrottle {
    overflow: bool,
    consumed_bits: f32,
}
impl ManualThrottle {
    pub fn set_overflow(&mut self, overflow: bool) {
        self.overflow = overflow;
    }

    pub fn consumed_bits(&self) -> f32 {
        self.consumed_bits
    }
}

impl BandwidthThrottle for ManualThrottle {
    fn check_overflow(&mut self, _bits: f32, _now: Instant) -> bool {
        self.overflow
    }

    fn throttle_overflow(&mut self, bits: f32, _now: Instant) -> bool {
        self.consumed_bits += bits;
        self.overflow
    }
}
