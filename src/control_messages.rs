use crate::packet_id::PacketId;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ControlMessageKind {
    StartPingCheck = 1,
    CompletePingCheck = 2,
    PacketAck = 3,
}

/// Messages exchanged between the two ends of a circuit to keep it alive and acknowledge reliable
///  packets. They travel as the payload of ordinary (unreliable) packets.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlMessage {
    /// Ping, carrying the oldest id the sender still waits for an ack for. The receiver can forget
    ///  duplicate-suppression data for everything below that id.
    StartPingCheck {
        ping_id: u8,
        oldest_unacked: PacketId,
    },
    CompletePingCheck {
        ping_id: u8,
    },
    PacketAck {
        ids: Vec<PacketId>,
    },
}

impl ControlMessage {
    /// upper bound for the number of ids in a single `PacketAck` since the count is sent as a u8
    pub const MAX_ACKS: usize = u8::MAX as usize;

    pub fn kind(&self) -> ControlMessageKind {
        match self {
            ControlMessage::StartPingCheck { .. } => ControlMessageKind::StartPingCheck,
            ControlMessage::CompletePingCheck { .. } => ControlMessageKind::CompletePingCheck,
            ControlMessage::PacketAck { .. } => ControlMessageKind::PacketAck,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind().into());
        match self {
            ControlMessage::StartPingCheck { ping_id, oldest_unacked } => {
                buf.put_u8(*ping_id);
                buf.put_u32(oldest_unacked.to_raw());
            }
            ControlMessage::CompletePingCheck { ping_id } => {
                buf.put_u8(*ping_id);
            }
            ControlMessage::PacketAck { ids } => {
                assert!(ids.len() <= Self::MAX_ACKS, "too many acks for a single message: {}", ids.len());
                buf.put_u8(ids.len() as u8);
                for id in ids {
                    buf.put_u32(id.to_raw());
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.ser(&mut buf);
        buf
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlMessage> {
        let kind = buf.try_get_u8()?;
        let kind = ControlMessageKind::try_from(kind)
            .map_err(|_| anyhow!("invalid control message discriminator {}", kind))?;

        let result = match kind {
            ControlMessageKind::StartPingCheck => {
                let ping_id = buf.try_get_u8()?;
                let oldest_unacked = PacketId::from_raw(buf.try_get_u32()?);
                ControlMessage::StartPingCheck { ping_id, oldest_unacked }
            }
            ControlMessageKind::CompletePingCheck => {
                ControlMessage::CompletePingCheck { ping_id: buf.try_get_u8()? }
            }
            ControlMessageKind::PacketAck => {
                let num_acks = buf.try_get_u8()? as usize;
                if buf.remaining() < num_acks * size_of::<u32>() {
                    bail!("ack message announces {} ids but only has {} bytes", num_acks, buf.remaining());
                }
                let mut ids = Vec::with_capacity(num_acks);
                for _ in 0..num_acks {
                    ids.push(PacketId::from_raw(buf.try_get_u32()?));
                }
                ControlMessage::PacketAck { ids }
            }
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after {:?} message", buf.remaining(), kind);
        }
        Ok(result)
    }
}
