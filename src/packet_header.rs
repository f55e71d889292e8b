use crate::packet_id::PacketId;
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Formatter};

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    pub struct PacketFlags: u8 {
        const RELIABLE = 0b0100_0000;
        const RESENT   = 0b0010_0000;
        /// acks for the peer's reliable packets are appended to the payload
        const ACK      = 0b0001_0000;
        /// the payload is a control message for the circuit layer, not application data
        const CONTROL  = 0b0000_1000;
    }
}

/// The transport header in front of every packet's payload.
#[derive(Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub packet_id: PacketId,
    /// number of extra header bytes following this header, passed through but not interpreted
    pub offset: u8,
}
impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{#{}", self.packet_id)?;
        if self.flags.contains(PacketFlags::RELIABLE) {
            write!(f, ":R")?;
        }
        if self.flags.contains(PacketFlags::RESENT) {
            write!(f, ":RS")?;
        }
        if self.flags.contains(PacketFlags::ACK) {
            write!(f, ":A")?;
        }
        if self.flags.contains(PacketFlags::CONTROL) {
            write!(f, ":C")?;
        }
        write!(f, "}}")
    }
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize =
        size_of::<u8>()          // flags
        + size_of::<u32>()       // packet id
        + size_of::<u8>();       // offset

    pub fn new(flags: PacketFlags, packet_id: PacketId) -> PacketHeader {
        PacketHeader {
            flags,
            packet_id,
            offset: 0,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn is_resent(&self) -> bool {
        self.flags.contains(PacketFlags::RESENT)
    }

    pub fn is_control(&self) -> bool {
        self.flags.contains(PacketFlags::CONTROL)
    }

    pub fn has_appended_acks(&self) -> bool {
        self.flags.contains(PacketFlags::ACK)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.packet_id.to_raw());
        buf.put_u8(self.offset);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let flags = PacketFlags::from_bits_truncate(buf.try_get_u8()?);
        let packet_id = PacketId::from_raw(buf.try_get_u32()?);
        let offset = buf.try_get_u8()?;

        Ok(PacketHeader {
            flags,
            packet_id,
            offset,
        })
    }

    /// Sets the RESENT flag in an already serialized packet.
    pub fn mark_resent(packet: &mut [u8]) {
        if let Some(flags) = packet.first_mut() {
            *flags |= PacketFlags::RESENT.bits();
        }
    }

    /// Appends acks to an already serialized packet: the ids in big endian, followed by a single
    ///  count byte at the very end. The caller limits the number of ids to 255.
    pub fn append_acks(packet: &mut Vec<u8>, ids: &[PacketId]) {
        debug_assert!(ids.len() <= u8::MAX as usize);
        if ids.is_empty() {
            return;
        }
        if let Some(flags) = packet.first_mut() {
            *flags |= PacketFlags::ACK.bits();
        }
        for id in ids {
            packet.put_u32(id.to_raw());
        }
        packet.put_u8(ids.len() as u8);
    }

    /// Splits the acks appended to a packet's body (everything after the header) from the
    ///  payload. The acks are returned in the order they were appended.
    pub fn split_appended_acks<'a>(&self, body: &'a [u8]) -> anyhow::Result<(&'a [u8], Vec<PacketId>)> {
        if !self.has_appended_acks() {
            return Ok((body, Vec::new()));
        }

        let Some((&num_acks, rest)) = body.split_last() else {
            bail!("{:?}: ack flag set, but no ack count", self);
        };
        let acks_len = num_acks as usize * size_of::<u32>();
        if num_acks == 0 || rest.len() < acks_len {
            bail!("{:?}: {} appended acks announced, but only {} bytes available", self, num_acks, rest.len());
        }

        let (payload, mut acks) = rest.split_at(rest.len() - acks_len);
        let mut ids = Vec::with_capacity(num_acks as usize);
        while acks.has_remaining() {
            ids.push(PacketId::from_raw(acks.get_u32()));
        }
        Ok((payload, ids))
    }

    /// Prepends a header for the given id and flags to a payload
    pub fn stamp(flags: PacketFlags, packet_id: PacketId, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SERIALIZED_LEN + payload.len());
        PacketHeader::new(flags, packet_id).ser(&mut buf);
        buf.put_slice(payload);
        buf
    }
}
