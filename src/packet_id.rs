use std::fmt::{Display, Formatter};

/// A packet sequence number. Packet ids live on a ring of fixed size (see [SequenceRing]), so they
///  must never be compared with `<` / `>` for ordering purposes except where a numeric order is
///  explicitly intended (e.g. as map keys).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PacketId(u32);

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PacketId {
    pub const ZERO: PacketId = PacketId(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

/// Signed distance from `a` to `b` on a ring of `2^bits` elements: positive if `b` is ahead of `a`,
///  negative if it is behind. The result is in `-2^(bits-1) .. 2^(bits-1)`, i.e. a displacement of
///  more than half the ring is interpreted as the counter having wrapped.
pub fn ring_distance(a: u32, b: u32, bits: u8) -> i32 {
    debug_assert!((1..=31).contains(&bits));

    let modulus = 1i64 << bits;
    let forward = (b.wrapping_sub(a) as i64) & (modulus - 1);
    if forward >= modulus / 2 {
        (forward - modulus) as i32
    }
    else {
        forward as i32
    }
}

/// The ring that packet ids of a circuit live on. This is where all wraparound arithmetic is
///  concentrated.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SequenceRing {
    bits: u8,
}

impl SequenceRing {
    pub fn new(bits: u8) -> SequenceRing {
        assert!((2..=31).contains(&bits), "sequence ring must have between 2 and 31 bits");
        SequenceRing { bits }
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn modulus(&self) -> u32 {
        1 << self.bits
    }

    fn mask(&self) -> u32 {
        self.modulus() - 1
    }

    pub fn wrap(&self, raw: u32) -> PacketId {
        PacketId(raw & self.mask())
    }

    pub fn next(&self, id: PacketId) -> PacketId {
        self.add(id, 1)
    }

    pub fn add(&self, id: PacketId, n: u32) -> PacketId {
        PacketId(id.0.wrapping_add(n) & self.mask())
    }

    /// signed ring distance from `a` to `b`, see [ring_distance]
    pub fn distance(&self, a: PacketId, b: PacketId) -> i32 {
        ring_distance(a.0, b.0, self.bits)
    }

    /// number of steps to go from `a` forward to `b`, always in `0 .. modulus`
    pub fn forward_distance(&self, a: PacketId, b: PacketId) -> u32 {
        b.0.wrapping_sub(a.0) & self.mask()
    }

    /// `true` if `b` is strictly ahead of `a` on the ring
    pub fn is_ahead(&self, a: PacketId, b: PacketId) -> bool {
        self.distance(a, b) > 0
    }

    /// the later of two ids in ring order
    pub fn max(&self, a: PacketId, b: PacketId) -> PacketId {
        if self.is_ahead(a, b) { b } else { a }
    }
}
