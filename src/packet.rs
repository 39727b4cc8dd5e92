use crate::chunk::{Chunk, CHUNK_HEADER_LEN, DATA_CHUNK_HEADER_LEN};
use crate::tsn::Tsn;
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::{Display, Formatter};

pub const PACKET_HEADER_LEN: usize = 14;
pub const DELIVERY_PREREQUISITES_LEN: usize = 8;

const PROTOCOL_VERSION: u16 = 0x1000;
const VERSION_MASK: u16 = 0xf000;

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PacketFlags: u16 {
        const RELIABLE = 0x0001;
        const SEQUENCED = 0x0002;
        const CONTROL = 0x0008;
        const DELIVERY_PREREQUISITES = 0x0010;
        const FIRST_FRAGMENT = 0x0020;
        const INTERMEDIATE_FRAGMENT = 0x0040;
        const LAST_FRAGMENT = 0x0080;
        const RETRANSMITTED = 0x0100;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TrafficClass {
    Control,
    ReliableSequenced,
    UnreliableSequenced,
    ReliableUnsequenced,
    UnreliableUnsequenced,
}

impl Display for TrafficClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrafficClass::Control => "ctrl",
            TrafficClass::ReliableSequenced => "rs",
            TrafficClass::UnreliableSequenced => "us",
            TrafficClass::ReliableUnsequenced => "ru",
            TrafficClass::UnreliableUnsequenced => "uu",
        };
        write!(f, "{}", s)
    }
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 5] = [
        TrafficClass::Control,
        TrafficClass::ReliableSequenced,
        TrafficClass::UnreliableSequenced,
        TrafficClass::ReliableUnsequenced,
        TrafficClass::UnreliableUnsequenced,
    ];

    pub fn for_message(reliable: bool, sequenced: bool) -> TrafficClass {
        match (reliable, sequenced) {
            (true, true) => TrafficClass::ReliableSequenced,
            (false, true) => TrafficClass::UnreliableSequenced,
            (true, false) => TrafficClass::ReliableUnsequenced,
            (false, false) => TrafficClass::UnreliableUnsequenced,
        }
    }

    /// Control traffic is delivered reliably and in sequence
    pub fn is_reliable(&self) -> bool {
        matches!(self, TrafficClass::Control | TrafficClass::ReliableSequenced | TrafficClass::ReliableUnsequenced)
    }

    pub fn is_sequenced(&self) -> bool {
        matches!(self, TrafficClass::Control | TrafficClass::ReliableSequenced | TrafficClass::UnreliableSequenced)
    }

    fn flags(&self) -> PacketFlags {
        let mut result = PacketFlags::empty();
        if self.is_reliable() {
            result |= PacketFlags::RELIABLE;
        }
        if self.is_sequenced() {
            result |= PacketFlags::SEQUENCED;
        }
        if *self == TrafficClass::Control {
            result |= PacketFlags::CONTROL;
        }
        result
    }

    fn from_flags(flags: PacketFlags) -> TrafficClass {
        if flags.contains(PacketFlags::CONTROL) {
            TrafficClass::Control
        }
        else {
            Self::for_message(flags.contains(PacketFlags::RELIABLE), flags.contains(PacketFlags::SEQUENCED))
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FragmentPosition {
    Whole,
    First,
    Intermediate,
    Last,
}

impl FragmentPosition {
    pub fn is_fragment(&self) -> bool {
        *self != FragmentPosition::Whole
    }

    /// true for fragments that continue a message started by an earlier fragment
    pub fn is_continuation(&self) -> bool {
        matches!(self, FragmentPosition::Intermediate | FragmentPosition::Last)
    }

    fn flags(&self) -> PacketFlags {
        match self {
            FragmentPosition::Whole => PacketFlags::empty(),
            FragmentPosition::First => PacketFlags::FIRST_FRAGMENT,
            FragmentPosition::Intermediate => PacketFlags::INTERMEDIATE_FRAGMENT,
            FragmentPosition::Last => PacketFlags::LAST_FRAGMENT,
        }
    }

    fn from_flags(flags: PacketFlags) -> anyhow::Result<FragmentPosition> {
        let first = flags.contains(PacketFlags::FIRST_FRAGMENT);
        let intermediate = flags.contains(PacketFlags::INTERMEDIATE_FRAGMENT);
        let last = flags.contains(PacketFlags::LAST_FRAGMENT);
        match (first, intermediate, last) {
            (false, false, false) => Ok(FragmentPosition::Whole),
            (true, false, false) => Ok(FragmentPosition::First),
            (false, true, false) => Ok(FragmentPosition::Intermediate),
            (false, false, true) => Ok(FragmentPosition::Last),
            _ => bail!("more than one fragment flag set: {:?}", flags),
        }
    }
}

/// The TSNs of the *other* sequenced flows that must have been delivered before a packet can be
///  delivered. Only the two flows other than the packet's own class are meaningful; the entry for
///  the packet's own class is ignored.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DeliveryPrerequisites {
    pub control: Tsn,
    pub reliable_sequenced: Tsn,
    pub unreliable_sequenced: Tsn,
}

impl DeliveryPrerequisites {
    /// the two TSNs that go on the wire for a packet of the given class, in wire order
    fn wire_pair(&self, class: TrafficClass) -> (Tsn, Tsn) {
        match class {
            TrafficClass::Control => (self.reliable_sequenced, self.unreliable_sequenced),
            TrafficClass::ReliableSequenced => (self.control, self.unreliable_sequenced),
            _ => (self.control, self.reliable_sequenced),
        }
    }

    fn from_wire_pair(class: TrafficClass, first: Tsn, second: Tsn) -> DeliveryPrerequisites {
        match class {
            TrafficClass::Control => DeliveryPrerequisites { reliable_sequenced: first, unreliable_sequenced: second, ..Default::default() },
            TrafficClass::ReliableSequenced => DeliveryPrerequisites { control: first, unreliable_sequenced: second, ..Default::default() },
            _ => DeliveryPrerequisites { control: first, reliable_sequenced: second, ..Default::default() },
        }
    }

    /// Checks whether the other sequenced flows have progressed far enough for a packet of class
    ///  `class` carrying these prerequisites to be delivered. The `next_*` parameters are the TSNs
    ///  each sequenced flow expects to deliver next.
    pub fn are_satisfied(&self, class: TrafficClass, next_control: Tsn, next_reliable_sequenced: Tsn, next_unreliable_sequenced: Tsn) -> bool {
        match class {
            TrafficClass::Control =>
                self.reliable_sequenced.is_before_or_eq(next_reliable_sequenced) && self.unreliable_sequenced.is_before_or_eq(next_unreliable_sequenced),
            TrafficClass::ReliableSequenced =>
                self.control.is_before_or_eq(next_control) && self.unreliable_sequenced.is_before_or_eq(next_unreliable_sequenced),
            TrafficClass::UnreliableSequenced =>
                self.control.is_before_or_eq(next_control) && self.reliable_sequenced.is_before_or_eq(next_reliable_sequenced),
            _ => true,
        }
    }
}

/// A single datagram's worth of data: header fields plus the chunks it carries.
///
/// NB: Piggyback chunks (SAck, Cancelled, timestamps) are *not* stored in `chunks` for packets
///      that are queued. They are added to the wire representation at transmit time and stripped
///      on arrival, so that a packet's `size()` is stable while it is held in a queue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub class: TrafficClass,
    pub fragment: FragmentPosition,
    pub retransmitted: bool,
    pub window_size: u32,
    pub validation: u32,
    pub tsn: Tsn,
    pub prerequisites: Option<DeliveryPrerequisites>,
    pub chunks: Vec<Chunk>,
}

impl Packet {
    pub fn new_data(class: TrafficClass, fragment: FragmentPosition, tag: u16, payload: Bytes) -> Packet {
        Packet {
            class,
            fragment,
            retransmitted: false,
            window_size: 0,
            validation: 0,
            tsn: Tsn::ZERO,
            prerequisites: None,
            chunks: vec![Chunk::Data { tag, payload }],
        }
    }

    /// A packet with no data and no TSN that only transports the given chunks. It is never
    ///  queued or acknowledged.
    pub fn new_standalone(chunks: Vec<Chunk>) -> Packet {
        Packet {
            class: TrafficClass::UnreliableUnsequenced,
            fragment: FragmentPosition::Whole,
            retransmitted: false,
            window_size: 0,
            validation: 0,
            tsn: Tsn::ZERO,
            prerequisites: None,
            chunks,
        }
    }

    pub fn new_control(chunks: Vec<Chunk>) -> Packet {
        Packet {
            class: TrafficClass::Control,
            ..Self::new_standalone(chunks)
        }
    }

    /// tag and payload of the packet's data chunk, if any
    pub fn data(&self) -> Option<(u16, &Bytes)> {
        self.chunks.iter()
            .find_map(|c| match c {
                Chunk::Data { tag, payload } => Some((*tag, payload)),
                _ => None,
            })
    }

    /// the data chunk's tag, or 0 for packets without data
    pub fn tag(&self) -> u16 {
        self.data().map(|(tag, _)| tag).unwrap_or(0)
    }

    pub fn data_len(&self) -> usize {
        self.data().map(|(_, payload)| payload.len()).unwrap_or(0)
    }

    pub fn has_data(&self) -> bool {
        self.data().is_some()
    }

    /// the packet's serialized size, without piggyback chunks added at transmit time
    pub fn size(&self) -> usize {
        self.header_len() + self.chunks.iter().map(|c| c.serialized_len()).sum::<usize>()
    }

    fn header_len(&self) -> usize {
        PACKET_HEADER_LEN + if self.prerequisites.is_some() { DELIVERY_PREREQUISITES_LEN } else { 0 }
    }

    /// Removes and returns all piggyback chunks, leaving only chunks that belong to the packet
    pub fn take_piggyback_chunks(&mut self) -> Vec<Chunk> {
        let (piggyback, own) = std::mem::take(&mut self.chunks)
            .into_iter()
            .partition(|c| c.is_piggyback());
        self.chunks = own;
        piggyback
    }

    pub fn flags(&self) -> PacketFlags {
        let mut flags = self.class.flags() | self.fragment.flags();
        if self.prerequisites.is_some() {
            flags |= PacketFlags::DELIVERY_PREREQUISITES;
        }
        if self.retransmitted {
            flags |= PacketFlags::RETRANSMITTED;
        }
        flags
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.ser_with_piggyback(&[], buf);
    }

    /// Serializes the packet with additional chunks appended after its own chunks
    pub fn ser_with_piggyback(&self, piggyback: &[Chunk], buf: &mut BytesMut) {
        buf.put_u16(PROTOCOL_VERSION | self.flags().bits());
        buf.put_u32(self.window_size);
        buf.put_u32(self.validation);
        buf.put_u32(self.tsn.to_raw());
        if let Some(prerequisites) = &self.prerequisites {
            let (first, second) = prerequisites.wire_pair(self.class);
            buf.put_u32(first.to_raw());
            buf.put_u32(second.to_raw());
        }
        for chunk in self.chunks.iter().chain(piggyback) {
            chunk.ser(buf);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        if buf.remaining() < PACKET_HEADER_LEN {
            bail!("packet of length {} is shorter than the packet header", buf.remaining());
        }

        let raw_flags = buf.try_get_u16()?;
        if raw_flags & VERSION_MASK != PROTOCOL_VERSION {
            bail!("unsupported protocol version {:#06x}", raw_flags & VERSION_MASK);
        }
        let flags = match PacketFlags::from_bits(raw_flags & !VERSION_MASK) {
            Some(flags) => flags,
            None => bail!("unsupported packet flags {:#06x}", raw_flags),
        };

        let class = TrafficClass::from_flags(flags);
        let fragment = FragmentPosition::from_flags(flags)?;
        let window_size = buf.try_get_u32()?;
        let validation = buf.try_get_u32()?;
        let tsn = Tsn::from_raw(buf.try_get_u32()?);

        let prerequisites = if flags.contains(PacketFlags::DELIVERY_PREREQUISITES) {
            let first = Tsn::from_raw(buf.try_get_u32()?);
            let second = Tsn::from_raw(buf.try_get_u32()?);
            Some(DeliveryPrerequisites::from_wire_pair(class, first, second))
        }
        else {
            None
        };

        let mut chunks = Vec::new();
        while buf.remaining() >= CHUNK_HEADER_LEN {
            chunks.push(Chunk::deser(buf)?);
        }
        if buf.has_remaining() {
            bail!("{} trailing bytes after the last chunk", buf.remaining());
        }

        if chunks.iter().filter(|c| matches!(c, Chunk::Data { .. })).count() > 1 {
            bail!("packet with more than one data chunk");
        }

        Ok(Packet {
            class,
            fragment,
            retransmitted: flags.contains(PacketFlags::RETRANSMITTED),
            window_size,
            validation,
            tsn,
            prerequisites,
            chunks,
        })
    }

    /// the maximum payload size of a data packet for a given MTU
    pub fn max_payload_len(mtu: usize, with_prerequisites: bool) -> usize {
        let overhead = PACKET_HEADER_LEN + DATA_CHUNK_HEADER_LEN
            + if with_prerequisites { DELIVERY_PREREQUISITES_LEN } else { 0 };
        mtu.saturating_sub(overhead)
    }
}
