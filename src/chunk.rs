use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::tsn::Tsn;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const CHUNK_HEADER_LEN: usize = 4;
pub const DATA_CHUNK_HEADER_LEN: usize = CHUNK_HEADER_LEN + 2;

const CHUNK_CLASS_METADATA: u16 = 0x1000;
const CHUNK_CLASS_DATA: u16 = 0x2000;
const CHUNK_CLASS_STATE_CHANGE: u16 = 0x4000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ChunkType {
    SAck = CHUNK_CLASS_METADATA | 0x0001,
    Heartbeat = CHUNK_CLASS_METADATA | 0x0002,
    Cancelled = CHUNK_CLASS_METADATA | 0x0003,
    Timestamp = CHUNK_CLASS_METADATA | 0x0004,
    TimestampAck = CHUNK_CLASS_METADATA | 0x0005,
    Data = CHUNK_CLASS_DATA | 0x0001,
    Init = CHUNK_CLASS_STATE_CHANGE | 0x0001,
    InitAck = CHUNK_CLASS_STATE_CHANGE | 0x0002,
    CookieEcho = CHUNK_CLASS_STATE_CHANGE | 0x0003,
    CookieAck = CHUNK_CLASS_STATE_CHANGE | 0x0004,
    Shutdown = CHUNK_CLASS_STATE_CHANGE | 0x0005,
    ShutdownAck = CHUNK_CLASS_STATE_CHANGE | 0x0006,
    ShutdownComplete = CHUNK_CLASS_STATE_CHANGE | 0x0007,
    Abort = CHUNK_CLASS_STATE_CHANGE | 0x0008,
    Suspend = CHUNK_CLASS_STATE_CHANGE | 0x0009,
    SuspendAck = CHUNK_CLASS_STATE_CHANGE | 0x000A,
    Resume = CHUNK_CLASS_STATE_CHANGE | 0x000B,
    ResumeAck = CHUNK_CLASS_STATE_CHANGE | 0x000C,
    ReEstablish = CHUNK_CLASS_STATE_CHANGE | 0x000D,
    ReEstablishAck = CHUNK_CLASS_STATE_CHANGE | 0x000E,
    SimpleSuspend = CHUNK_CLASS_STATE_CHANGE | 0x000F,
    SimpleSuspendAck = CHUNK_CLASS_STATE_CHANGE | 0x0010,
    SimpleConnect = CHUNK_CLASS_STATE_CHANGE | 0x0011,
    SimpleConnectAck = CHUNK_CLASS_STATE_CHANGE | 0x0012,
}

impl ChunkType {
    pub fn is_state_change(&self) -> bool {
        u16::from(*self) & CHUNK_CLASS_STATE_CHANGE != 0
    }
}

/// A set of TSNs for one flow as it is transmitted in SAck and Cancelled chunks: contiguous runs
///  as (start, end) ranges (both inclusive), isolated TSNs individually
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TsnBlocks {
    pub ranges: Vec<(Tsn, Tsn)>,
    pub singles: Vec<Tsn>,
}

impl TsnBlocks {
    const BLOCK_HEADER_LEN: usize = 3;
    const BLOCK_TYPE_RANGE: u8 = 0x10;
    const BLOCK_TYPE_SINGLE: u8 = 0x20;
    /// upper bound for the number of TSNs in a single range; no window can have more
    ///  packets in flight
    const MAX_RANGE_SPAN: u32 = 1 << 16;

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.singles.is_empty()
    }

    pub fn push(&mut self, start: Tsn, end: Tsn) {
        if start == end {
            self.singles.push(start);
        }
        else {
            self.ranges.push((start, end));
        }
    }

    /// All TSNs in this set, ranges expanded
    pub fn iter_tsns(&self) -> impl Iterator<Item=Tsn> + '_ {
        self.ranges.iter()
            .flat_map(|&(start, end)| (0..=start.distance_to(end)).map(move |offs| start + offs))
            .chain(self.singles.iter().cloned())
    }

    fn serialized_len(&self) -> usize {
        let mut result = 0;
        if !self.ranges.is_empty() {
            result += Self::BLOCK_HEADER_LEN + 8 * self.ranges.len();
        }
        if !self.singles.is_empty() {
            result += Self::BLOCK_HEADER_LEN + 4 * self.singles.len();
        }
        result
    }

    fn ser(&self, flow_bits: u8, buf: &mut BytesMut) {
        if !self.ranges.is_empty() {
            buf.put_u8(flow_bits | Self::BLOCK_TYPE_RANGE);
            buf.put_u16((Self::BLOCK_HEADER_LEN + 8 * self.ranges.len()).prechecked_cast());
            for (start, end) in &self.ranges {
                buf.put_u32(start.to_raw());
                buf.put_u32(end.to_raw());
            }
        }
        if !self.singles.is_empty() {
            buf.put_u8(flow_bits | Self::BLOCK_TYPE_SINGLE);
            buf.put_u16((Self::BLOCK_HEADER_LEN + 4 * self.singles.len()).prechecked_cast());
            for tsn in &self.singles {
                buf.put_u32(tsn.to_raw());
            }
        }
    }

    fn merge(&mut self, other: TsnBlocks) {
        self.ranges.extend(other.ranges);
        self.singles.extend(other.singles);
    }

    /// Parses all blocks remaining in `buf`, returning each block's flow bits with its elements.
    ///  A flow may appear in more than one block.
    fn deser_blocks(buf: &mut impl Buf) -> anyhow::Result<Vec<(u8, TsnBlocks)>> {
        let mut result = Vec::new();
        while buf.has_remaining() {
            let flags = buf.try_get_u8()?;
            let block_len: usize = buf.try_get_u16()?.safe_cast();
            if block_len < Self::BLOCK_HEADER_LEN || buf.remaining() < block_len - Self::BLOCK_HEADER_LEN {
                bail!("TSN block length {} is inconsistent with the remaining buffer", block_len);
            }
            let mut elements = buf.copy_to_bytes(block_len - Self::BLOCK_HEADER_LEN);

            let mut block = TsnBlocks::default();
            match flags & 0xf0 {
                Self::BLOCK_TYPE_RANGE => {
                    if elements.remaining() % 8 != 0 {
                        bail!("range block with a length that is not a multiple of 8");
                    }
                    while elements.has_remaining() {
                        let start = Tsn::from_raw(elements.try_get_u32()?);
                        let end = Tsn::from_raw(elements.try_get_u32()?);
                        if end.is_before(start) {
                            bail!("TSN range #{}..#{} ends before it starts", start.to_raw(), end.to_raw());
                        }
                        if start.distance_to(end) >= Self::MAX_RANGE_SPAN {
                            bail!("TSN range #{}..#{} exceeds the maximum span", start.to_raw(), end.to_raw());
                        }
                        block.ranges.push((start, end));
                    }
                }
                Self::BLOCK_TYPE_SINGLE => {
                    if elements.remaining() % 4 != 0 {
                        bail!("single TSN block with a length that is not a multiple of 4");
                    }
                    while elements.has_remaining() {
                        block.singles.push(Tsn::from_raw(elements.try_get_u32()?));
                    }
                }
                other => bail!("unsupported TSN block type {:#04x}", other),
            }
            result.push((flags & 0x0f, block));
        }
        Ok(result)
    }
}

/// Selective acknowledgement for the three reliable flows: everything up to and including the
///  cumulative TSN is acknowledged, plus the TSNs in the blocks
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SAckChunk {
    pub control_cumulative: Tsn,
    pub reliable_sequenced_cumulative: Tsn,
    pub reliable_unsequenced_cumulative: Tsn,
    pub control: TsnBlocks,
    pub reliable_sequenced: TsnBlocks,
    pub reliable_unsequenced: TsnBlocks,
}

impl SAckChunk {
    const FLOW_CONTROL: u8 = 0x01;
    const FLOW_RELIABLE_SEQUENCED: u8 = 0x02;
    const FLOW_RELIABLE_UNSEQUENCED: u8 = 0x04;

    fn body_len(&self) -> usize {
        12 + self.control.serialized_len() + self.reliable_sequenced.serialized_len() + self.reliable_unsequenced.serialized_len()
    }

    fn ser_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.control_cumulative.to_raw());
        buf.put_u32(self.reliable_sequenced_cumulative.to_raw());
        buf.put_u32(self.reliable_unsequenced_cumulative.to_raw());
        self.control.ser(Self::FLOW_CONTROL, buf);
        self.reliable_sequenced.ser(Self::FLOW_RELIABLE_SEQUENCED, buf);
        self.reliable_unsequenced.ser(Self::FLOW_RELIABLE_UNSEQUENCED, buf);
    }

    fn deser_body(buf: &mut impl Buf) -> anyhow::Result<SAckChunk> {
        let mut result = SAckChunk {
            control_cumulative: Tsn::from_raw(buf.try_get_u32()?),
            reliable_sequenced_cumulative: Tsn::from_raw(buf.try_get_u32()?),
            reliable_unsequenced_cumulative: Tsn::from_raw(buf.try_get_u32()?),
            ..Default::default()
        };

        for (flow, block) in TsnBlocks::deser_blocks(buf)? {
            match flow {
                Self::FLOW_CONTROL => result.control.merge(block),
                Self::FLOW_RELIABLE_SEQUENCED => result.reliable_sequenced.merge(block),
                Self::FLOW_RELIABLE_UNSEQUENCED => result.reliable_unsequenced.merge(block),
                other => bail!("unsupported flow bits in SAck block: {:#04x}", other),
            }
        }
        Ok(result)
    }
}

/// TSNs that the sender gave up on, so that the receiver can skip over them
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CancelledChunk {
    pub reliable_sequenced: TsnBlocks,
    pub reliable_unsequenced: TsnBlocks,
    pub unreliable_sequenced: TsnBlocks,
}

impl CancelledChunk {
    const FLOW_RELIABLE_SEQUENCED: u8 = 0x01;
    const FLOW_RELIABLE_UNSEQUENCED: u8 = 0x02;
    const FLOW_UNRELIABLE_SEQUENCED: u8 = 0x04;

    pub fn is_empty(&self) -> bool {
        self.reliable_sequenced.is_empty() && self.reliable_unsequenced.is_empty() && self.unreliable_sequenced.is_empty()
    }

    fn body_len(&self) -> usize {
        self.reliable_sequenced.serialized_len() + self.reliable_unsequenced.serialized_len() + self.unreliable_sequenced.serialized_len()
    }

    fn ser_body(&self, buf: &mut BytesMut) {
        self.reliable_sequenced.ser(Self::FLOW_RELIABLE_SEQUENCED, buf);
        self.reliable_unsequenced.ser(Self::FLOW_RELIABLE_UNSEQUENCED, buf);
        self.unreliable_sequenced.ser(Self::FLOW_UNRELIABLE_SEQUENCED, buf);
    }

    fn deser_body(buf: &mut impl Buf) -> anyhow::Result<CancelledChunk> {
        let mut result = CancelledChunk::default();
        for (flow, block) in TsnBlocks::deser_blocks(buf)? {
            match flow {
                Self::FLOW_RELIABLE_SEQUENCED => result.reliable_sequenced.merge(block),
                Self::FLOW_RELIABLE_UNSEQUENCED => result.reliable_unsequenced.merge(block),
                Self::FLOW_UNRELIABLE_SEQUENCED => result.unreliable_sequenced.merge(block),
                other => bail!("unsupported flow bits in Cancelled block: {:#04x}", other),
            }
        }
        Ok(result)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Chunk {
    Data { tag: u16, payload: Bytes },
    SAck(SAckChunk),
    Cancelled(CancelledChunk),
    Heartbeat { timestamp: i64 },
    Timestamp { timestamp: i64 },
    TimestampAck { timestamp: i64 },
    /// connection lifecycle chunks; their bodies belong to the handshake and are carried opaquely
    StateChange { chunk_type: ChunkType, body: Bytes },
}

impl Chunk {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Chunk::Data { .. } => ChunkType::Data,
            Chunk::SAck(_) => ChunkType::SAck,
            Chunk::Cancelled(_) => ChunkType::Cancelled,
            Chunk::Heartbeat { .. } => ChunkType::Heartbeat,
            Chunk::Timestamp { .. } => ChunkType::Timestamp,
            Chunk::TimestampAck { .. } => ChunkType::TimestampAck,
            Chunk::StateChange { chunk_type, .. } => *chunk_type,
        }
    }

    pub fn state_change(chunk_type: ChunkType) -> Chunk {
        Chunk::StateChange { chunk_type, body: Bytes::new() }
    }

    /// Piggyback chunks are acknowledgement and timing metadata that can ride along on any packet.
    ///  They are applied on arrival and never stored with the packet.
    pub fn is_piggyback(&self) -> bool {
        matches!(self, Chunk::SAck(_) | Chunk::Cancelled(_) | Chunk::Timestamp { .. } | Chunk::TimestampAck { .. })
    }

    pub fn serialized_len(&self) -> usize {
        CHUNK_HEADER_LEN + match self {
            Chunk::Data { payload, .. } => 2 + payload.len(),
            Chunk::SAck(sack) => sack.body_len(),
            Chunk::Cancelled(cancelled) => cancelled.body_len(),
            Chunk::Heartbeat { .. } | Chunk::Timestamp { .. } | Chunk::TimestampAck { .. } => 8,
            Chunk::StateChange { body, .. } => body.len(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.chunk_type().into());
        buf.put_u16(self.serialized_len().prechecked_cast());
        match self {
            Chunk::Data { tag, payload } => {
                buf.put_u16(*tag);
                buf.put_slice(payload);
            }
            Chunk::SAck(sack) => sack.ser_body(buf),
            Chunk::Cancelled(cancelled) => cancelled.ser_body(buf),
            Chunk::Heartbeat { timestamp } | Chunk::Timestamp { timestamp } | Chunk::TimestampAck { timestamp } => {
                buf.put_i64(*timestamp);
            }
            Chunk::StateChange { body, .. } => buf.put_slice(body),
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Chunk> {
        let raw_type = buf.try_get_u16()?;
        let chunk_len: usize = buf.try_get_u16()?.safe_cast();
        if chunk_len < CHUNK_HEADER_LEN {
            bail!("chunk length {} is shorter than the chunk header", chunk_len);
        }
        if buf.remaining() < chunk_len - CHUNK_HEADER_LEN {
            bail!("chunk length {} exceeds the remaining packet length {}", chunk_len, buf.remaining() + CHUNK_HEADER_LEN);
        }
        let chunk_type = ChunkType::try_from(raw_type)
            .map_err(|_| anyhow!("unknown chunk type {:#06x}", raw_type))?;
        let mut body = buf.copy_to_bytes(chunk_len - CHUNK_HEADER_LEN);

        let chunk = match chunk_type {
            ChunkType::Data => {
                let tag = body.try_get_u16()?;
                Chunk::Data { tag, payload: body }
            }
            ChunkType::SAck => Chunk::SAck(SAckChunk::deser_body(&mut body)?),
            ChunkType::Cancelled => Chunk::Cancelled(CancelledChunk::deser_body(&mut body)?),
            ChunkType::Heartbeat => Chunk::Heartbeat { timestamp: Self::deser_timestamp(&mut body)? },
            ChunkType::Timestamp => Chunk::Timestamp { timestamp: Self::deser_timestamp(&mut body)? },
            ChunkType::TimestampAck => Chunk::TimestampAck { timestamp: Self::deser_timestamp(&mut body)? },
            other => Chunk::StateChange { chunk_type: other, body },
        };
        Ok(chunk)
    }

    fn deser_timestamp(body: &mut Bytes) -> anyhow::Result<i64> {
        let timestamp = body.try_get_i64()?;
        if body.has_remaining() {
            bail!("timestamp chunk with trailing bytes");
        }
        Ok(timestamp)
    }
}
