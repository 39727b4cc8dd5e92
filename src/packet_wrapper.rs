use crate::freeze::{Defroster, Freezer};
use crate::packet::{FragmentPosition, Packet};
use crate::tsn::Tsn;
use std::time::Duration;
use tokio::time::Instant;

/// Transport bookkeeping for a packet while it is held in one of the queues
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WrapperMeta {
    pub enqueue_time: Instant,
    /// time of the last send or receive of the packet
    pub last_io_time: Instant,
    /// 0 is the lowest priority, 255 the highest
    pub priority: u8,
    /// the TSN that correlates all fragments of a message, `Tsn::ZERO` for unfragmented messages
    pub message_tsn: Tsn,
    /// The sender gives up on a reliable sequenced packet that is not acknowledged within this
    ///  time after enqueueing. `None` means it keeps retrying forever.
    pub retry_timeout: Option<Duration>,
    pub retransmit_timeout: Duration,
    pub retransmit_count: u32,
}

impl WrapperMeta {
    pub fn new(now: Instant, priority: u8) -> WrapperMeta {
        WrapperMeta {
            enqueue_time: now,
            last_io_time: now,
            priority,
            message_tsn: Tsn::ZERO,
            retry_timeout: None,
            retransmit_timeout: Duration::ZERO,
            retransmit_count: 0,
        }
    }

    fn freeze(&self, freezer: &mut Freezer) {
        freezer.put_instant(self.enqueue_time);
        freezer.put_instant(self.last_io_time);
        freezer.put_u8(self.priority);
        freezer.put_tsn(self.message_tsn);
        freezer.put_bool(self.retry_timeout.is_some());
        if let Some(retry_timeout) = self.retry_timeout {
            freezer.put_duration(retry_timeout);
        }
        freezer.put_duration(self.retransmit_timeout);
        freezer.put_u32(self.retransmit_count);
    }

    fn defrost(defroster: &mut Defroster) -> anyhow::Result<WrapperMeta> {
        Ok(WrapperMeta {
            enqueue_time: defroster.get_instant()?,
            last_io_time: defroster.get_instant()?,
            priority: defroster.get_u8()?,
            message_tsn: defroster.get_tsn()?,
            retry_timeout: if defroster.get_bool()? { Some(defroster.get_duration()?) } else { None },
            retransmit_timeout: defroster.get_duration()?,
            retransmit_count: defroster.get_u32()?,
        })
    }
}

/// A queue entry: either a packet, or a tombstone for a TSN the peer cancelled. A tombstone
///  occupies its TSN's slot in a sequenced queue so that delivery can move past it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PacketWrapper {
    Payload(Packet, WrapperMeta),
    Cancelled(Tsn, WrapperMeta),
}

impl PacketWrapper {
    pub fn new(packet: Packet, now: Instant, priority: u8) -> PacketWrapper {
        PacketWrapper::Payload(packet, WrapperMeta::new(now, priority))
    }

    pub fn tombstone(tsn: Tsn, now: Instant) -> PacketWrapper {
        PacketWrapper::Cancelled(tsn, WrapperMeta::new(now, 0))
    }

    pub fn tsn(&self) -> Tsn {
        match self {
            PacketWrapper::Payload(packet, _) => packet.tsn,
            PacketWrapper::Cancelled(tsn, _) => *tsn,
        }
    }

    pub fn meta(&self) -> &WrapperMeta {
        match self {
            PacketWrapper::Payload(_, meta) | PacketWrapper::Cancelled(_, meta) => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut WrapperMeta {
        match self {
            PacketWrapper::Payload(_, meta) | PacketWrapper::Cancelled(_, meta) => meta,
        }
    }

    pub fn packet(&self) -> Option<&Packet> {
        match self {
            PacketWrapper::Payload(packet, _) => Some(packet),
            PacketWrapper::Cancelled(..) => None,
        }
    }

    pub fn packet_mut(&mut self) -> Option<&mut Packet> {
        match self {
            PacketWrapper::Payload(packet, _) => Some(packet),
            PacketWrapper::Cancelled(..) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PacketWrapper::Cancelled(..))
    }

    /// the packet's size for flow control accounting, 0 for tombstones
    pub fn size(&self) -> usize {
        self.packet().map(|p| p.size()).unwrap_or(0)
    }

    pub fn fragment(&self) -> FragmentPosition {
        self.packet().map(|p| p.fragment).unwrap_or(FragmentPosition::Whole)
    }

    pub fn priority(&self) -> u8 {
        self.meta().priority
    }

    pub fn message_tsn(&self) -> Tsn {
        self.meta().message_tsn
    }

    pub fn freeze(&self, freezer: &mut Freezer) {
        match self {
            PacketWrapper::Payload(packet, meta) => {
                freezer.put_bool(true);
                freezer.put_packet(packet);
                meta.freeze(freezer);
            }
            PacketWrapper::Cancelled(tsn, meta) => {
                freezer.put_bool(false);
                freezer.put_tsn(*tsn);
                meta.freeze(freezer);
            }
        }
    }

    pub fn defrost(defroster: &mut Defroster) -> anyhow::Result<PacketWrapper> {
        if defroster.get_bool()? {
            let packet = defroster.get_packet()?;
            Ok(PacketWrapper::Payload(packet, WrapperMeta::defrost(defroster)?))
        }
        else {
            let tsn = defroster.get_tsn()?;
            Ok(PacketWrapper::Cancelled(tsn, WrapperMeta::defrost(defroster)?))
        }
    }
}
