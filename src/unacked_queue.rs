use crate::freeze::{Defroster, Freezer};
use crate::packet_wrapper::PacketWrapper;
use crate::tsn::Tsn;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Acknowledged {
    pub packets: usize,
    pub bytes: usize,
}

impl Acknowledged {
    fn add(&mut self, wrapper: &PacketWrapper) {
        self.packets += 1;
        self.bytes += wrapper.size();
    }
}

/// Reliable packets that were transmitted and are waiting for acknowledgement, for one reliable
///  traffic class. Entries are in TSN order because TSNs are assigned in transmission order.
#[derive(Debug, Default)]
pub struct UnacknowledgedPacketQueue {
    entries: VecDeque<PacketWrapper>,
    queued_bytes: usize,
    /// shortest time between first transmission and acknowledgement since the last call to
    ///  `take_min_ack_time`
    min_ack_time: Option<Duration>,
}

impl UnacknowledgedPacketQueue {
    pub fn new() -> UnacknowledgedPacketQueue {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn insert(&mut self, wrapper: PacketWrapper) {
        self.queued_bytes += wrapper.size();
        self.entries.push_back(wrapper);
    }

    fn on_acknowledged(&mut self, wrapper: &PacketWrapper, now: Instant, result: &mut Acknowledged) {
        trace!("#{} acknowledged", wrapper.tsn());
        if wrapper.meta().retransmit_count == 0 {
            let ack_time = now.saturating_duration_since(wrapper.meta().last_io_time);
            self.min_ack_time = Some(self.min_ack_time.map_or(ack_time, |t| t.min(ack_time)));
        }
        self.queued_bytes -= wrapper.size();
        result.add(wrapper);
    }

    /// Removes all packets up to and including `tsn`
    pub fn acknowledge_up_to(&mut self, tsn: Tsn, now: Instant) -> Acknowledged {
        let mut result = Acknowledged::default();
        while let Some(first) = self.entries.front() {
            if first.tsn().is_after(tsn) {
                break;
            }
            if let Some(acknowledged) = self.entries.pop_front() {
                self.on_acknowledged(&acknowledged, now, &mut result);
            }
        }
        result
    }

    /// Removes all packets in the inclusive range
    pub fn acknowledge_range(&mut self, start: Tsn, end: Tsn, now: Instant) -> Acknowledged {
        let mut result = Acknowledged::default();
        let mut remaining = VecDeque::with_capacity(self.entries.len());
        for wrapper in std::mem::take(&mut self.entries) {
            if wrapper.tsn().is_after_or_eq(start) && wrapper.tsn().is_before_or_eq(end) {
                self.on_acknowledged(&wrapper, now, &mut result);
            }
            else {
                remaining.push_back(wrapper);
            }
        }
        self.entries = remaining;
        result
    }

    /// The TSN of the packet whose retransmission is most overdue, if any packet is due
    pub fn next_timed_out(&self, now: Instant) -> Option<Tsn> {
        self.entries.iter()
            .map(|w| (w.tsn(), w.meta().last_io_time + w.meta().retransmit_timeout))
            .filter(|(_, due)| *due <= now)
            .min_by_key(|(_, due)| *due)
            .map(|(tsn, _)| tsn)
    }

    /// the earliest time at which a packet becomes due for retransmission
    pub fn next_due_time(&self) -> Option<Instant> {
        self.entries.iter()
            .map(|w| w.meta().last_io_time + w.meta().retransmit_timeout)
            .min()
    }

    pub fn get(&self, tsn: Tsn) -> Option<&PacketWrapper> {
        self.entries.iter().find(|w| w.tsn() == tsn)
    }

    pub fn packet_retransmitted(&mut self, tsn: Tsn, now: Instant, new_retransmit_timeout: Duration) {
        if let Some(wrapper) = self.entries.iter_mut().find(|w| w.tsn() == tsn) {
            let meta = wrapper.meta_mut();
            meta.last_io_time = now;
            meta.retransmit_count += 1;
            meta.retransmit_timeout = new_retransmit_timeout;
            if let Some(packet) = wrapper.packet_mut() {
                packet.retransmitted = true;
            }
        }
    }

    pub fn remove(&mut self, tsn: Tsn) -> Option<PacketWrapper> {
        let idx = self.entries.iter().position(|w| w.tsn() == tsn)?;
        let removed = self.entries.remove(idx)?;
        self.queued_bytes -= removed.size();
        Some(removed)
    }

    /// Removes all packets whose retry timeout elapsed since they were first enqueued for
    ///  transmission
    pub fn remove_expired(&mut self, now: Instant) -> Vec<PacketWrapper> {
        let (expired, remaining): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|w| match w.meta().retry_timeout {
                Some(retry_timeout) => now.saturating_duration_since(w.meta().enqueue_time) >= retry_timeout,
                None => false,
            });
        self.entries = remaining;
        for wrapper in &expired {
            trace!("#{} expired before it was acknowledged", wrapper.tsn());
            self.queued_bytes -= wrapper.size();
        }
        expired.into()
    }

    /// Removes all packets with the given tag, returning their TSNs
    pub fn cancel(&mut self, tag: u16) -> Vec<Tsn> {
        let mut cancelled = Vec::new();
        let mut freed_bytes = 0;
        self.entries.retain(|w| {
            let matches = w.packet().map(|p| p.has_data() && p.tag() == tag).unwrap_or(false);
            if matches {
                cancelled.push(w.tsn());
                freed_bytes += w.size();
            }
            !matches
        });
        self.queued_bytes -= freed_bytes;
        cancelled
    }

    pub fn take_min_ack_time(&mut self) -> Option<Duration> {
        self.min_ack_time.take()
    }

    pub fn freeze(&self, freezer: &mut Freezer) {
        freezer.put_len(self.entries.len());
        for entry in &self.entries {
            entry.freeze(freezer);
        }
    }

    pub fn defrost(defroster: &mut Defroster) -> anyhow::Result<UnacknowledgedPacketQueue> {
        let mut result = UnacknowledgedPacketQueue::new();
        for _ in 0..defroster.get_len()? {
            result.insert(PacketWrapper::defrost(defroster)?);
        }
        Ok(result)
    }
}
