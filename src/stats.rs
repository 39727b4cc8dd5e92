use crate::packet::TrafficClass;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Message counts per traffic class, either for a connection as a whole or for a single tag
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MessageStats {
    pub sent_reliable_sequenced: u64,
    pub sent_reliable_unsequenced: u64,
    pub sent_unreliable_sequenced: u64,
    pub sent_unreliable_unsequenced: u64,
    pub received_reliable_sequenced: u64,
    pub received_reliable_unsequenced: u64,
    pub received_unreliable_sequenced: u64,
    pub received_unreliable_unsequenced: u64,
    pub cancelled_packets: u64,
}

impl MessageStats {
    fn sent_mut(&mut self, class: TrafficClass) -> Option<&mut u64> {
        match class {
            TrafficClass::ReliableSequenced => Some(&mut self.sent_reliable_sequenced),
            TrafficClass::ReliableUnsequenced => Some(&mut self.sent_reliable_unsequenced),
            TrafficClass::UnreliableSequenced => Some(&mut self.sent_unreliable_sequenced),
            TrafficClass::UnreliableUnsequenced => Some(&mut self.sent_unreliable_unsequenced),
            TrafficClass::Control => None,
        }
    }

    fn received_mut(&mut self, class: TrafficClass) -> Option<&mut u64> {
        match class {
            TrafficClass::ReliableSequenced => Some(&mut self.received_reliable_sequenced),
            TrafficClass::ReliableUnsequenced => Some(&mut self.received_reliable_unsequenced),
            TrafficClass::UnreliableSequenced => Some(&mut self.received_unreliable_sequenced),
            TrafficClass::UnreliableUnsequenced => Some(&mut self.received_unreliable_unsequenced),
            TrafficClass::Control => None,
        }
    }
}

#[derive(Default)]
struct MessageStatsByTag {
    overall: MessageStats,
    per_tag: FxHashMap<u16, MessageStats>,
}

impl MessageStatsByTag {
    fn update(&mut self, tag: u16, f: impl Fn(&mut MessageStats)) {
        f(&mut self.overall);
        f(self.per_tag.entry(tag).or_default());
    }
}

/// Counters that are updated by the connection's loops while it is running
#[derive(Default)]
pub struct MocketStats {
    retransmits: AtomicU64,
    sent_packets: AtomicU64,
    sent_bytes: AtomicU64,
    received_packets: AtomicU64,
    received_bytes: AtomicU64,
    discarded_duplicate: AtomicU64,
    discarded_no_room: AtomicU64,
    discarded_reassembly_skipped: AtomicU64,
    messages: Mutex<MessageStatsByTag>,
}

/// A point-in-time copy of a connection's statistics
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    pub retransmits: u64,
    pub sent_packets: u64,
    pub sent_bytes: u64,
    pub received_packets: u64,
    pub received_bytes: u64,
    pub discarded_duplicate: u64,
    pub discarded_no_room: u64,
    pub discarded_reassembly_skipped: u64,

    pub pending_data_size: usize,
    pub pending_packet_count: usize,
    pub reliable_sequenced_unacknowledged_data_size: usize,
    pub reliable_sequenced_unacknowledged_packet_count: usize,
    pub reliable_unsequenced_unacknowledged_data_size: usize,
    pub reliable_unsequenced_unacknowledged_packet_count: usize,

    pub messages: MessageStats,
    pub messages_per_tag: FxHashMap<u16, MessageStats>,
}

impl MocketStats {
    pub fn packet_retransmitted(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self, num_bytes: usize) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(num_bytes as u64, Ordering::Relaxed);
    }

    pub fn packet_received(&self, num_bytes: usize) {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(num_bytes as u64, Ordering::Relaxed);
    }

    pub fn discarded_duplicate(&self) {
        self.discarded_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn discarded_no_room(&self) {
        self.discarded_no_room.fetch_add(1, Ordering::Relaxed);
    }

    pub fn discarded_reassembly_skipped(&self, num_packets: usize) {
        self.discarded_reassembly_skipped.fetch_add(num_packets as u64, Ordering::Relaxed);
    }

    pub async fn message_sent(&self, class: TrafficClass, tag: u16) {
        self.messages.lock().await
            .update(tag, |s| if let Some(n) = s.sent_mut(class) { *n += 1 });
    }

    pub async fn message_received(&self, class: TrafficClass, tag: u16) {
        self.messages.lock().await
            .update(tag, |s| if let Some(n) = s.received_mut(class) { *n += 1 });
    }

    pub async fn packets_cancelled(&self, tag: u16, num_packets: usize) {
        if num_packets == 0 {
            return;
        }
        self.messages.lock().await
            .update(tag, |s| s.cancelled_packets += num_packets as u64);
    }

    /// Copies the counters. Queue sizes are not tracked here and are left at 0.
    pub async fn snapshot(&self) -> StatsSnapshot {
        let messages = self.messages.lock().await;
        StatsSnapshot {
            retransmits: self.retransmits.load(Ordering::Relaxed),
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_packets: self.received_packets.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            discarded_duplicate: self.discarded_duplicate.load(Ordering::Relaxed),
            discarded_no_room: self.discarded_no_room.load(Ordering::Relaxed),
            discarded_reassembly_skipped: self.discarded_reassembly_skipped.load(Ordering::Relaxed),
            messages: messages.overall,
            messages_per_tag: messages.per_tag.clone(),
            ..Default::default()
        }
    }
}
