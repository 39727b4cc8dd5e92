use crate::freeze::{get_marked_list, put_marked_list, Defroster, Freezer};
use crate::packet::FragmentPosition;
use crate::packet_wrapper::PacketWrapper;
use crate::tsn::Tsn;
use crate::tsn_range::ReceivedTsnTracker;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug)]
pub enum ReassemblyOutcome {
    Duplicate,
    /// the fragment was stored, its message is not complete yet
    Pending,
    /// all packets of a message in TSN order, removed from the queue
    Complete(Vec<PacketWrapper>),
}

/// Receive-side reassembly for one unsequenced traffic class. Fragments are held in TSN order
///  until a complete chain `first, intermediate*, last` with consecutive TSNs is present.
///
/// The reliable variant remembers all TSNs it ever accepted to reject retransmitted duplicates.
///  The unreliable variant instead discards fragments that were not completed in time.
pub struct UnsequencedPacketQueue {
    received: Option<ReceivedTsnTracker>,
    fragment_expiry: Duration,
    entries: VecDeque<PacketWrapper>,
    queued_bytes: usize,
}

impl UnsequencedPacketQueue {
    /// `first_expected` is the peer's first TSN for the flow
    pub fn new_reliable(first_expected: Tsn) -> UnsequencedPacketQueue {
        UnsequencedPacketQueue {
            received: Some(ReceivedTsnTracker::new(first_expected)),
            fragment_expiry: Duration::MAX,
            entries: VecDeque::new(),
            queued_bytes: 0,
        }
    }

    pub fn new_unreliable(fragment_expiry: Duration) -> UnsequencedPacketQueue {
        UnsequencedPacketQueue {
            received: None,
            fragment_expiry,
            entries: VecDeque::new(),
            queued_bytes: 0,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.received.is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Records a TSN as received without a packet, e.g. because the peer cancelled it. Returns
    ///  `false` for the unreliable variant or if the TSN was known already.
    pub fn mark_received(&mut self, tsn: Tsn) -> bool {
        match &mut self.received {
            Some(received) => received.add(tsn),
            None => false,
        }
    }

    /// Inserts a received packet. The wrapper's enqueue time is its arrival time for expiry.
    ///  Unfragmented packets are complete right away unless they are duplicates.
    pub fn insert(&mut self, wrapper: PacketWrapper, now: Instant) -> ReassemblyOutcome {
        let tsn = wrapper.tsn();
        if let Some(received) = &mut self.received {
            if !received.add(tsn) {
                trace!("#{} was received before", tsn);
                return ReassemblyOutcome::Duplicate;
            }
        }

        if !wrapper.fragment().is_fragment() {
            self.expire_old_packets(now);
            return ReassemblyOutcome::Complete(vec![wrapper]);
        }

        let idx = match self.position_for(tsn) {
            Ok(idx) => idx,
            Err(()) => return ReassemblyOutcome::Duplicate,
        };
        self.queued_bytes += wrapper.size();
        self.entries.insert(idx, wrapper);

        let result = match self.complete_chain_around(idx) {
            Some((start, end)) => {
                let chain = self.entries.drain(start..=end).collect::<Vec<_>>();
                self.queued_bytes -= chain.iter().map(|w| w.size()).sum::<usize>();
                trace!("fragment #{} completes a message of {} fragments", tsn, chain.len());
                ReassemblyOutcome::Complete(chain)
            }
            None => ReassemblyOutcome::Pending,
        };

        self.expire_old_packets(now);
        result
    }

    /// the sorted insert position for a TSN, or `Err` if it is present already
    fn position_for(&self, tsn: Tsn) -> Result<usize, ()> {
        for (i, entry) in self.entries.iter().enumerate().rev() {
            match entry.tsn().seq_cmp(tsn) {
                Ordering::Equal => return Err(()),
                Ordering::Less => return Ok(i + 1),
                Ordering::Greater => {}
            }
        }
        Ok(0)
    }

    /// the index range of a complete fragment chain that includes the entry at `idx`
    fn complete_chain_around(&self, idx: usize) -> Option<(usize, usize)> {
        let mut start = idx;
        while self.entries[start].fragment() != FragmentPosition::First {
            if start == 0 {
                return None;
            }
            let prev = &self.entries[start - 1];
            if prev.tsn().next() != self.entries[start].tsn() {
                return None;
            }
            if !matches!(prev.fragment(), FragmentPosition::First | FragmentPosition::Intermediate) {
                return None;
            }
            start -= 1;
        }

        let mut end = idx;
        while self.entries[end].fragment() != FragmentPosition::Last {
            if end + 1 == self.entries.len() {
                return None;
            }
            let next = &self.entries[end + 1];
            if self.entries[end].tsn().next() != next.tsn() || !next.fragment().is_continuation() {
                return None;
            }
            end += 1;
        }

        Some((start, end))
    }

    /// Discards fragments that were waiting for their message's other fragments for longer than
    ///  the expiry timeout. This is a no-op for the reliable variant because the missing
    ///  fragments are retransmitted.
    pub fn expire_old_packets(&mut self, now: Instant) -> usize {
        if self.is_reliable() {
            return 0;
        }

        let expiry = self.fragment_expiry;
        let before = self.entries.len();
        let mut freed_bytes = 0;
        self.entries.retain(|e| {
            let expired = now.saturating_duration_since(e.meta().enqueue_time) > expiry;
            if expired {
                debug!("fragment #{} expired", e.tsn());
                freed_bytes += e.size();
            }
            !expired
        });
        self.queued_bytes -= freed_bytes;
        before - self.entries.len()
    }

    pub fn freeze(&self, freezer: &mut Freezer) {
        freezer.put_bool(self.received.is_some());
        if let Some(received) = &self.received {
            received.freeze(freezer);
        }
        freezer.put_duration(if self.is_reliable() { Duration::ZERO } else { self.fragment_expiry });
        put_marked_list(freezer, self.entries.iter(), |f, e| e.freeze(f));
    }

    pub fn defrost(defroster: &mut Defroster) -> anyhow::Result<UnsequencedPacketQueue> {
        let received = if defroster.get_bool()? {
            Some(ReceivedTsnTracker::defrost(defroster)?)
        }
        else {
            None
        };
        let frozen_expiry = defroster.get_duration()?;
        let entries = get_marked_list(defroster, PacketWrapper::defrost)?;

        let queued_bytes = entries.iter().map(|e| e.size()).sum();
        Ok(UnsequencedPacketQueue {
            fragment_expiry: if received.is_some() { Duration::MAX } else { frozen_expiry },
            received,
            entries: entries.into(),
            queued_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, TrafficClass};
    use bytes::Bytes;
    use rstest::rstest;

    fn tsn(raw: u32) -> Tsn {
        Tsn::from_raw(raw)
    }

    fn fragment(raw_tsn: u32, fragment: FragmentPosition, now: Instant) -> PacketWrapper {
        let mut packet = Packet::new_data(TrafficClass::UnreliableUnsequenced, fragment, 0, Bytes::from(vec![raw_tsn as u8]));
        packet.tsn = tsn(raw_tsn);
        PacketWrapper::new(packet, now, 0)
    }

    fn complete_tsns(outcome: ReassemblyOutcome) -> Option<Vec<u32>> {
        match outcome {
            ReassemblyOutcome::Complete(chain) => Some(chain.iter().map(|w| w.tsn().to_raw()).collect()),
            _ => None,
        }
    }

    fn permutations(items: &[u32]) -> Vec<Vec<u32>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut result = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                result.push(tail);
            }
        }
        result
    }

    #[rstest]
    #[case::single_intermediate(3)]
    #[case::two_intermediates(4)]
    #[case::three_intermediates(5)]
    fn test_reassembly_any_order(#[case] num_fragments: u32) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let chain: Vec<u32> = (10..10 + num_fragments).collect();
            let position = |t: u32| {
                if t == chain[0] { FragmentPosition::First }
                else if t == chain[chain.len() - 1] { FragmentPosition::Last }
                else { FragmentPosition::Intermediate }
            };

            for arrival in permutations(&chain) {
                let now = Instant::now();
                let mut queue = UnsequencedPacketQueue::new_unreliable(Duration::from_secs(3));
                let mut completed = Vec::new();
                for (i, &t) in arrival.iter().enumerate() {
                    if let Some(tsns) = complete_tsns(queue.insert(fragment(t, position(t), now), now)) {
                        completed.push((i, tsns));
                    }
                }
                assert_eq!(completed, vec![(arrival.len() - 1, chain.clone())], "arrival order {:?}", arrival);
                assert_eq!(queue.len(), 0);
                assert_eq!(queue.queued_bytes(), 0);
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_messages_interleaved() {
        let now = Instant::now();
        let mut queue = UnsequencedPacketQueue::new_unreliable(Duration::from_secs(3));
        assert!(matches!(queue.insert(fragment(20, FragmentPosition::First, now), now), ReassemblyOutcome::Pending));
        assert!(matches!(queue.insert(fragment(12, FragmentPosition::Last, now), now), ReassemblyOutcome::Pending));
        assert!(matches!(queue.insert(fragment(21, FragmentPosition::Last, now), now), ReassemblyOutcome::Complete(_)));
        assert!(matches!(queue.insert(fragment(10, FragmentPosition::First, now), now), ReassemblyOutcome::Pending));
        assert_eq!(complete_tsns(queue.insert(fragment(11, FragmentPosition::Intermediate, now), now)), Some(vec![10, 11, 12]));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_prevents_completion() {
        let now = Instant::now();
        let mut queue = UnsequencedPacketQueue::new_unreliable(Duration::from_secs(3));
        queue.insert(fragment(10, FragmentPosition::First, now), now);
        assert!(matches!(queue.insert(fragment(12, FragmentPosition::Last, now), now), ReassemblyOutcome::Pending));
        assert!(matches!(queue.insert(fragment(13, FragmentPosition::Last, now), now), ReassemblyOutcome::Pending));
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphan_last() {
        let now = Instant::now();
        let mut queue = UnsequencedPacketQueue::new_unreliable(Duration::from_secs(3));
        assert!(matches!(queue.insert(fragment(5, FragmentPosition::Last, now), now), ReassemblyOutcome::Pending));
        assert!(matches!(queue.insert(fragment(5, FragmentPosition::Last, now), now), ReassemblyOutcome::Duplicate));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_packet() {
        let now = Instant::now();
        let mut queue = UnsequencedPacketQueue::new_reliable(tsn(1));
        assert_eq!(complete_tsns(queue.insert(fragment(3, FragmentPosition::Whole, now), now)), Some(vec![3]));
        assert!(matches!(queue.insert(fragment(3, FragmentPosition::Whole, now), now), ReassemblyOutcome::Duplicate));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reliable_rejects_delivered_tsns() {
        let now = Instant::now();
        let mut queue = UnsequencedPacketQueue::new_reliable(tsn(1));
        queue.insert(fragment(1, FragmentPosition::First, now), now);
        assert!(matches!(queue.insert(fragment(2, FragmentPosition::Last, now), now), ReassemblyOutcome::Complete(_)));
        assert!(matches!(queue.insert(fragment(1, FragmentPosition::First, now), now), ReassemblyOutcome::Duplicate));

        assert!(queue.mark_received(tsn(5)));
        assert!(matches!(queue.insert(fragment(5, FragmentPosition::Whole, now), now), ReassemblyOutcome::Duplicate));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let start = Instant::now();
        let mut queue = UnsequencedPacketQueue::new_unreliable(Duration::from_millis(3000));
        queue.insert(fragment(10, FragmentPosition::First, start), start);

        tokio::time::advance(Duration::from_millis(2000)).await;
        let later = Instant::now();
        queue.insert(fragment(20, FragmentPosition::First, later), later);
        assert_eq!(queue.len(), 2);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(queue.expire_old_packets(Instant::now()), 1);
        assert_eq!(queue.len(), 1);

        // expiry also runs on insert
        tokio::time::advance(Duration::from_millis(2000)).await;
        let now = Instant::now();
        queue.insert(fragment(30, FragmentPosition::First, now), now);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reliable_never_expires() {
        let start = Instant::now();
        let mut queue = UnsequencedPacketQueue::new_reliable(tsn(1));
        queue.insert(fragment(10, FragmentPosition::First, start), start);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(queue.expire_old_packets(Instant::now()), 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_defrost() {
        let now = Instant::now();
        let mut queue = UnsequencedPacketQueue::new_reliable(tsn(1));
        queue.insert(fragment(3, FragmentPosition::First, now), now);
        queue.insert(fragment(5, FragmentPosition::Last, now), now);

        let mut freezer = Freezer::new(now);
        queue.freeze(&mut freezer);
        let image = freezer.finish();

        let mut defroster = Defroster::new(image, now).unwrap();
        let mut defrosted = UnsequencedPacketQueue::defrost(&mut defroster).unwrap();
        defroster.finish().unwrap();

        assert!(defrosted.is_reliable());
        assert_eq!(defrosted.len(), 2);
        assert_eq!(defrosted.queued_bytes(), queue.queued_bytes());
        assert!(matches!(defrosted.insert(fragment(3, FragmentPosition::First, now), now), ReassemblyOutcome::Duplicate));
        assert_eq!(complete_tsns(defrosted.insert(fragment(4, FragmentPosition::Intermediate, now), now)), Some(vec![3, 4, 5]));
    }
}
