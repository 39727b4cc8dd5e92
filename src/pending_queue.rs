use crate::freeze::{Defroster, Freezer};
use crate::packet::TrafficClass;
use crate::packet_wrapper::PacketWrapper;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Identifies an entry in the pending queue for as long as it is there
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EntryId(u64);

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    Enqueued(EntryId),
    TimedOut,
    Closed,
}

struct PendingEntry {
    id: EntryId,
    wrapper: PacketWrapper,
}

struct PendingPacketQueueInner {
    entries: VecDeque<PendingEntry>,
    queued_bytes: usize,
    next_id: u64,
    closed: bool,
}

impl PendingPacketQueueInner {
    fn remove_at(&mut self, idx: usize) -> Option<PacketWrapper> {
        let entry = self.entries.remove(idx)?;
        self.queued_bytes -= entry.wrapper.size();
        Some(entry.wrapper)
    }
}

/// The send-side queue of packets waiting for their first transmission. It is bounded by a total
///  byte size; inserting blocks while there is no room.
///
/// Entries are ordered for transmission: by descending priority, except that fragments of a
///  message are kept together and in order, and sequenced packets never overtake each other
///  (with cross-sequencing enabled, across all sequenced classes).
pub struct PendingPacketQueue {
    inner: Mutex<PendingPacketQueueInner>,
    /// notified whenever room becomes available or the queue is closed
    changed: Notify,
    max_bytes: usize,
    cross_sequencing: bool,
}

impl PendingPacketQueue {
    pub fn new(max_bytes: usize, cross_sequencing: bool) -> PendingPacketQueue {
        PendingPacketQueue {
            inner: Mutex::new(PendingPacketQueueInner {
                entries: VecDeque::new(),
                queued_bytes: 0,
                next_id: 0,
                closed: false,
            }),
            changed: Notify::new(),
            max_bytes,
            cross_sequencing,
        }
    }

    /// true if `new` should be transmitted after `existing`
    fn lower_or_same_priority(&self, new: &PacketWrapper, existing: &PacketWrapper) -> bool {
        if new.priority() <= existing.priority() {
            return true;
        }
        match (new.packet(), existing.packet()) {
            (Some(new), Some(existing)) => {
                new.class.is_sequenced() && existing.class.is_sequenced()
                    && (self.cross_sequencing || new.class.is_reliable() == existing.class.is_reliable())
            }
            _ => false,
        }
    }

    fn insert_position(&self, entries: &VecDeque<PendingEntry>, wrapper: &PacketWrapper) -> usize {
        if wrapper.fragment().is_continuation() {
            // right after the previous fragment of the same message if that is still queued
            return entries.iter()
                .rposition(|e| e.wrapper.message_tsn() == wrapper.message_tsn())
                .map(|i| i + 1)
                .unwrap_or(0);
        }

        if let Some(i) = entries.iter().rposition(|e| self.lower_or_same_priority(wrapper, &e.wrapper)) {
            return i + 1;
        }

        // highest priority: goes to the head, but must not split the remainder of a fragmented
        //  message whose first fragment was sent already
        match entries.front() {
            Some(head) if head.wrapper.fragment().is_continuation() => {
                let head_message = head.wrapper.message_tsn();
                entries.iter()
                    .position(|e| e.wrapper.message_tsn() != head_message)
                    .unwrap_or(entries.len())
            }
            _ => 0,
        }
    }

    /// Inserts a packet, waiting for room if necessary. `None` as a timeout means waiting without
    ///  a time limit.
    pub async fn insert(&self, wrapper: PacketWrapper, timeout: Option<Duration>) -> EnqueueOutcome {
        let size = wrapper.size();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return EnqueueOutcome::Closed;
                }
                if inner.queued_bytes + size <= self.max_bytes {
                    let id = EntryId(inner.next_id);
                    inner.next_id += 1;
                    let idx = self.insert_position(&inner.entries, &wrapper);
                    trace!("enqueueing packet {} with priority {} at position {} of {}", id, wrapper.priority(), idx, inner.entries.len());
                    inner.queued_bytes += size;
                    inner.entries.insert(idx, PendingEntry { id, wrapper });
                    return EnqueueOutcome::Enqueued(id);
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        debug!("no room in the pending queue for a packet of {} bytes before the timeout", size);
                        return EnqueueOutcome::TimedOut;
                    }
                }
                None => notified.await,
            }
        }
    }

    pub async fn peek(&self) -> Option<PacketWrapper> {
        self.inner.lock().await
            .entries.front()
            .map(|e| e.wrapper.clone())
    }

    pub async fn pop_front(&self) -> Option<PacketWrapper> {
        self.pop_front_if(|_| true).await
    }

    /// Atomically removes the head entry if it satisfies the predicate
    pub async fn pop_front_if(&self, predicate: impl FnOnce(&PacketWrapper) -> bool) -> Option<PacketWrapper> {
        let mut inner = self.inner.lock().await;
        if !predicate(&inner.entries.front()?.wrapper) {
            return None;
        }
        let result = inner.remove_at(0);
        drop(inner);
        self.changed.notify_waiters();
        result
    }

    pub async fn remove(&self, id: EntryId) -> Option<PacketWrapper> {
        let mut inner = self.inner.lock().await;
        let idx = inner.entries.iter().position(|e| e.id == id)?;
        let result = inner.remove_at(idx);
        drop(inner);
        self.changed.notify_waiters();
        result
    }

    /// Removes all queued packets of a flow with the given tag. Returns the number of removed
    ///  packets and the highest priority among them.
    pub async fn cancel(&self, reliable: bool, sequenced: bool, tag: u16) -> (usize, Option<u8>) {
        let class = TrafficClass::for_message(reliable, sequenced);

        let mut inner = self.inner.lock().await;
        let mut num_cancelled = 0;
        let mut highest_priority: Option<u8> = None;
        let mut freed_bytes = 0;
        inner.entries.retain(|e| {
            let matches = e.wrapper.packet()
                .map(|p| p.class == class && p.tag() == tag)
                .unwrap_or(false);
            if matches {
                num_cancelled += 1;
                freed_bytes += e.wrapper.size();
                highest_priority = Some(highest_priority.map_or(e.wrapper.priority(), |p| p.max(e.wrapper.priority())));
            }
            !matches
        });
        inner.queued_bytes -= freed_bytes;
        drop(inner);

        if num_cancelled > 0 {
            debug!("cancelled {} pending {} packets with tag {}", num_cancelled, class, tag);
            self.changed.notify_waiters();
        }
        (num_cancelled, highest_priority)
    }

    /// Wakes all blocked inserts and makes all future inserts fail. Closing is irreversible.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.changed.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// (queued bytes, queued packets)
    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.queued_bytes, inner.entries.len())
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    pub async fn freeze(&self, freezer: &mut Freezer) {
        let inner = self.inner.lock().await;
        freezer.put_len(inner.entries.len());
        for entry in &inner.entries {
            entry.wrapper.freeze(freezer);
        }
    }

    /// Restores the entries in their frozen order. The byte limit is not enforced for restored
    ///  entries.
    pub fn defrost(defroster: &mut Defroster, max_bytes: usize, cross_sequencing: bool) -> anyhow::Result<PendingPacketQueue> {
        let mut inner = PendingPacketQueueInner {
            entries: VecDeque::new(),
            queued_bytes: 0,
            next_id: 0,
            closed: false,
        };
        for _ in 0..defroster.get_len()? {
            let wrapper = PacketWrapper::defrost(defroster)?;
            inner.queued_bytes += wrapper.size();
            let id = EntryId(inner.next_id);
            inner.next_id += 1;
            inner.entries.push_back(PendingEntry { id, wrapper });
        }

        Ok(PendingPacketQueue {
            inner: Mutex::new(inner),
            changed: Notify::new(),
            max_bytes,
            cross_sequencing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FragmentPosition, Packet};
    use crate::tsn::Tsn;
    use bytes::Bytes;
    use rstest::rstest;
    use std::sync::Arc;

    fn wrapper(class: TrafficClass, fragment: FragmentPosition, priority: u8, message_tsn: u32, tag: u16, payload_len: usize) -> PacketWrapper {
        let packet = Packet::new_data(class, fragment, tag, Bytes::from(vec![0u8; payload_len]));
        let mut result = PacketWrapper::new(packet, Instant::now(), priority);
        result.meta_mut().message_tsn = Tsn::from_raw(message_tsn);
        result
    }

    fn whole(class: TrafficClass, priority: u8, tag: u16) -> PacketWrapper {
        wrapper(class, FragmentPosition::Whole, priority, 0, tag, 1)
    }

    async fn order(queue: &PendingPacketQueue) -> Vec<(u8, u16)> {
        queue.inner.lock().await
            .entries.iter()
            .map(|e| (e.wrapper.priority(), e.wrapper.packet().unwrap().tag()))
            .collect()
    }

    #[tokio::test]
    async fn test_priority_order() {
        let queue = PendingPacketQueue::new(100_000, true);
        queue.insert(whole(TrafficClass::UnreliableUnsequenced, 5, 1), None).await;
        queue.insert(whole(TrafficClass::UnreliableUnsequenced, 9, 2), None).await;
        queue.insert(whole(TrafficClass::UnreliableUnsequenced, 5, 3), None).await;
        queue.insert(whole(TrafficClass::UnreliableUnsequenced, 1, 4), None).await;
        queue.insert(whole(TrafficClass::UnreliableUnsequenced, 7, 5), None).await;

        assert_eq!(order(&queue).await, vec![(9, 2), (7, 5), (5, 1), (5, 3), (1, 4)]);
    }

    #[rstest]
    #[case::cross_sequencing_keeps_sequenced_order(true, TrafficClass::UnreliableSequenced, vec![(1, 1), (9, 2)])]
    #[case::same_reliability_keeps_order(false, TrafficClass::ReliableSequenced, vec![(1, 1), (9, 2)])]
    #[case::different_reliability_overtakes(false, TrafficClass::UnreliableSequenced, vec![(9, 2), (1, 1)])]
    #[case::unsequenced_overtakes(true, TrafficClass::ReliableUnsequenced, vec![(9, 2), (1, 1)])]
    fn test_sequenced_packets_do_not_overtake(#[case] cross_sequencing: bool, #[case] second_class: TrafficClass, #[case] expected: Vec<(u8, u16)>) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let queue = PendingPacketQueue::new(100_000, cross_sequencing);
            queue.insert(whole(TrafficClass::ReliableSequenced, 1, 1), None).await;
            queue.insert(whole(second_class, 9, 2), None).await;
            assert_eq!(order(&queue).await, expected);
        });
    }

    #[tokio::test]
    async fn test_fragments_stay_together() {
        let queue = PendingPacketQueue::new(100_000, false);
        queue.insert(wrapper(TrafficClass::UnreliableUnsequenced, FragmentPosition::First, 1, 7, 1, 10), None).await;
        queue.insert(whole(TrafficClass::UnreliableUnsequenced, 1, 2), None).await;
        queue.insert(wrapper(TrafficClass::UnreliableUnsequenced, FragmentPosition::Intermediate, 1, 7, 1, 10), None).await;
        queue.insert(wrapper(TrafficClass::UnreliableUnsequenced, FragmentPosition::Last, 1, 7, 1, 10), None).await;

        assert_eq!(order(&queue).await, vec![(1, 1), (1, 1), (1, 1), (1, 2)]);
    }

    #[tokio::test]
    async fn test_high_priority_does_not_split_message_in_flight() {
        let queue = PendingPacketQueue::new(100_000, false);
        queue.insert(wrapper(TrafficClass::UnreliableUnsequenced, FragmentPosition::First, 1, 7, 1, 10), None).await;
        queue.insert(wrapper(TrafficClass::UnreliableUnsequenced, FragmentPosition::Intermediate, 1, 7, 1, 10), None).await;
        queue.insert(wrapper(TrafficClass::UnreliableUnsequenced, FragmentPosition::Last, 1, 7, 1, 10), None).await;

        // the first fragment is transmitted
        assert_eq!(queue.pop_front().await.unwrap().fragment(), FragmentPosition::First);

        queue.insert(whole(TrafficClass::UnreliableUnsequenced, 200, 9), None).await;
        assert_eq!(order(&queue).await, vec![(1, 1), (1, 1), (200, 9)]);
    }

    #[tokio::test]
    async fn test_continuation_without_predecessor_goes_to_head() {
        let queue = PendingPacketQueue::new(100_000, false);
        queue.insert(whole(TrafficClass::UnreliableUnsequenced, 5, 1), None).await;
        queue.insert(wrapper(TrafficClass::UnreliableUnsequenced, FragmentPosition::Last, 1, 3, 2, 10), None).await;
        assert_eq!(order(&queue).await, vec![(1, 2), (5, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_control_scenario() {
        let packet_overhead = whole(TrafficClass::UnreliableUnsequenced, 0, 0).size() - 1;
        let queue = PendingPacketQueue::new(1000, false);

        let big = wrapper(TrafficClass::UnreliableUnsequenced, FragmentPosition::Whole, 0, 0, 0, 1000 - packet_overhead);
        assert_eq!(big.size(), 1000);
        let big_id = match queue.insert(big, Some(Duration::from_millis(50))).await {
            EnqueueOutcome::Enqueued(id) => id,
            other => panic!("unexpected outcome {:?}", other),
        };

        let start = Instant::now();
        let outcome = queue.insert(whole(TrafficClass::UnreliableUnsequenced, 0, 0), Some(Duration::from_millis(50))).await;
        assert_eq!(outcome, EnqueueOutcome::TimedOut);
        assert_eq!(Instant::now() - start, Duration::from_millis(50));
        assert_eq!(queue.counts().await, (1000, 1));

        assert!(queue.remove(big_id).await.is_some());
        let start = Instant::now();
        let outcome = queue.insert(whole(TrafficClass::UnreliableUnsequenced, 0, 0), Some(Duration::from_millis(50))).await;
        assert!(matches!(outcome, EnqueueOutcome::Enqueued(_)));
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_insert_wakes_on_room() {
        let queue = Arc::new(PendingPacketQueue::new(200, false));
        let first = wrapper(TrafficClass::UnreliableUnsequenced, FragmentPosition::Whole, 0, 0, 0, 150);
        queue.insert(first, None).await;

        let queue2 = queue.clone();
        let handle = tokio::spawn(async move {
            queue2.insert(wrapper(TrafficClass::UnreliableUnsequenced, FragmentPosition::Whole, 0, 0, 0, 150), None).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        queue.pop_front().await.unwrap();
        assert!(matches!(handle.await.unwrap(), EnqueueOutcome::Enqueued(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_blocked_insert() {
        let queue = Arc::new(PendingPacketQueue::new(200, false));
        queue.insert(wrapper(TrafficClass::UnreliableUnsequenced, FragmentPosition::Whole, 0, 0, 0, 150), None).await;

        let queue2 = queue.clone();
        let handle = tokio::spawn(async move {
            queue2.insert(wrapper(TrafficClass::UnreliableUnsequenced, FragmentPosition::Whole, 0, 0, 0, 150), None).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.close().await;
        queue.close().await;
        assert_eq!(handle.await.unwrap(), EnqueueOutcome::Closed);
        assert_eq!(queue.insert(whole(TrafficClass::UnreliableUnsequenced, 0, 0), None).await, EnqueueOutcome::Closed);
    }

    #[tokio::test]
    async fn test_cancel() {
        let queue = PendingPacketQueue::new(100_000, false);
        queue.insert(whole(TrafficClass::ReliableUnsequenced, 3, 1), None).await;
        queue.insert(whole(TrafficClass::ReliableUnsequenced, 8, 1), None).await;
        queue.insert(whole(TrafficClass::ReliableUnsequenced, 9, 2), None).await;
        queue.insert(whole(TrafficClass::UnreliableUnsequenced, 9, 1), None).await;
        queue.insert(whole(TrafficClass::ReliableUnsequenced, 1, 1), None).await;
        let (bytes_before, _) = queue.counts().await;

        assert_eq!(queue.cancel(true, false, 1).await, (3, Some(8)));
        assert_eq!(order(&queue).await, vec![(9, 2), (9, 1)]);
        assert_eq!(queue.counts().await, (bytes_before - 3 * whole(TrafficClass::ReliableUnsequenced, 0, 1).size(), 2));

        assert_eq!(queue.cancel(true, false, 1).await, (0, None));
    }

    #[tokio::test]
    async fn test_cancel_leaves_control_packets() {
        let queue = PendingPacketQueue::new(100_000, true);
        let control = PacketWrapper::new(Packet::new_control(vec![]), Instant::now(), 0);
        queue.insert(control, None).await;
        assert_eq!(queue.cancel(true, true, 0).await, (0, None));
        assert_eq!(queue.counts().await.1, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_front_if() {
        let queue = PendingPacketQueue::new(100_000, false);
        queue.insert(whole(TrafficClass::UnreliableUnsequenced, 0, 4), None).await;
        assert!(queue.pop_front_if(|_| false).await.is_none());
        assert_eq!(queue.peek().await.unwrap().packet().unwrap().tag(), 4);
        assert!(queue.pop_front_if(|w| w.packet().unwrap().tag() == 4).await.is_some());
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_defrost() {
        let queue = PendingPacketQueue::new(100_000, false);
        queue.insert(whole(TrafficClass::ReliableUnsequenced, 3, 1), None).await;
        queue.insert(whole(TrafficClass::ReliableSequenced, 8, 2), None).await;

        let mut freezer = Freezer::new(Instant::now());
        queue.freeze(&mut freezer).await;
        let image = freezer.finish();

        let mut defroster = Defroster::new(image, Instant::now()).unwrap();
        let defrosted = PendingPacketQueue::defrost(&mut defroster, 100_000, false).unwrap();
        defroster.finish().unwrap();

        assert_eq!(order(&defrosted).await, order(&queue).await);
        assert_eq!(defrosted.counts().await, queue.counts().await);
    }
}
