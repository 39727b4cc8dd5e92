use crate::chunk::Chunk;
use crate::config::MocketConfig;
use crate::freeze::{get_marked_list, put_marked_list, Defroster, Freezer};
use crate::packet::{FragmentPosition, Packet, TrafficClass};
use crate::packet_wrapper::{PacketWrapper, WrapperMeta};
use crate::received_data_queue::{ReassembledMessage, ReceivedMessageQueue, Waited};
use crate::safe_converter::PrecheckedCast;
use crate::sequenced_queue::{InsertOutcome, SequencedPacketQueue};
use crate::state::StateMachine;
use crate::stats::MocketStats;
use crate::tsn::Tsn;
use crate::unsequenced_queue::{ReassemblyOutcome, UnsequencedPacketQueue};
use anyhow::Context;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// The result of a `receive` call
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// number of bytes copied into the caller's buffer(s), or the size of the next message
    Message(usize),
    Timeout,
    /// no message is available, and none will arrive
    Closed,
}

impl ReceiveOutcome {
    /// the classic socket-style return code: the byte count, 0 for a timeout and -1 for a
    ///  closed connection
    pub fn as_return_code(&self) -> i64 {
        match self {
            ReceiveOutcome::Message(n) => *n as i64,
            ReceiveOutcome::Timeout => 0,
            ReceiveOutcome::Closed => -1,
        }
    }
}

impl From<Waited<usize>> for ReceiveOutcome {
    fn from(value: Waited<usize>) -> Self {
        match value {
            Waited::Ready(n) => ReceiveOutcome::Message(n),
            Waited::Timeout => ReceiveOutcome::Timeout,
            Waited::Closed => ReceiveOutcome::Closed,
        }
    }
}

/// An upper bound for the factor applied to the unreliable sequenced delivery timeout
const MAX_SKIP_FACTOR: u32 = 5;

struct SequencedFlow {
    class: TrafficClass,
    queue: Mutex<SequencedPacketQueue>,
    /// fragments of the message that is currently being reassembled
    chain: Mutex<Vec<PacketWrapper>>,
}

impl SequencedFlow {
    fn new(class: TrafficClass, queue: SequencedPacketQueue, chain: Vec<PacketWrapper>) -> SequencedFlow {
        SequencedFlow {
            class,
            queue: Mutex::new(queue),
            chain: Mutex::new(chain),
        }
    }

    async fn floor(&self) -> Tsn {
        self.queue.lock().await.floor()
    }
}

/// The receive side's delivery stage. Received packets are handed over by the admission loop:
///  packets of sequenced classes are queued per class and delivered by `run` in TSN order,
///  while unsequenced packets are reassembled and delivered immediately.
///
/// Completed messages go to a queue from which the application picks them up with `receive`.
pub struct PacketProcessor {
    config: Arc<MocketConfig>,
    control: SequencedFlow,
    reliable_sequenced: SequencedFlow,
    unreliable_sequenced: SequencedFlow,
    reliable_unsequenced: Mutex<UnsequencedPacketQueue>,
    unreliable_unsequenced: Mutex<UnsequencedPacketQueue>,
    received_messages: ReceivedMessageQueue,
    /// the number of bytes held in the sequenced queues
    queued_data_size: AtomicU32,
    packets_available: Notify,
    state: Arc<StateMachine>,
    stats: Arc<MocketStats>,
}

impl PacketProcessor {
    pub fn new(config: Arc<MocketConfig>, state: Arc<StateMachine>, stats: Arc<MocketStats>) -> PacketProcessor {
        let remote = config.remote_initial_tsns;
        PacketProcessor {
            control: SequencedFlow::new(TrafficClass::Control, SequencedPacketQueue::new(remote.control), Vec::new()),
            reliable_sequenced: SequencedFlow::new(TrafficClass::ReliableSequenced, SequencedPacketQueue::new(remote.reliable_sequenced), Vec::new()),
            unreliable_sequenced: SequencedFlow::new(TrafficClass::UnreliableSequenced, SequencedPacketQueue::new(remote.unreliable_sequenced), Vec::new()),
            reliable_unsequenced: Mutex::new(UnsequencedPacketQueue::new_reliable(remote.reliable_unsequenced)),
            unreliable_unsequenced: Mutex::new(UnsequencedPacketQueue::new_unreliable(config.unreliable_unsequenced_fragment_expiry)),
            received_messages: ReceivedMessageQueue::default(),
            queued_data_size: AtomicU32::new(0),
            packets_available: Notify::new(),
            config,
            state,
            stats,
        }
    }

    fn sequenced_flow(&self, class: TrafficClass) -> Option<&SequencedFlow> {
        match class {
            TrafficClass::Control => Some(&self.control),
            TrafficClass::ReliableSequenced => Some(&self.reliable_sequenced),
            TrafficClass::UnreliableSequenced => Some(&self.unreliable_sequenced),
            _ => None,
        }
    }

    fn sequenced_flows(&self) -> [&SequencedFlow; 3] {
        [&self.control, &self.reliable_sequenced, &self.unreliable_sequenced]
    }

    /// The TSNs the three sequenced flows expect to deliver next. Each floor is read under its
    ///  own queue's lock. Floors only move forward, so a value that is outdated by the time it
    ///  is used can only delay delivery, never deliver out of order.
    async fn next_tsns(&self) -> (Tsn, Tsn, Tsn) {
        (self.control.floor().await, self.reliable_sequenced.floor().await, self.unreliable_sequenced.floor().await)
    }

    /// Hands over a received packet of a sequenced class
    pub async fn admit_sequenced(&self, packet: Packet, now: Instant) -> InsertOutcome {
        let flow = match self.sequenced_flow(packet.class) {
            Some(flow) => flow,
            None => {
                warn!("{} packet #{} passed to the sequenced delivery path - this is a bug", packet.class, packet.tsn);
                return InsertOutcome::Stale;
            }
        };

        if flow.class == TrafficClass::UnreliableSequenced && !self.config.buffer_unreliable_sequenced_packets {
            return self.process_unbuffered(packet, now).await;
        }

        let size = packet.size();
        let tsn = packet.tsn;
        let outcome = flow.queue.lock().await
            .insert(PacketWrapper::new(packet, now, 0));
        match outcome {
            InsertOutcome::Inserted => {
                trace!("queued {} #{} for delivery", flow.class, tsn);
                self.queued_data_size.fetch_add(size.prechecked_cast(), Ordering::AcqRel);
                self.packets_available.notify_one();
            }
            InsertOutcome::Stale | InsertOutcome::Duplicate => {
                debug!("{} #{} was received before: {:?}", flow.class, tsn, outcome);
            }
        }
        outcome
    }

    /// Hands over a received packet of an unsequenced class. Returns `false` for duplicates.
    pub async fn admit_unsequenced(&self, packet: Packet, now: Instant) -> bool {
        let queue = match packet.class {
            TrafficClass::ReliableUnsequenced => &self.reliable_unsequenced,
            TrafficClass::UnreliableUnsequenced => &self.unreliable_unsequenced,
            other => {
                warn!("{} packet #{} passed to the unsequenced delivery path - this is a bug", other, packet.tsn);
                return false;
            }
        };

        let outcome = queue.lock().await
            .insert(PacketWrapper::new(packet, now, 0), now);
        match outcome {
            ReassemblyOutcome::Duplicate => false,
            ReassemblyOutcome::Pending => true,
            ReassemblyOutcome::Complete(packets) => {
                self.deliver(&packets).await;
                true
            }
        }
    }

    /// Registers a TSN that the peer cancelled, so delivery of a sequenced class can move past
    ///  it. Returns `true` if a tombstone was queued.
    pub async fn insert_tombstone(&self, class: TrafficClass, tsn: Tsn, now: Instant) -> bool {
        let flow = match self.sequenced_flow(class) {
            Some(flow) => flow,
            None => return false,
        };

        let mut queue = flow.queue.lock().await;
        if class == TrafficClass::UnreliableSequenced && !self.config.buffer_unreliable_sequenced_packets {
            // nothing is queued, so only a cancelled packet at the floor matters
            if queue.floor() == tsn {
                queue.advance_floor(tsn.next());
            }
            return false;
        }

        if !queue.can_insert(tsn) {
            return false;
        }
        let inserted = queue.insert(PacketWrapper::tombstone(tsn, now)) == InsertOutcome::Inserted;
        drop(queue);

        if inserted {
            trace!("queued tombstone for {} #{}", class, tsn);
            self.packets_available.notify_one();
        }
        inserted
    }

    /// Records a reliable unsequenced TSN as received without a packet because the peer
    ///  cancelled it
    pub async fn mark_reliable_unsequenced_received(&self, tsn: Tsn) -> bool {
        self.reliable_unsequenced.lock().await.mark_received(tsn)
    }

    /// The number of received bytes that the application did not consume yet, for the receive
    ///  window
    pub async fn used_receive_buffer(&self) -> usize {
        self.queued_data_size.load(Ordering::Acquire) as usize + self.received_messages.cumulative_size().await
    }

    fn release_queued_data(&self, size: usize) {
        let size: u32 = size.prechecked_cast();
        let _ = self.queued_data_size.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(size)));
    }

    /// The delivery loop. It runs until the connection is terminated or suspended, and closes
    ///  the received message queue when it exits.
    pub async fn run(&self) {
        info!("starting packet processor loop");
        let mut state = self.state.subscribe();

        loop {
            if state.borrow_and_update().stops_loops() {
                break;
            }

            let mut progressed = self.deliver_next(&self.control).await;
            progressed |= self.deliver_next(&self.reliable_sequenced).await;
            progressed |= self.deliver_next(&self.unreliable_sequenced).await;
            if progressed {
                continue;
            }

            let now = Instant::now();
            self.unreliable_unsequenced.lock().await.expire_old_packets(now);

            let mut wake_up = now + self.config.unreliable_sequenced_delivery_timeout;
            if let Some(skip_at) = self.unreliable_sequenced_skip_time().await {
                wake_up = wake_up.min(skip_at);
            }

            select! {
                _ = self.packets_available.notified() => {}
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(wake_up) => {}
            }
        }

        info!("packet processor loop terminated");
        self.received_messages.close().await;
    }

    fn skip_time(&self, floor: Tsn, head: &PacketWrapper) -> Instant {
        let factor = floor.distance_to(head.tsn()).saturating_add(1).min(MAX_SKIP_FACTOR);
        head.meta().enqueue_time + self.config.unreliable_sequenced_delivery_timeout * factor
    }

    /// the time at which the unreliable sequenced flow gives up on packets missing before its head
    async fn unreliable_sequenced_skip_time(&self) -> Option<Instant> {
        let queue = self.unreliable_sequenced.queue.lock().await;
        let head = queue.peek()?;
        if head.tsn() == queue.floor() {
            return None;
        }
        Some(self.skip_time(queue.floor(), head))
    }

    /// Attempts to deliver the next packet of a sequenced flow. Returns `true` if the flow made
    ///  progress.
    async fn deliver_next(&self, flow: &SequencedFlow) -> bool {
        let (next_control, next_reliable_sequenced, next_unreliable_sequenced) = self.next_tsns().await;
        let now = Instant::now();

        let mut queue = flow.queue.lock().await;
        let floor = queue.floor();
        let (head_tsn, prerequisites, skip_time) = match queue.peek() {
            Some(head) => (head.tsn(), head.packet().and_then(|p| p.prerequisites), self.skip_time(floor, head)),
            None => return false,
        };

        if head_tsn != floor {
            if flow.class == TrafficClass::UnreliableSequenced && skip_time <= now {
                debug!("giving up on {} #{} to #{}", flow.class, floor, head_tsn.prev());
                queue.advance_floor(head_tsn);
                drop(queue);
                self.discard_chain(flow).await;
                return true;
            }
            return false;
        }

        if let Some(prerequisites) = prerequisites {
            if !prerequisites.are_satisfied(flow.class, next_control, next_reliable_sequenced, next_unreliable_sequenced) {
                trace!("{} #{} is waiting for its delivery prerequisites {:?}", flow.class, head_tsn, prerequisites);
                return false;
            }
        }

        let wrapper = match queue.remove(floor) {
            Some(wrapper) => wrapper,
            None => return false,
        };
        queue.advance_floor(floor.next());
        drop(queue);
        self.release_queued_data(wrapper.size());

        match wrapper {
            PacketWrapper::Cancelled(tsn, _) => {
                debug!("moving past cancelled {} #{}", flow.class, tsn);
                self.discard_chain(flow).await;
            }
            PacketWrapper::Payload(packet, meta) => {
                self.process_delivered(flow, packet, meta).await;
            }
        }
        true
    }

    /// Unbuffered unreliable sequenced packets are processed on arrival. Packets that arrive
    ///  late are dropped, and delivery jumps ahead over missing packets.
    async fn process_unbuffered(&self, packet: Packet, now: Instant) -> InsertOutcome {
        let (next_control, next_reliable_sequenced, _) = self.next_tsns().await;
        let flow = &self.unreliable_sequenced;

        let mut queue = flow.queue.lock().await;
        let floor = queue.floor();
        if packet.tsn.is_before(floor) {
            trace!("{} #{} arrived after #{} - dropping", flow.class, packet.tsn, floor.prev());
            return InsertOutcome::Stale;
        }
        queue.advance_floor(packet.tsn.next());
        drop(queue);

        if packet.tsn != floor {
            debug!("jumping ahead from {} #{} to #{}", flow.class, floor, packet.tsn);
            self.discard_chain(flow).await;
        }

        if let Some(prerequisites) = packet.prerequisites {
            if !prerequisites.are_satisfied(flow.class, next_control, next_reliable_sequenced, packet.tsn) {
                debug!("{} #{} arrived before its delivery prerequisites {:?} - dropping", flow.class, packet.tsn, prerequisites);
                self.discard_chain(flow).await;
                self.stats.discarded_reassembly_skipped(1);
                return InsertOutcome::Inserted;
            }
        }

        self.process_delivered(flow, packet, WrapperMeta::new(now, 0)).await;
        InsertOutcome::Inserted
    }

    async fn process_delivered(&self, flow: &SequencedFlow, packet: Packet, meta: WrapperMeta) {
        for chunk in &packet.chunks {
            if let Chunk::StateChange { chunk_type, .. } = chunk {
                debug!("{:?} delivered in {} #{}", chunk_type, flow.class, packet.tsn);
                self.state.process_chunk(*chunk_type);
            }
        }
        if !packet.has_data() {
            return;
        }

        let wrapper = PacketWrapper::Payload(packet, meta);
        let mut chain = flow.chain.lock().await;
        match wrapper.fragment() {
            FragmentPosition::Whole => {
                self.discard_fragments(&mut chain, flow.class);
                drop(chain);
                self.deliver(&[wrapper]).await;
            }
            FragmentPosition::First => {
                self.discard_fragments(&mut chain, flow.class);
                chain.push(wrapper);
            }
            FragmentPosition::Intermediate | FragmentPosition::Last if chain.is_empty() => {
                debug!("orphan {} fragment #{} - discarding", flow.class, wrapper.tsn());
                self.stats.discarded_reassembly_skipped(1);
            }
            FragmentPosition::Intermediate => {
                chain.push(wrapper);
            }
            FragmentPosition::Last => {
                chain.push(wrapper);
                let message = std::mem::take(&mut *chain);
                drop(chain);
                self.deliver(&message).await;
            }
        }
    }

    async fn discard_chain(&self, flow: &SequencedFlow) {
        let mut chain = flow.chain.lock().await;
        self.discard_fragments(&mut chain, flow.class);
    }

    fn discard_fragments(&self, chain: &mut Vec<PacketWrapper>, class: TrafficClass) {
        if chain.is_empty() {
            return;
        }
        debug!("discarding {} incomplete {} fragments starting at #{}", chain.len(), class, chain[0].tsn());
        self.stats.discarded_reassembly_skipped(chain.len());
        chain.clear();
    }

    async fn deliver(&self, packets: &[PacketWrapper]) {
        match ReassembledMessage::from_packets(packets) {
            Ok(message) => {
                trace!("delivering {} message with tag {} and {} bytes", message.class, message.tag, message.size());
                self.stats.message_received(message.class, message.tag).await;
                self.received_messages.insert(message).await;
            }
            Err(e) => {
                warn!("failed to build a received message - dropping: {}", e);
            }
        }
    }

    fn effective_timeout(&self, timeout: Duration) -> Option<Duration> {
        if timeout.is_zero() {
            self.config.default_receive_timeout
        }
        else {
            Some(timeout)
        }
    }

    /// Waits for the next message and copies it into `buf`, truncating it if it does not fit.
    ///  A zero timeout means the configured default receive timeout.
    pub async fn receive(&self, buf: &mut [u8], timeout: Duration) -> ReceiveOutcome {
        match self.received_messages.extract(self.effective_timeout(timeout)).await {
            Waited::Ready(message) => ReceiveOutcome::Message(message.copy_to(buf)),
            Waited::Timeout => ReceiveOutcome::Timeout,
            Waited::Closed => ReceiveOutcome::Closed,
        }
    }

    /// Like `receive`, but scatters the message across several buffers
    pub async fn sreceive(&self, bufs: &mut [&mut [u8]], timeout: Duration) -> ReceiveOutcome {
        match self.received_messages.extract(self.effective_timeout(timeout)).await {
            Waited::Ready(message) => ReceiveOutcome::Message(message.scatter_to(bufs)),
            Waited::Timeout => ReceiveOutcome::Timeout,
            Waited::Closed => ReceiveOutcome::Closed,
        }
    }

    pub async fn next_message_size(&self, timeout: Duration) -> ReceiveOutcome {
        self.received_messages.next_message_size(self.effective_timeout(timeout)).await.into()
    }

    pub async fn cumulative_size_of_available_messages(&self) -> usize {
        self.received_messages.cumulative_size().await
    }

    pub async fn freeze(&self, freezer: &mut Freezer) {
        for flow in self.sequenced_flows() {
            flow.queue.lock().await.freeze(freezer);
        }
        self.reliable_unsequenced.lock().await.freeze(freezer);
        self.unreliable_unsequenced.lock().await.freeze(freezer);
        self.received_messages.freeze(freezer).await;
        for flow in self.sequenced_flows() {
            let chain = flow.chain.lock().await;
            put_marked_list(freezer, chain.iter(), |f, w| w.freeze(f));
        }
    }

    pub fn defrost(defroster: &mut Defroster, config: Arc<MocketConfig>, state: Arc<StateMachine>, stats: Arc<MocketStats>) -> anyhow::Result<PacketProcessor> {
        let control = SequencedPacketQueue::defrost(defroster).context("control queue")?;
        let reliable_sequenced = SequencedPacketQueue::defrost(defroster).context("reliable sequenced queue")?;
        let unreliable_sequenced = SequencedPacketQueue::defrost(defroster).context("unreliable sequenced queue")?;
        let reliable_unsequenced = UnsequencedPacketQueue::defrost(defroster).context("reliable unsequenced queue")?;
        let unreliable_unsequenced = UnsequencedPacketQueue::defrost(defroster).context("unreliable unsequenced queue")?;
        let received_messages = ReceivedMessageQueue::defrost(defroster).context("received messages")?;
        let control_chain = get_marked_list(defroster, PacketWrapper::defrost).context("control fragments")?;
        let reliable_sequenced_chain = get_marked_list(defroster, PacketWrapper::defrost).context("reliable sequenced fragments")?;
        let unreliable_sequenced_chain = get_marked_list(defroster, PacketWrapper::defrost).context("unreliable sequenced fragments")?;

        let queued_data_size = control.queued_bytes() + reliable_sequenced.queued_bytes() + unreliable_sequenced.queued_bytes();

        Ok(PacketProcessor {
            control: SequencedFlow::new(TrafficClass::Control, control, control_chain),
            reliable_sequenced: SequencedFlow::new(TrafficClass::ReliableSequenced, reliable_sequenced, reliable_sequenced_chain),
            unreliable_sequenced: SequencedFlow::new(TrafficClass::UnreliableSequenced, unreliable_sequenced, unreliable_sequenced_chain),
            reliable_unsequenced: Mutex::new(reliable_unsequenced),
            unreliable_unsequenced: Mutex::new(unreliable_unsequenced),
            received_messages,
            queued_data_size: AtomicU32::new(queued_data_size.prechecked_cast()),
            packets_available: Notify::new(),
            config,
            state,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkType;
    use crate::packet::DeliveryPrerequisites;
    use crate::state::ConnectionState;
    use bytes::Bytes;
    use rstest::rstest;

    fn tsn(raw: u32) -> Tsn {
        Tsn::from_raw(raw)
    }

    fn packet(class: TrafficClass, raw_tsn: u32, fragment: FragmentPosition, data: &'static [u8]) -> Packet {
        let mut result = Packet::new_data(class, fragment, 0, Bytes::from_static(data));
        result.tsn = tsn(raw_tsn);
        result
    }

    fn whole(class: TrafficClass, raw_tsn: u32, data: &'static [u8]) -> Packet {
        packet(class, raw_tsn, FragmentPosition::Whole, data)
    }

    struct Fixture {
        processor: Arc<PacketProcessor>,
        state: Arc<StateMachine>,
        stats: Arc<MocketStats>,
    }

    fn fixture(config: MocketConfig) -> Fixture {
        let (state, _replies) = StateMachine::new(ConnectionState::Established);
        let state = Arc::new(state);
        let stats = Arc::new(MocketStats::default());
        let processor = Arc::new(PacketProcessor::new(Arc::new(config), state.clone(), stats.clone()));
        Fixture { processor, state, stats }
    }

    fn spawn_loop(processor: &Arc<PacketProcessor>) -> tokio::task::JoinHandle<()> {
        let processor = processor.clone();
        tokio::spawn(async move { processor.run().await })
    }

    async fn receive_string(processor: &PacketProcessor, timeout: Duration) -> Option<String> {
        let mut buf = [0u8; 100];
        match processor.receive(&mut buf, timeout).await {
            ReceiveOutcome::Message(n) => Some(String::from_utf8_lossy(&buf[..n]).to_string()),
            _ => None,
        }
    }

    async fn drain_sequenced(processor: &PacketProcessor) {
        while processor.deliver_next(&processor.control).await
            | processor.deliver_next(&processor.reliable_sequenced).await
            | processor.deliver_next(&processor.unreliable_sequenced).await
        {}
    }

    #[rstest]
    #[case::message(ReceiveOutcome::Message(17), 17)]
    #[case::timeout(ReceiveOutcome::Timeout, 0)]
    #[case::closed(ReceiveOutcome::Closed, -1)]
    fn test_return_code(#[case] outcome: ReceiveOutcome, #[case] expected: i64) {
        assert_eq!(outcome.as_return_code(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequenced_delivery_in_order() {
        let f = fixture(MocketConfig::default());
        let now = Instant::now();
        for t in [2, 3, 1] {
            let data: &'static [u8] = match t { 1 => b"one", 2 => b"two", _ => b"three" };
            assert_eq!(f.processor.admit_sequenced(whole(TrafficClass::ReliableSequenced, t, data), now).await, InsertOutcome::Inserted);
        }
        assert_eq!(f.processor.admit_sequenced(whole(TrafficClass::ReliableSequenced, 2, b"two"), now).await, InsertOutcome::Duplicate);
        assert!(f.processor.used_receive_buffer().await > 0);

        drain_sequenced(&f.processor).await;
        for expected in ["one", "two", "three"] {
            assert_eq!(receive_string(&f.processor, Duration::from_millis(1)).await.as_deref(), Some(expected));
        }
        assert_eq!(f.processor.used_receive_buffer().await, 0);
        assert_eq!(f.processor.admit_sequenced(whole(TrafficClass::ReliableSequenced, 1, b"one"), now).await, InsertOutcome::Stale);
        assert_eq!(f.stats.snapshot().await.messages.received_reliable_sequenced, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequenced_fragments() {
        let f = fixture(MocketConfig::default());
        let now = Instant::now();
        let class = TrafficClass::ReliableSequenced;
        let packets = [
            packet(class, 1, FragmentPosition::Intermediate, b"orphan"),
            packet(class, 2, FragmentPosition::First, b"ab"),
            packet(class, 3, FragmentPosition::Intermediate, b"cd"),
            packet(class, 4, FragmentPosition::Last, b"ef"),
            packet(class, 5, FragmentPosition::First, b"lost"),
            whole(class, 6, b"whole"),
        ];
        for p in packets {
            f.processor.admit_sequenced(p, now).await;
        }
        drain_sequenced(&f.processor).await;

        assert_eq!(receive_string(&f.processor, Duration::from_millis(1)).await.as_deref(), Some("abcdef"));
        assert_eq!(receive_string(&f.processor, Duration::from_millis(1)).await.as_deref(), Some("whole"));
        assert_eq!(receive_string(&f.processor, Duration::from_millis(1)).await, None);
        assert_eq!(f.stats.snapshot().await.discarded_reassembly_skipped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prerequisites() {
        let f = fixture(MocketConfig::default());
        let now = Instant::now();

        let mut reliable = whole(TrafficClass::ReliableSequenced, 1, b"after control");
        reliable.prerequisites = Some(DeliveryPrerequisites { control: tsn(2), reliable_sequenced: tsn(0), unreliable_sequenced: tsn(1) });
        f.processor.admit_sequenced(reliable, now).await;
        drain_sequenced(&f.processor).await;
        assert_eq!(receive_string(&f.processor, Duration::from_millis(1)).await, None);

        let mut control = Packet::new_control(vec![Chunk::state_change(ChunkType::CookieAck)]);
        control.tsn = tsn(1);
        f.processor.admit_sequenced(control, now).await;
        drain_sequenced(&f.processor).await;
        assert_eq!(receive_string(&f.processor, Duration::from_millis(1)).await.as_deref(), Some("after control"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tombstone() {
        let f = fixture(MocketConfig::default());
        let now = Instant::now();
        f.processor.admit_sequenced(packet(TrafficClass::ReliableSequenced, 1, FragmentPosition::First, b"x"), now).await;
        f.processor.admit_sequenced(whole(TrafficClass::ReliableSequenced, 3, b"after"), now).await;
        assert!(f.processor.insert_tombstone(TrafficClass::ReliableSequenced, tsn(2), now).await);
        assert!(!f.processor.insert_tombstone(TrafficClass::ReliableSequenced, tsn(2), now).await);
        assert!(!f.processor.insert_tombstone(TrafficClass::ReliableSequenced, tsn(3), now).await);

        drain_sequenced(&f.processor).await;
        assert_eq!(receive_string(&f.processor, Duration::from_millis(1)).await.as_deref(), Some("after"));
        assert_eq!(f.stats.snapshot().await.discarded_reassembly_skipped, 1);
        assert!(!f.processor.insert_tombstone(TrafficClass::ReliableSequenced, tsn(2), now).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreliable_sequenced_skip() {
        let f = fixture(MocketConfig {
            unreliable_sequenced_delivery_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let handle = spawn_loop(&f.processor);
        let start = Instant::now();

        // #1 and #2 are missing, so delivery waits for three times the timeout
        f.processor.admit_sequenced(whole(TrafficClass::UnreliableSequenced, 3, b"late"), start).await;
        assert_eq!(receive_string(&f.processor, Duration::from_millis(250)).await, None);
        assert_eq!(receive_string(&f.processor, Duration::from_millis(100)).await.as_deref(), Some("late"));
        assert!(Instant::now() - start >= Duration::from_millis(300));

        f.state.suspend();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreliable_sequenced_skip_discards_continuations() {
        let f = fixture(MocketConfig {
            unreliable_sequenced_delivery_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let handle = spawn_loop(&f.processor);
        let start = Instant::now();
        let class = TrafficClass::UnreliableSequenced;

        f.processor.admit_sequenced(packet(class, 1, FragmentPosition::First, b"a"), start).await;
        f.processor.admit_sequenced(packet(class, 3, FragmentPosition::Last, b"c"), start).await;
        f.processor.admit_sequenced(whole(class, 4, b"next"), start).await;

        assert_eq!(receive_string(&f.processor, Duration::from_secs(1)).await.as_deref(), Some("next"));
        assert_eq!(f.stats.snapshot().await.discarded_reassembly_skipped, 2);

        f.state.suspend();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbuffered_unreliable_sequenced() {
        let f = fixture(MocketConfig {
            buffer_unreliable_sequenced_packets: false,
            ..Default::default()
        });
        let now = Instant::now();
        let class = TrafficClass::UnreliableSequenced;

        assert_eq!(f.processor.admit_sequenced(whole(class, 3, b"three"), now).await, InsertOutcome::Inserted);
        assert_eq!(f.processor.admit_sequenced(whole(class, 2, b"two"), now).await, InsertOutcome::Stale);
        assert_eq!(f.processor.admit_sequenced(packet(class, 4, FragmentPosition::First, b"a"), now).await, InsertOutcome::Inserted);
        assert_eq!(f.processor.admit_sequenced(packet(class, 6, FragmentPosition::Last, b"c"), now).await, InsertOutcome::Inserted);

        let mut blocked = whole(class, 7, b"blocked");
        blocked.prerequisites = Some(DeliveryPrerequisites { control: tsn(5), ..Default::default() });
        f.processor.admit_sequenced(blocked, now).await;
        f.processor.admit_sequenced(whole(class, 8, b"eight"), now).await;

        assert_eq!(receive_string(&f.processor, Duration::from_millis(1)).await.as_deref(), Some("three"));
        assert_eq!(receive_string(&f.processor, Duration::from_millis(1)).await.as_deref(), Some("eight"));
        assert_eq!(receive_string(&f.processor, Duration::from_millis(1)).await, None);
        assert_eq!(f.processor.unreliable_sequenced.floor().await, tsn(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsequenced() {
        let f = fixture(MocketConfig::default());
        let now = Instant::now();

        assert!(f.processor.admit_unsequenced(packet(TrafficClass::ReliableUnsequenced, 5, FragmentPosition::Last, b"cd"), now).await);
        assert!(f.processor.admit_unsequenced(whole(TrafficClass::ReliableUnsequenced, 7, b"whole"), now).await);
        assert!(!f.processor.admit_unsequenced(whole(TrafficClass::ReliableUnsequenced, 7, b"whole"), now).await);
        assert!(f.processor.admit_unsequenced(packet(TrafficClass::ReliableUnsequenced, 4, FragmentPosition::First, b"ab"), now).await);
        assert!(f.processor.admit_unsequenced(whole(TrafficClass::UnreliableUnsequenced, 1, b"uu"), now).await);

        assert!(f.processor.mark_reliable_unsequenced_received(tsn(9)).await);
        assert!(!f.processor.admit_unsequenced(whole(TrafficClass::ReliableUnsequenced, 9, b"cancelled"), now).await);

        assert_eq!(f.processor.cumulative_size_of_available_messages().await, 11);
        assert_eq!(f.processor.next_message_size(Duration::from_millis(1)).await, ReceiveOutcome::Message(5));
        for expected in ["whole", "abcd", "uu"] {
            assert_eq!(receive_string(&f.processor, Duration::from_millis(1)).await.as_deref(), Some(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_variants() {
        let f = fixture(MocketConfig {
            default_receive_timeout: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let now = Instant::now();

        let start = Instant::now();
        assert_eq!(f.processor.receive(&mut [0u8; 10], Duration::ZERO).await, ReceiveOutcome::Timeout);
        assert_eq!(Instant::now() - start, Duration::from_millis(30));

        f.processor.admit_unsequenced(whole(TrafficClass::UnreliableUnsequenced, 1, b"truncated"), now).await;
        let mut buf = [0u8; 5];
        assert_eq!(f.processor.receive(&mut buf, Duration::ZERO).await, ReceiveOutcome::Message(5));
        assert_eq!(&buf, b"trunc");

        f.processor.admit_unsequenced(whole(TrafficClass::UnreliableUnsequenced, 2, b"scattered"), now).await;
        let mut a = [0u8; 4];
        let mut b = [0u8; 10];
        assert_eq!(f.processor.sreceive(&mut [&mut a, &mut b], Duration::ZERO).await, ReceiveOutcome::Message(9));
        assert_eq!(&a, b"scat");
        assert_eq!(&b[..5], b"tered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_closes_received_messages() {
        let f = fixture(MocketConfig::default());
        let handle = spawn_loop(&f.processor);
        f.processor.admit_unsequenced(whole(TrafficClass::UnreliableUnsequenced, 1, b"before close"), Instant::now()).await;

        f.state.abort();
        handle.await.unwrap();

        assert_eq!(receive_string(&f.processor, Duration::ZERO).await.as_deref(), Some("before close"));
        assert_eq!(f.processor.receive(&mut [0u8; 10], Duration::ZERO).await, ReceiveOutcome::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_processed_on_delivery() {
        let f = fixture(MocketConfig::default());
        let now = Instant::now();

        let mut shutdown = Packet::new_control(vec![Chunk::state_change(ChunkType::Shutdown)]);
        shutdown.tsn = tsn(2);
        f.processor.admit_sequenced(shutdown, now).await;
        drain_sequenced(&f.processor).await;
        assert_eq!(f.state.current(), ConnectionState::Established);

        let mut first = Packet::new_control(vec![]);
        first.tsn = tsn(1);
        f.processor.admit_sequenced(first, now).await;
        drain_sequenced(&f.processor).await;
        assert_eq!(f.state.current(), ConnectionState::ShutdownReceived);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_defrost() {
        let f = fixture(MocketConfig::default());
        let now = Instant::now();
        f.processor.admit_sequenced(whole(TrafficClass::ReliableSequenced, 1, b"delivered"), now).await;
        f.processor.admit_sequenced(packet(TrafficClass::ReliableSequenced, 2, FragmentPosition::First, b"ab"), now).await;
        f.processor.admit_sequenced(packet(TrafficClass::ReliableSequenced, 4, FragmentPosition::Last, b"ef"), now).await;
        f.processor.admit_unsequenced(packet(TrafficClass::UnreliableUnsequenced, 8, FragmentPosition::First, b"uu"), now).await;
        drain_sequenced(&f.processor).await;

        let mut freezer = Freezer::new(now);
        f.processor.freeze(&mut freezer).await;
        let image = freezer.finish();

        let mut defroster = Defroster::new(image, now).unwrap();
        let defrosted = PacketProcessor::defrost(&mut defroster, Arc::new(MocketConfig::default()), f.state.clone(), f.stats.clone()).unwrap();
        defroster.finish().unwrap();

        assert_eq!(defrosted.reliable_sequenced.floor().await, tsn(3));
        assert_eq!(defrosted.reliable_sequenced.chain.lock().await.len(), 1);
        assert_eq!(defrosted.unreliable_unsequenced.lock().await.len(), 1);
        assert_eq!(defrosted.used_receive_buffer().await, f.processor.used_receive_buffer().await);

        defrosted.admit_sequenced(packet(TrafficClass::ReliableSequenced, 3, FragmentPosition::Intermediate, b"cd"), now).await;
        drain_sequenced(&defrosted).await;
        assert_eq!(receive_string(&defrosted, Duration::from_millis(1)).await.as_deref(), Some("delivered"));
        assert_eq!(receive_string(&defrosted, Duration::from_millis(1)).await.as_deref(), Some("abcdef"));
    }
}
