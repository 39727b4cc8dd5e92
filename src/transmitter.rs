use crate::ack_manager::AckManager;
use crate::cancelled_tsn_manager::CancelledTsnManager;
use crate::chunk::{Chunk, ChunkType, SAckChunk, TsnBlocks};
use crate::config::{InitialTsns, MocketConfig};
use crate::freeze::{Defroster, Freezer};
use crate::packet::{DeliveryPrerequisites, FragmentPosition, Packet, TrafficClass};
use crate::packet_processor::PacketProcessor;
use crate::packet_wrapper::{PacketWrapper, WrapperMeta};
use crate::pending_queue::{EnqueueOutcome, PendingPacketQueue};
use crate::socket::SendSocket;
use crate::state::{ConnectionState, StateMachine};
use crate::stats::{MocketStats, StatsSnapshot};
use crate::tsn::Tsn;
use crate::unacked_queue::UnacknowledgedPacketQueue;
use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Decides whether a packet may be sent now. Congestion control and rate limiting plug in here.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendGate: Send + Sync + 'static {
    /// `None` if a packet of `num_bytes` may be sent now, otherwise the time at which to ask again
    async fn check(&self, num_bytes: usize, now: Instant) -> Option<Instant>;

    async fn packet_sent(&self, num_bytes: usize, now: Instant);
}

pub struct UnlimitedGate;

#[async_trait]
impl SendGate for UnlimitedGate {
    async fn check(&self, _num_bytes: usize, _now: Instant) -> Option<Instant> {
        None
    }

    async fn packet_sent(&self, _num_bytes: usize, _now: Instant) {}
}

/// Spaces packets so that outgoing traffic stays at or below a fixed number of bytes per second
pub struct RateLimitGate {
    bytes_per_second: u32,
    next_free: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    pub fn new(bytes_per_second: u32) -> RateLimitGate {
        RateLimitGate {
            bytes_per_second,
            next_free: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SendGate for RateLimitGate {
    async fn check(&self, _num_bytes: usize, now: Instant) -> Option<Instant> {
        match *self.next_free.lock().await {
            Some(next_free) if next_free > now => Some(next_free),
            _ => None,
        }
    }

    async fn packet_sent(&self, num_bytes: usize, now: Instant) {
        let mut next_free = self.next_free.lock().await;
        let start = next_free.map_or(now, |t| t.max(now));
        *next_free = Some(start + Duration::from_secs_f64(num_bytes as f64 / self.bytes_per_second as f64));
    }
}

pub fn gate_for(config: &MocketConfig) -> Arc<dyn SendGate> {
    if config.transmit_rate_limit == 0 {
        Arc::new(UnlimitedGate)
    }
    else {
        Arc::new(RateLimitGate::new(config.transmit_rate_limit))
    }
}

/// Per-message parameters for `send`
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub tag: u16,
    /// 0 is the lowest priority, 255 the highest
    pub priority: u8,
    /// how long `send` waits for room in the pending queue, `None` for no limit
    pub enqueue_timeout: Option<Duration>,
    /// how long a reliable message is retransmitted before it is given up and cancelled, `None`
    ///  for no limit
    pub retry_timeout: Option<Duration>,
}

/// The collaborators a transmitter works with
pub struct TransmitterContext {
    pub config: Arc<MocketConfig>,
    pub peer_addr: SocketAddr,
    pub socket: Arc<dyn SendSocket>,
    pub gate: Arc<dyn SendGate>,
    /// source of the receive window this side advertises
    pub processor: Arc<PacketProcessor>,
    pub state: Arc<StateMachine>,
    pub stats: Arc<MocketStats>,
}

enum Attempt {
    Sent,
    Blocked(Instant),
    Nothing,
}

const RELIABLE_CLASSES: [TrafficClass; 3] = [TrafficClass::Control, TrafficClass::ReliableSequenced, TrafficClass::ReliableUnsequenced];

/// RTT samples above this are treated as garbage, e.g. timestamps from before a freeze
const MAX_RTT_SAMPLE_MILLIS: i64 = 60_000;

struct TransmitterInner {
    next_tsns: InitialTsns,
    next_message_tsn: Tsn,
    control_unacked: UnacknowledgedPacketQueue,
    reliable_sequenced_unacked: UnacknowledgedPacketQueue,
    reliable_unsequenced_unacked: UnacknowledgedPacketQueue,
    ack_manager: AckManager,
    cancelled: CancelledTsnManager,
    remote_window: u32,
    rtt: Duration,
    last_sent: Instant,
    /// a received timestamp to echo, and when it arrived
    timestamp_ack: Option<(i64, Instant)>,
}

impl TransmitterInner {
    fn new(config: &MocketConfig, ack_manager: AckManager, now: Instant) -> TransmitterInner {
        TransmitterInner {
            next_tsns: config.local_initial_tsns,
            next_message_tsn: Tsn::from_raw(1),
            control_unacked: UnacknowledgedPacketQueue::new(),
            reliable_sequenced_unacked: UnacknowledgedPacketQueue::new(),
            reliable_unsequenced_unacked: UnacknowledgedPacketQueue::new(),
            ack_manager,
            cancelled: CancelledTsnManager::default(),
            remote_window: config.max_receive_window,
            rtt: config.initial_rtt,
            last_sent: now,
            timestamp_ack: None,
        }
    }

    fn unacked(&self, class: TrafficClass) -> Option<&UnacknowledgedPacketQueue> {
        match class {
            TrafficClass::Control => Some(&self.control_unacked),
            TrafficClass::ReliableSequenced => Some(&self.reliable_sequenced_unacked),
            TrafficClass::ReliableUnsequenced => Some(&self.reliable_unsequenced_unacked),
            _ => None,
        }
    }

    fn unacked_mut(&mut self, class: TrafficClass) -> Option<&mut UnacknowledgedPacketQueue> {
        match class {
            TrafficClass::Control => Some(&mut self.control_unacked),
            TrafficClass::ReliableSequenced => Some(&mut self.reliable_sequenced_unacked),
            TrafficClass::ReliableUnsequenced => Some(&mut self.reliable_unsequenced_unacked),
            _ => None,
        }
    }

    fn unacked_bytes(&self) -> usize {
        self.control_unacked.queued_bytes() + self.reliable_sequenced_unacked.queued_bytes() + self.reliable_unsequenced_unacked.queued_bytes()
    }

    fn all_acknowledged(&self) -> bool {
        self.control_unacked.is_empty() && self.reliable_sequenced_unacked.is_empty() && self.reliable_unsequenced_unacked.is_empty()
    }

    fn take_tsn(&mut self, class: TrafficClass) -> Tsn {
        let slot = self.next_tsns.for_class_mut(class);
        let tsn = *slot;
        *slot = tsn.next();
        tsn
    }

    fn take_message_tsn(&mut self) -> Tsn {
        let result = self.next_message_tsn;
        self.next_message_tsn = result.next();
        if self.next_message_tsn == Tsn::ZERO {
            self.next_message_tsn = Tsn::from_raw(1);
        }
        result
    }

    fn prerequisites(&self) -> DeliveryPrerequisites {
        DeliveryPrerequisites {
            control: self.next_tsns.control,
            reliable_sequenced: self.next_tsns.reliable_sequenced,
            unreliable_sequenced: self.next_tsns.unreliable_sequenced,
        }
    }

    fn rtt_sample(&mut self, sample: Duration) {
        self.rtt = (self.rtt * 7 + sample) / 8;
        trace!("RTT sample {:?}, estimate {:?}", sample, self.rtt);
    }

    fn next_retransmit_due(&self) -> Option<Instant> {
        RELIABLE_CLASSES.iter()
            .filter_map(|c| self.unacked(*c))
            .filter_map(|q| q.next_due_time())
            .min()
    }

    fn standalone_due_at(&self, config: &MocketConfig) -> Option<Instant> {
        [
            self.ack_manager.standalone_sack_due_at(config.sack_transmit_timeout),
            self.cancelled.standalone_due_at(config.cancelled_tsn_transmit_interval),
            self.timestamp_ack.map(|(_, received)| received),
        ].into_iter()
            .flatten()
            .min()
    }

    /// The acknowledgement and timing chunks that are due, as far as they fit into `room` bytes.
    ///  Chunks that do not fit into a standalone packet are dropped so they can not block the
    ///  transmit loop.
    fn piggyback_chunks(&mut self, mut room: usize, now: Instant, config: &MocketConfig, standalone: bool) -> Vec<Chunk> {
        let mut result = Vec::new();

        if self.ack_manager.has_news() {
            let sack = Chunk::SAck(self.ack_manager.sack_chunk());
            if sack.serialized_len() <= room {
                room -= sack.serialized_len();
                result.push(sack);
                self.ack_manager.sack_sent(now);
            }
            else if standalone {
                warn!("SAck chunk of {} bytes does not fit into a packet - skipping", sack.serialized_len());
                self.ack_manager.sack_sent(now);
            }
        }

        if self.cancelled.standalone_due_at(config.cancelled_tsn_transmit_interval).is_some_and(|due| due <= now) {
            if let Some(cancelled) = self.cancelled.cancelled_chunk() {
                let chunk = Chunk::Cancelled(cancelled);
                if chunk.serialized_len() <= room {
                    room -= chunk.serialized_len();
                    result.push(chunk);
                    self.cancelled.chunk_sent(now);
                }
                else if standalone {
                    warn!("Cancelled chunk of {} bytes does not fit into a packet - skipping", chunk.serialized_len());
                    self.cancelled.chunk_sent(now);
                }
            }
        }

        if let Some((timestamp, _)) = self.timestamp_ack {
            let chunk = Chunk::TimestampAck { timestamp };
            if chunk.serialized_len() <= room {
                result.push(chunk);
                self.timestamp_ack = None;
            }
        }

        result
    }

    fn freeze(&self, freezer: &mut Freezer) {
        self.control_unacked.freeze(freezer);
        self.reliable_sequenced_unacked.freeze(freezer);
        self.reliable_unsequenced_unacked.freeze(freezer);
        self.ack_manager.freeze(freezer);
        self.cancelled.freeze(freezer);
    }
}

/// The send side of a connection. The application enqueues messages with `send`; the transmit
///  loop (`run`) assigns TSNs, sends packets when the remote window and the `SendGate` allow it,
///  keeps reliable packets until they are acknowledged and retransmits them.
///
/// The transmitter also owns the acknowledgement state for packets received from the peer,
///  because SAck and Cancelled chunks ride along on outgoing packets.
pub struct Transmitter {
    ctx: TransmitterContext,
    pending: PendingPacketQueue,
    inner: Mutex<TransmitterInner>,
    wake: Notify,
    replies: Mutex<mpsc::UnboundedReceiver<ChunkType>>,
    /// reference point for the timestamps this side sends
    clock_base: Instant,
}

impl Transmitter {
    /// `replies` is the receiving end of the state machine's channel for chunks that must be sent
    ///  in reply to lifecycle chunks
    pub fn new(ctx: TransmitterContext, replies: mpsc::UnboundedReceiver<ChunkType>) -> Transmitter {
        let now = Instant::now();
        let ack_manager = AckManager::new(&ctx.config.remote_initial_tsns);
        Transmitter {
            pending: PendingPacketQueue::new(ctx.config.pending_queue_size, ctx.config.cross_sequencing),
            inner: Mutex::new(TransmitterInner::new(&ctx.config, ack_manager, now)),
            wake: Notify::new(),
            replies: Mutex::new(replies),
            clock_base: now,
            ctx,
        }
    }

    fn timestamp(&self, now: Instant) -> i64 {
        i64::try_from(now.saturating_duration_since(self.clock_base).as_millis()).unwrap_or(i64::MAX)
    }

    /// Splits a message into packets and adds them to the pending queue. Fails if the connection
    ///  is not established, or if a fragment can not be enqueued; in the latter case fragments
    ///  of the message that were not transmitted yet are removed again.
    pub async fn send(&self, reliable: bool, sequenced: bool, data: &[u8], options: &SendOptions) -> anyhow::Result<()> {
        let state = self.ctx.state.current();
        if state != ConnectionState::Established {
            bail!("can not send in connection state {}", state);
        }

        let class = TrafficClass::for_message(reliable, sequenced);
        let max_payload_len = Packet::max_payload_len(self.ctx.config.mtu, self.ctx.config.cross_sequencing && class.is_sequenced());
        let pieces: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        }
        else {
            data.chunks(max_payload_len).collect()
        };
        let num_pieces = pieces.len();

        let message_tsn = if num_pieces > 1 {
            self.inner.lock().await.take_message_tsn()
        }
        else {
            Tsn::ZERO
        };
        trace!("sending {} message of {} bytes with tag {} in {} packet(s)", class, data.len(), options.tag, num_pieces);

        let now = Instant::now();
        let mut enqueued = Vec::with_capacity(num_pieces);
        for (i, piece) in pieces.into_iter().enumerate() {
            let fragment = match (num_pieces, i) {
                (1, _) => FragmentPosition::Whole,
                (_, 0) => FragmentPosition::First,
                (n, i) if i == n - 1 => FragmentPosition::Last,
                _ => FragmentPosition::Intermediate,
            };
            let packet = Packet::new_data(class, fragment, options.tag, Bytes::copy_from_slice(piece));
            let mut meta = WrapperMeta::new(now, options.priority);
            meta.message_tsn = message_tsn;
            if class.is_reliable() {
                meta.retry_timeout = options.retry_timeout;
            }

            match self.pending.insert(PacketWrapper::Payload(packet, meta), options.enqueue_timeout).await {
                EnqueueOutcome::Enqueued(id) => {
                    enqueued.push(id);
                    self.wake.notify_one();
                }
                outcome => {
                    for id in enqueued {
                        self.pending.remove(id).await;
                    }
                    bail!("packet {} of {} of a {} message with tag {} could not be enqueued: {:?}", i + 1, num_pieces, class, options.tag, outcome);
                }
            }
        }

        self.ctx.stats.message_sent(class, options.tag).await;
        Ok(())
    }

    /// Removes all queued and unacknowledged packets of a flow with the given tag, returning the
    ///  number of removed packets. Cancelled TSNs of reliable flows are announced to the peer.
    pub async fn cancel(&self, reliable: bool, sequenced: bool, tag: u16) -> usize {
        self.cancel_with_priority(reliable, sequenced, tag).await.0
    }

    /// Cancels all messages with `old_tag` and sends `data` in their place with the new tag in
    ///  `options`. The new message keeps the highest priority of the cancelled pending packets
    ///  if that is higher than its own.
    pub async fn replace(&self, reliable: bool, sequenced: bool, data: &[u8], old_tag: u16, options: &SendOptions) -> anyhow::Result<()> {
        let (num_cancelled, highest_priority) = self.cancel_with_priority(reliable, sequenced, old_tag).await;
        let priority = highest_priority
            .map_or(options.priority, |p| p.max(options.priority));
        debug!("replacing {} packets with tag {} by a message with tag {} and priority {}", num_cancelled, old_tag, options.tag, priority);

        let options = SendOptions {
            priority,
            ..options.clone()
        };
        self.send(reliable, sequenced, data, &options).await
    }

    /// returns the number of cancelled packets, and the highest priority of the cancelled
    ///  pending packets
    async fn cancel_with_priority(&self, reliable: bool, sequenced: bool, tag: u16) -> (usize, Option<u8>) {
        let class = TrafficClass::for_message(reliable, sequenced);
        let (mut num_cancelled, highest_priority) = self.pending.cancel(reliable, sequenced, tag).await;

        if class.is_reliable() {
            let now = Instant::now();
            let mut inner = self.inner.lock().await;
            let tsns = inner.unacked_mut(class)
                .map(|q| q.cancel(tag))
                .unwrap_or_default();
            for tsn in &tsns {
                inner.cancelled.cancel(class, *tsn, now);
            }
            if !tsns.is_empty() {
                debug!("cancelled {} unacknowledged {} packets with tag {}", tsns.len(), class, tag);
            }
            num_cancelled += tsns.len();
        }

        self.ctx.stats.packets_cancelled(tag, num_cancelled).await;
        if num_cancelled > 0 {
            self.wake.notify_one();
        }
        (num_cancelled, highest_priority)
    }

    /// Registers a reliable packet received from the peer for acknowledgement. Returns `false`
    ///  if it was received before.
    pub async fn register_received(&self, class: TrafficClass, tsn: Tsn, now: Instant) -> bool {
        let is_new = self.inner.lock().await
            .ack_manager.received(class, tsn, now);
        if is_new {
            self.wake.notify_one();
        }
        is_new
    }

    pub async fn already_received(&self, class: TrafficClass, tsn: Tsn) -> bool {
        self.inner.lock().await
            .ack_manager.already_received(class, tsn)
    }

    pub async fn request_sack(&self, now: Instant) {
        self.inner.lock().await
            .ack_manager.request_sack(now);
        self.wake.notify_one();
    }

    pub async fn update_remote_window(&self, window_size: u32) {
        let mut inner = self.inner.lock().await;
        let grew = window_size > inner.remote_window;
        inner.remote_window = window_size;
        drop(inner);
        if grew {
            self.wake.notify_one();
        }
    }

    pub async fn on_sack(&self, sack: &SAckChunk, now: Instant) {
        let mut inner = self.inner.lock().await;
        let mut num_acknowledged = 0;
        let mut min_ack_time: Option<Duration> = None;

        for (class, cumulative, blocks) in [
            (TrafficClass::Control, sack.control_cumulative, &sack.control),
            (TrafficClass::ReliableSequenced, sack.reliable_sequenced_cumulative, &sack.reliable_sequenced),
            (TrafficClass::ReliableUnsequenced, sack.reliable_unsequenced_cumulative, &sack.reliable_unsequenced),
        ] {
            if let Some(queue) = inner.unacked_mut(class) {
                num_acknowledged += Self::acknowledge(queue, cumulative, blocks, now);
                if let Some(ack_time) = queue.take_min_ack_time() {
                    min_ack_time = Some(min_ack_time.map_or(ack_time, |t| t.min(ack_time)));
                }
            }
        }
        inner.cancelled.on_sack(sack);
        if let Some(sample) = min_ack_time {
            inner.rtt_sample(sample);
        }
        drop(inner);

        if num_acknowledged > 0 {
            trace!("SAck acknowledged {} packets", num_acknowledged);
            self.wake.notify_one();
        }
    }

    fn acknowledge(queue: &mut UnacknowledgedPacketQueue, cumulative: Tsn, blocks: &TsnBlocks, now: Instant) -> usize {
        let mut result = queue.acknowledge_up_to(cumulative, now).packets;
        for (start, end) in &blocks.ranges {
            result += queue.acknowledge_range(*start, *end, now).packets;
        }
        for tsn in &blocks.singles {
            result += queue.acknowledge_range(*tsn, *tsn, now).packets;
        }
        result
    }

    /// The peer sent a timestamp to be echoed
    pub async fn on_timestamp(&self, timestamp: i64, now: Instant) {
        self.inner.lock().await.timestamp_ack = Some((timestamp, now));
        self.wake.notify_one();
    }

    /// The peer echoed one of this side's timestamps
    pub async fn on_timestamp_ack(&self, timestamp: i64, now: Instant) {
        let millis = self.timestamp(now).saturating_sub(timestamp);
        if !(0..=MAX_RTT_SAMPLE_MILLIS).contains(&millis) {
            debug!("ignoring timestamp ack {} at {}", timestamp, self.timestamp(now));
            return;
        }
        self.inner.lock().await
            .rtt_sample(Duration::from_millis(millis as u64));
    }

    pub async fn fill_gauges(&self, snapshot: &mut StatsSnapshot) {
        let (pending_bytes, pending_packets) = self.pending.counts().await;
        snapshot.pending_data_size = pending_bytes;
        snapshot.pending_packet_count = pending_packets;

        let inner = self.inner.lock().await;
        snapshot.reliable_sequenced_unacknowledged_data_size = inner.reliable_sequenced_unacked.queued_bytes();
        snapshot.reliable_sequenced_unacknowledged_packet_count = inner.reliable_sequenced_unacked.len();
        snapshot.reliable_unsequenced_unacknowledged_data_size = inner.reliable_unsequenced_unacked.queued_bytes();
        snapshot.reliable_unsequenced_unacknowledged_packet_count = inner.reliable_unsequenced_unacked.len();
    }

    /// The transmit loop. It runs until the connection is terminated or suspended. Chunks the
    ///  state machine asks to send are sent before the loop checks the state, so that e.g. an
    ///  Abort goes out before the loop stops.
    pub async fn run(&self) {
        info!("starting transmit loop");
        let mut state = self.ctx.state.subscribe();
        let mut replies = self.replies.lock().await;

        loop {
            while let Ok(chunk_type) = replies.try_recv() {
                self.send_lifecycle_chunk(chunk_type, Instant::now()).await;
            }

            let current = *state.borrow_and_update();
            if current.stops_loops() {
                break;
            }

            let wake_at = match self.step(Instant::now(), current).await {
                None => continue,
                Some(wake_at) => wake_at,
            };

            select! {
                _ = self.wake.notified() => {}
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                reply = replies.recv() => {
                    if let Some(chunk_type) = reply {
                        self.send_lifecycle_chunk(chunk_type, Instant::now()).await;
                    }
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }

        self.pending.close().await;
        info!("transmit loop terminated");
    }

    /// Does one unit of work. Returns `None` if something was sent, otherwise the time at which
    ///  there may be work to do.
    async fn step(&self, now: Instant, state: ConnectionState) -> Option<Instant> {
        let mut wake_at: Option<Instant> = None;

        if state.is_receiving() {
            self.expire_unacknowledged(now).await;

            match self.retransmit(now).await {
                Attempt::Sent => return None,
                Attempt::Blocked(at) => wake_at = Some(at),
                Attempt::Nothing => {}
            }
            match self.transmit_pending(now).await {
                Attempt::Sent => return None,
                Attempt::Blocked(at) => wake_at = Some(wake_at.map_or(at, |t| t.min(at))),
                Attempt::Nothing => {}
            }

            if matches!(state, ConnectionState::ShutdownPending | ConnectionState::ShutdownReceived) && self.is_flushed().await {
                if let Some(chunk_type) = self.ctx.state.outstanding_queue_flushed() {
                    self.send_lifecycle_chunk(chunk_type, now).await;
                    return None;
                }
            }
        }

        let (standalone_due, heartbeat_due, retransmit_due) = {
            let inner = self.inner.lock().await;
            (inner.standalone_due_at(&self.ctx.config), inner.last_sent + self.ctx.config.keepalive_timeout, inner.next_retransmit_due())
        };

        if let Some(due) = standalone_due {
            if due <= now {
                self.send_standalone(Vec::new(), now).await;
                return None;
            }
            wake_at = Some(wake_at.map_or(due, |t| t.min(due)));
        }

        if heartbeat_due <= now {
            let timestamp = self.timestamp(now);
            self.send_standalone(vec![Chunk::Heartbeat { timestamp }, Chunk::Timestamp { timestamp }], now).await;
            return None;
        }

        let mut result = wake_at.map_or(heartbeat_due, |t| t.min(heartbeat_due));
        if state.is_receiving() {
            if let Some(due) = retransmit_due {
                result = result.min(due);
            }
        }
        Some(result)
    }

    async fn is_flushed(&self) -> bool {
        self.pending.is_empty().await && self.inner.lock().await.all_acknowledged()
    }

    async fn advertised_window(&self) -> u32 {
        let used = u32::try_from(self.ctx.processor.used_receive_buffer().await).unwrap_or(u32::MAX);
        self.ctx.config.max_receive_window.saturating_sub(used)
    }

    fn retransmit_timeout(&self, rtt: Duration, retransmit_count: u32) -> Duration {
        let rto = self.ctx.config.rto_for(rtt).saturating_mul(1 << retransmit_count.min(6));
        match self.ctx.config.max_rto {
            Some(max_rto) => rto.min(max_rto),
            None => rto,
        }
    }

    /// Adds header fields and the due piggyback chunks, and serializes the packet
    async fn finish_packet(&self, inner: &mut TransmitterInner, packet: &mut Packet, now: Instant, standalone: bool) -> Bytes {
        packet.window_size = self.advertised_window().await;
        packet.validation = self.ctx.config.validation;

        let room = self.ctx.config.mtu.saturating_sub(packet.size());
        let piggyback = inner.piggyback_chunks(room, now, &self.ctx.config, standalone);

        let mut buf = BytesMut::with_capacity(self.ctx.config.mtu);
        packet.ser_with_piggyback(&piggyback, &mut buf);
        inner.last_sent = now;
        buf.freeze()
    }

    async fn put_on_wire(&self, buf: Bytes, now: Instant) {
        self.ctx.gate.packet_sent(buf.len(), now).await;
        self.ctx.socket.send_packet(self.ctx.peer_addr, &buf).await;
        self.ctx.stats.packet_sent(buf.len());
    }

    /// Gives up on reliable packets whose retry timeout elapsed, and announces their TSNs as
    ///  cancelled
    async fn expire_unacknowledged(&self, now: Instant) {
        let mut expired_tags = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            for class in [TrafficClass::ReliableSequenced, TrafficClass::ReliableUnsequenced] {
                let expired = match inner.unacked_mut(class) {
                    Some(queue) => queue.remove_expired(now),
                    None => continue,
                };
                for wrapper in expired {
                    debug!("giving up on {} #{} after its retry timeout", class, wrapper.tsn());
                    inner.cancelled.cancel(class, wrapper.tsn(), now);
                    expired_tags.push(wrapper.packet().map(|p| p.tag()).unwrap_or(0));
                }
            }
        }
        for tag in expired_tags {
            self.ctx.stats.packets_cancelled(tag, 1).await;
        }
    }

    async fn retransmit(&self, now: Instant) -> Attempt {
        let mut inner = self.inner.lock().await;
        let due = RELIABLE_CLASSES.iter()
            .find_map(|c| inner.unacked(*c).and_then(|q| q.next_timed_out(now)).map(|tsn| (*c, tsn)));
        let (class, tsn) = match due {
            Some(due) => due,
            None => return Attempt::Nothing,
        };

        let (size, retransmit_count) = match inner.unacked(class).and_then(|q| q.get(tsn)) {
            Some(wrapper) => (wrapper.size(), wrapper.meta().retransmit_count),
            None => return Attempt::Nothing,
        };
        if let Some(at) = self.ctx.gate.check(size, now).await {
            return Attempt::Blocked(at);
        }

        let rto = self.retransmit_timeout(inner.rtt, retransmit_count + 1);
        let mut packet = match inner.unacked_mut(class) {
            Some(queue) => {
                queue.packet_retransmitted(tsn, now, rto);
                match queue.get(tsn).and_then(|w| w.packet()) {
                    Some(packet) => packet.clone(),
                    None => return Attempt::Nothing,
                }
            }
            None => return Attempt::Nothing,
        };
        let buf = self.finish_packet(&mut inner, &mut packet, now, false).await;
        drop(inner);

        debug!("retransmitting {} #{}, next timeout {:?}", class, tsn, rto);
        self.ctx.stats.packet_retransmitted();
        self.put_on_wire(buf, now).await;
        Attempt::Sent
    }

    fn is_expired(wrapper: &PacketWrapper, now: Instant) -> bool {
        wrapper.meta().retry_timeout
            .is_some_and(|timeout| now.saturating_duration_since(wrapper.meta().enqueue_time) >= timeout)
    }

    async fn transmit_pending(&self, now: Instant) -> Attempt {
        if let Some(expired) = self.pending.pop_front_if(|w| Self::is_expired(w, now)).await {
            debug!("retry timeout expired before the first transmission - dropping");
            self.ctx.stats.packets_cancelled(expired.packet().map(|p| p.tag()).unwrap_or(0), 1).await;
            return Attempt::Sent;
        }

        let size = match self.pending.peek().await {
            Some(head) => head.size(),
            None => return Attempt::Nothing,
        };
        {
            let inner = self.inner.lock().await;
            if inner.unacked_bytes() + size > inner.remote_window as usize {
                trace!("remote window of {} bytes is full", inner.remote_window);
                return Attempt::Nothing;
            }
        }
        if let Some(at) = self.ctx.gate.check(size, now).await {
            return Attempt::Blocked(at);
        }

        let (mut packet, mut meta) = match self.pending.pop_front().await {
            Some(PacketWrapper::Payload(packet, meta)) => (packet, meta),
            Some(PacketWrapper::Cancelled(tsn, _)) => {
                warn!("tombstone #{} in the pending queue - this is a bug", tsn);
                return Attempt::Sent;
            }
            None => return Attempt::Nothing,
        };

        let mut inner = self.inner.lock().await;
        packet.tsn = inner.take_tsn(packet.class);
        if self.ctx.config.cross_sequencing && packet.class.is_sequenced() {
            packet.prerequisites = Some(inner.prerequisites());
        }
        meta.last_io_time = now;
        meta.retransmit_timeout = self.ctx.config.rto_for(inner.rtt);

        let class = packet.class;
        let tsn = packet.tsn;
        let buf = self.finish_packet(&mut inner, &mut packet, now, false).await;
        if let Some(queue) = inner.unacked_mut(class) {
            queue.insert(PacketWrapper::Payload(packet, meta));
        }
        drop(inner);

        trace!("sending {} #{}", class, tsn);
        self.put_on_wire(buf, now).await;
        Attempt::Sent
    }

    /// Sends a lifecycle chunk in a control packet, bypassing the send gate
    async fn send_lifecycle_chunk(&self, chunk_type: ChunkType, now: Instant) {
        let mut packet = Packet::new_control(vec![Chunk::state_change(chunk_type)]);

        let mut inner = self.inner.lock().await;
        packet.tsn = inner.take_tsn(TrafficClass::Control);
        if self.ctx.config.cross_sequencing {
            packet.prerequisites = Some(inner.prerequisites());
        }
        let mut meta = WrapperMeta::new(now, u8::MAX);
        meta.retransmit_timeout = self.ctx.config.rto_for(inner.rtt);

        let tsn = packet.tsn;
        let buf = self.finish_packet(&mut inner, &mut packet, now, false).await;
        inner.control_unacked.insert(PacketWrapper::Payload(packet, meta));
        drop(inner);

        debug!("sending {:?} in control packet #{}", chunk_type, tsn);
        self.put_on_wire(buf, now).await;
    }

    /// Sends a packet without TSN, carrying the given chunks and the due piggyback chunks
    async fn send_standalone(&self, chunks: Vec<Chunk>, now: Instant) {
        let mut packet = Packet::new_standalone(chunks);
        let mut inner = self.inner.lock().await;
        let buf = self.finish_packet(&mut inner, &mut packet, now, true).await;
        drop(inner);

        trace!("sending standalone packet of {} bytes", buf.len());
        self.put_on_wire(buf, now).await;
    }

    pub async fn freeze(&self, freezer: &mut Freezer) {
        {
            let inner = self.inner.lock().await;
            for class in TrafficClass::ALL {
                freezer.put_tsn(inner.next_tsns.for_class(class));
            }
            freezer.put_tsn(inner.next_message_tsn);
        }
        self.pending.freeze(freezer).await;
        self.inner.lock().await.freeze(freezer);
    }

    pub fn defrost(defroster: &mut Defroster, ctx: TransmitterContext, replies: mpsc::UnboundedReceiver<ChunkType>) -> anyhow::Result<Transmitter> {
        let mut next_tsns = InitialTsns::default();
        for class in TrafficClass::ALL {
            *next_tsns.for_class_mut(class) = defroster.get_tsn().context("next TSNs")?;
        }
        let next_message_tsn = defroster.get_tsn().context("message TSN")?;
        let pending = PendingPacketQueue::defrost(defroster, ctx.config.pending_queue_size, ctx.config.cross_sequencing)
            .context("pending queue")?;
        let control_unacked = UnacknowledgedPacketQueue::defrost(defroster).context("unacknowledged control packets")?;
        let reliable_sequenced_unacked = UnacknowledgedPacketQueue::defrost(defroster).context("unacknowledged reliable sequenced packets")?;
        let reliable_unsequenced_unacked = UnacknowledgedPacketQueue::defrost(defroster).context("unacknowledged reliable unsequenced packets")?;
        let ack_manager = AckManager::defrost(defroster).context("ack manager")?;
        let cancelled = CancelledTsnManager::defrost(defroster).context("cancelled TSNs")?;

        let now = defroster.now();
        let inner = TransmitterInner {
            next_tsns,
            next_message_tsn,
            control_unacked,
            reliable_sequenced_unacked,
            reliable_unsequenced_unacked,
            cancelled,
            ..TransmitterInner::new(&ctx.config, ack_manager, now)
        };

        Ok(Transmitter {
            pending,
            inner: Mutex::new(inner),
            wake: Notify::new(),
            replies: Mutex::new(replies),
            clock_base: now,
            ctx,
        })
    }
}
