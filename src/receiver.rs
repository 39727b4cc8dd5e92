use crate::chunk::{CancelledChunk, Chunk, ChunkType};
use crate::config::{MocketConfig, MAXIMUM_MTU};
use crate::packet::{Packet, TrafficClass};
use crate::packet_processor::PacketProcessor;
use crate::sequenced_queue::InsertOutcome;
use crate::socket::ReceiveSocket;
use crate::state::{ConnectionState, StateMachine};
use crate::stats::MocketStats;
use crate::transmitter::Transmitter;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::select;
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

pub struct ReceiverContext {
    pub config: Arc<MocketConfig>,
    pub peer_addr: SocketAddr,
    pub socket: Arc<dyn ReceiveSocket>,
    pub processor: Arc<PacketProcessor>,
    pub transmitter: Arc<Transmitter>,
    pub state: Arc<StateMachine>,
    pub stats: Arc<MocketStats>,
}

/// The admission loop: reads datagrams from the socket, validates them, applies piggybacked
///  chunks and hands data packets to the packet processor.
pub struct Receiver {
    ctx: ReceiverContext,
}

impl Receiver {
    pub fn new(ctx: ReceiverContext) -> Receiver {
        Receiver { ctx }
    }

    pub async fn run(&self) {
        info!("starting receive loop");

        let mut state = self.ctx.state.subscribe();
        let mut buf = vec![0u8; MAXIMUM_MTU];
        loop {
            if state.borrow_and_update().stops_loops() {
                break;
            }

            select! {
                received = self.ctx.socket.recv_packet(&mut buf) => {
                    let (num_read, from) = match received {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    };

                    let correlation_id = Uuid::new_v4();
                    let span = span!(Level::TRACE, "packet_received", ?correlation_id);
                    self.on_datagram(&buf[..num_read], from, Instant::now())
                        .instrument(span)
                        .await;
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("receive loop terminated");
    }

    fn is_allowed_from_elsewhere(packet: &Packet, state: ConnectionState) -> bool {
        packet.chunks.iter().any(|c| match c.chunk_type() {
            ChunkType::ReEstablish => true,
            ChunkType::Resume => state == ConnectionState::SuspendReceived,
            _ => false,
        })
    }

    pub async fn on_datagram(&self, buf: &[u8], from: SocketAddr, now: Instant) {
        trace!("received datagram of {} bytes from {:?}", buf.len(), from);

        let mut packet = match Packet::deser(&mut &buf[..]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("received unparsable packet from {:?} - dropping: {}", from, e);
                return;
            }
        };
        if packet.validation != self.ctx.config.validation {
            debug!("packet from {:?} has validation {} instead of {} - dropping", from, packet.validation, self.ctx.config.validation);
            return;
        }

        let state = self.ctx.state.current();
        if from != self.ctx.peer_addr && !Self::is_allowed_from_elsewhere(&packet, state) {
            warn!("packet from unexpected address {:?} - dropping", from);
            return;
        }
        self.ctx.stats.packet_received(buf.len());

        if state == ConnectionState::SuspendReceived && !Self::carries_suspend_or_resume(&packet) {
            trace!("connection is suspended by the peer - dropping {} #{}", packet.class, packet.tsn);
            return;
        }

        self.ctx.transmitter.update_remote_window(packet.window_size).await;
        for chunk in packet.take_piggyback_chunks() {
            self.on_piggyback_chunk(chunk, now).await;
        }

        // lifecycle chunks in control packets take effect in delivery order
        if packet.class != TrafficClass::Control {
            for chunk in &packet.chunks {
                if chunk.chunk_type().is_state_change() {
                    self.ctx.state.process_chunk(chunk.chunk_type());
                }
            }
        }

        self.admit(packet, now).await;
    }

    fn carries_suspend_or_resume(packet: &Packet) -> bool {
        packet.chunks.iter()
            .any(|c| matches!(c.chunk_type(), ChunkType::Suspend | ChunkType::Resume))
    }

    async fn on_piggyback_chunk(&self, chunk: Chunk, now: Instant) {
        match chunk {
            Chunk::SAck(sack) => self.ctx.transmitter.on_sack(&sack, now).await,
            Chunk::Cancelled(cancelled) => self.on_cancelled(&cancelled, now).await,
            Chunk::Timestamp { timestamp } => self.ctx.transmitter.on_timestamp(timestamp, now).await,
            Chunk::TimestampAck { timestamp } => self.ctx.transmitter.on_timestamp_ack(timestamp, now).await,
            other => warn!("unexpected piggyback chunk {:?} - ignoring", other.chunk_type()),
        }
    }

    async fn on_cancelled(&self, cancelled: &CancelledChunk, now: Instant) {
        let mut num_tombstones = 0;
        for tsn in cancelled.reliable_sequenced.iter_tsns() {
            self.ctx.transmitter.register_received(TrafficClass::ReliableSequenced, tsn, now).await;
            if self.ctx.processor.insert_tombstone(TrafficClass::ReliableSequenced, tsn, now).await {
                num_tombstones += 1;
            }
        }
        for tsn in cancelled.unreliable_sequenced.iter_tsns() {
            if self.ctx.processor.insert_tombstone(TrafficClass::UnreliableSequenced, tsn, now).await {
                num_tombstones += 1;
            }
        }
        for tsn in cancelled.reliable_unsequenced.iter_tsns() {
            self.ctx.transmitter.register_received(TrafficClass::ReliableUnsequenced, tsn, now).await;
            self.ctx.processor.mark_reliable_unsequenced_received(tsn).await;
        }
        if num_tombstones > 0 {
            debug!("peer cancelled {} packets", num_tombstones);
        }
    }

    async fn admit(&self, packet: Packet, now: Instant) {
        if packet.class == TrafficClass::UnreliableUnsequenced && !packet.has_data() {
            // standalone packet, its chunks were processed above
            return;
        }

        let class = packet.class;
        let tsn = packet.tsn;
        if class.is_reliable() && self.ctx.transmitter.already_received(class, tsn).await {
            debug!("{} #{} was received before - dropping", class, tsn);
            self.ctx.stats.discarded_duplicate();
            self.ctx.transmitter.request_sack(now).await;
            return;
        }

        if packet.has_data() {
            let used = self.ctx.processor.used_receive_buffer().await;
            if used + packet.size() > self.ctx.config.max_receive_window as usize {
                debug!("no room in the receive window for {} #{} - dropping", packet.class, packet.tsn);
                self.ctx.stats.discarded_no_room();
                return;
            }
        }

        if class.is_reliable() && !self.ctx.transmitter.register_received(class, tsn, now).await {
            debug!("{} #{} was received before - dropping", class, tsn);
            self.ctx.stats.discarded_duplicate();
            self.ctx.transmitter.request_sack(now).await;
            return;
        }

        if class.is_sequenced() {
            match self.ctx.processor.admit_sequenced(packet, now).await {
                InsertOutcome::Inserted => {}
                InsertOutcome::Stale | InsertOutcome::Duplicate => self.ctx.stats.discarded_duplicate(),
            }
        }
        else if !self.ctx.processor.admit_unsequenced(packet, now).await {
            debug!("{} #{} was received before - dropping", class, tsn);
            self.ctx.stats.discarded_duplicate();
        }
    }
}
