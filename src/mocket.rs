use crate::config::MocketConfig;
use crate::freeze::{Defroster, Freezer};
use crate::packet_processor::{PacketProcessor, ReceiveOutcome};
use crate::receiver::{Receiver, ReceiverContext};
use crate::socket::{ReceiveSocket, SendSocket};
use crate::state::{ConnectionState, StateMachine};
use crate::stats::{MocketStats, StatsSnapshot};
use crate::transmitter::{gate_for, SendOptions, Transmitter, TransmitterContext};
use anyhow::{bail, Context};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, span, Instrument, Level};

/// A message-oriented connection to a single peer.
///
/// A `Mocket` runs three tasks: the receive loop admitting datagrams, the packet processor
///  delivering messages, and the transmit loop. They stop when the connection is closed, aborted
///  or frozen.
pub struct Mocket {
    config: Arc<MocketConfig>,
    state: Arc<StateMachine>,
    stats: Arc<MocketStats>,
    processor: Arc<PacketProcessor>,
    transmitter: Arc<Transmitter>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Mocket {
    /// Binds a UDP socket and starts an established connection to `peer_addr`. Both sides must
    ///  be configured with matching initial TSNs and validation token.
    pub async fn bind(config: MocketConfig, local_addr: SocketAddr, peer_addr: SocketAddr) -> anyhow::Result<Mocket> {
        let socket = Arc::new(UdpSocket::bind(local_addr).await
            .with_context(|| format!("binding UDP socket to {:?}", local_addr))?);
        info!("bound UDP socket to {:?}", socket.local_addr()?);
        Mocket::new(config, peer_addr, Arc::new(socket.clone()), Arc::new(socket))
    }

    /// Starts an established connection over the given sockets. Must be called from inside a
    ///  tokio runtime.
    pub fn new(config: MocketConfig, peer_addr: SocketAddr, send_socket: Arc<dyn SendSocket>, receive_socket: Arc<dyn ReceiveSocket>) -> anyhow::Result<Mocket> {
        config.validate()?;
        let config = Arc::new(config);
        let (state, replies) = StateMachine::new(ConnectionState::Established);
        let state = Arc::new(state);
        let stats = Arc::new(MocketStats::default());
        let processor = Arc::new(PacketProcessor::new(config.clone(), state.clone(), stats.clone()));
        let transmitter = Arc::new(Transmitter::new(TransmitterContext {
            config: config.clone(),
            peer_addr,
            socket: send_socket,
            gate: gate_for(&config),
            processor: processor.clone(),
            state: state.clone(),
            stats: stats.clone(),
        }, replies));

        Ok(Mocket::start(config, peer_addr, receive_socket, state, stats, processor, transmitter))
    }

    fn start(config: Arc<MocketConfig>, peer_addr: SocketAddr, receive_socket: Arc<dyn ReceiveSocket>, state: Arc<StateMachine>, stats: Arc<MocketStats>, processor: Arc<PacketProcessor>, transmitter: Arc<Transmitter>) -> Mocket {
        let receiver = Arc::new(Receiver::new(ReceiverContext {
            config: config.clone(),
            peer_addr,
            socket: receive_socket,
            processor: processor.clone(),
            transmitter: transmitter.clone(),
            state: state.clone(),
            stats: stats.clone(),
        }));

        let span = span!(Level::INFO, "mocket", peer = ?peer_addr);
        let loops = vec![
            {
                let receiver = receiver.clone();
                tokio::spawn(async move { receiver.run().await }.instrument(span.clone()))
            },
            {
                let processor = processor.clone();
                tokio::spawn(async move { processor.run().await }.instrument(span.clone()))
            },
            {
                let transmitter = transmitter.clone();
                tokio::spawn(async move { transmitter.run().await }.instrument(span))
            },
        ];

        Mocket {
            config,
            state,
            stats,
            processor,
            transmitter,
            loops: Mutex::new(loops),
        }
    }

    pub fn config(&self) -> &MocketConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Sends a message, fragmenting it if it does not fit into a single packet
    pub async fn send(&self, reliable: bool, sequenced: bool, data: &[u8], options: &SendOptions) -> anyhow::Result<()> {
        self.transmitter.send(reliable, sequenced, data, options).await
    }

    /// Waits for the next message and copies it into `buf`, truncating it if `buf` is too small.
    ///  A zero timeout means the configured default receive timeout.
    pub async fn receive(&self, buf: &mut [u8], timeout: Duration) -> ReceiveOutcome {
        self.processor.receive(buf, timeout).await
    }

    /// Like `receive`, scattering the message over several buffers
    pub async fn sreceive(&self, bufs: &mut [&mut [u8]], timeout: Duration) -> ReceiveOutcome {
        self.processor.sreceive(bufs, timeout).await
    }

    /// The size of the next message, waiting for one to arrive
    pub async fn next_message_size(&self, timeout: Duration) -> ReceiveOutcome {
        self.processor.next_message_size(timeout).await
    }

    pub async fn cumulative_size_of_available_messages(&self) -> usize {
        self.processor.cumulative_size_of_available_messages().await
    }

    pub async fn cancel(&self, reliable: bool, sequenced: bool, tag: u16) -> usize {
        self.transmitter.cancel(reliable, sequenced, tag).await
    }

    /// Cancels the messages tagged `old_tag` and sends `data` tagged `options.tag` instead. The
    ///  new message inherits a cancelled message's priority if that is higher.
    pub async fn replace(&self, reliable: bool, sequenced: bool, data: &[u8], old_tag: u16, options: &SendOptions) -> anyhow::Result<()> {
        self.transmitter.replace(reliable, sequenced, data, old_tag, options).await
    }

    pub async fn statistics(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot().await;
        self.transmitter.fill_gauges(&mut snapshot).await;
        snapshot
    }

    /// Starts a graceful shutdown: queued data is still sent, and the connection is closed once
    ///  the peer acknowledged it
    pub fn close(&self) -> bool {
        self.state.close()
    }

    pub fn abort(&self) -> bool {
        self.state.abort()
    }

    /// Waits until the connection is closed or aborted. Returns `false` if that did not happen
    ///  before the timeout.
    pub async fn wait_terminated(&self, timeout: Duration) -> bool {
        let mut state = self.state.subscribe();
        tokio::time::timeout(timeout, state.wait_for(|s| s.is_terminated())).await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    async fn join_loops(&self) -> anyhow::Result<()> {
        let loops = std::mem::take(&mut *self.loops.lock().await);
        for handle in loops {
            handle.await.context("joining a connection loop")?;
        }
        Ok(())
    }

    /// Suspends the connection and writes its complete state into a binary image that `defrost`
    ///  turns back into a running connection, possibly in a different process. The connection
    ///  can not be used afterwards.
    pub async fn freeze(&self) -> anyhow::Result<Bytes> {
        if !self.state.suspend() {
            bail!("can not freeze a connection in state {}", self.state.current());
        }
        self.join_loops().await?;

        let mut freezer = Freezer::new(Instant::now());
        self.processor.freeze(&mut freezer).await;
        self.transmitter.freeze(&mut freezer).await;
        let image = freezer.finish();
        info!("froze connection into an image of {} bytes", image.len());
        Ok(image)
    }

    /// Restores a connection from an image written by `freeze` and starts it. The configuration
    ///  is not part of the image.
    pub fn defrost(image: Bytes, config: MocketConfig, peer_addr: SocketAddr, send_socket: Arc<dyn SendSocket>, receive_socket: Arc<dyn ReceiveSocket>) -> anyhow::Result<Mocket> {
        config.validate()?;
        let config = Arc::new(config);
        let mut defroster = Defroster::new(image, Instant::now())?;

        let (state, replies) = StateMachine::new(ConnectionState::Established);
        let state = Arc::new(state);
        let stats = Arc::new(MocketStats::default());
        let processor = Arc::new(PacketProcessor::defrost(&mut defroster, config.clone(), state.clone(), stats.clone())
            .context("packet processor")?);
        let transmitter = Arc::new(Transmitter::defrost(&mut defroster, TransmitterContext {
            config: config.clone(),
            peer_addr,
            socket: send_socket,
            gate: gate_for(&config),
            processor: processor.clone(),
            state: state.clone(),
            stats: stats.clone(),
        }, replies).context("transmitter")?);
        defroster.finish()?;

        info!("defrosted connection to {:?}", peer_addr);
        Ok(Mocket::start(config, peer_addr, receive_socket, state, stats, processor, transmitter))
    }
}

impl Drop for Mocket {
    fn drop(&mut self) {
        if let Ok(loops) = self.loops.try_lock() {
            for handle in loops.iter() {
                handle.abort();
            }
        }
    }
}
