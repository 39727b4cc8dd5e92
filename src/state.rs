use crate::chunk::ChunkType;
use std::fmt::{Display, Formatter};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Established,
    /// the peer suspended the connection; only Suspend and Resume packets are processed
    SuspendReceived,
    /// suspended locally, e.g. to freeze the connection
    Suspended,
    /// the application closed the connection, and queued data is still being flushed
    ShutdownPending,
    ShutdownSent,
    /// the peer closed the connection, and queued data is still being flushed
    ShutdownReceived,
    ShutdownAckSent,
    Closed,
    ApplicationAbort,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl ConnectionState {
    /// true if the connection is gone for good
    pub fn is_terminated(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::ApplicationAbort)
    }

    /// true if the worker loops should stop
    pub fn stops_loops(&self) -> bool {
        self.is_terminated() || *self == ConnectionState::Suspended
    }

    /// true while received data is still processed and delivered
    pub fn is_receiving(&self) -> bool {
        matches!(self,
            ConnectionState::Established |
            ConnectionState::ShutdownPending |
            ConnectionState::ShutdownSent |
            ConnectionState::ShutdownReceived |
            ConnectionState::ShutdownAckSent)
    }
}

/// The lifecycle transitions of an established connection. Establishing the connection is the
///  handshake's business and happens before a `StateMachine` exists.
///
/// The current state is published through a `watch` channel so that the loops can wait for
///  changes. Chunks that must be sent in reply to lifecycle chunks are passed to the
///  transmitter through an mpsc channel.
pub struct StateMachine {
    state: watch::Sender<ConnectionState>,
    replies: mpsc::UnboundedSender<ChunkType>,
}

impl StateMachine {
    pub fn new(initial: ConnectionState) -> (StateMachine, mpsc::UnboundedReceiver<ChunkType>) {
        let (replies, replies_recv) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(initial);
        (StateMachine { state, replies }, replies_recv)
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                info!("connection state {} -> {}", state, to);
                *state = to;
                true
            }
            else {
                false
            }
        })
    }

    fn reply(&self, chunk_type: ChunkType) {
        if self.replies.send(chunk_type).is_err() {
            debug!("transmitter is gone - not replying with {:?}", chunk_type);
        }
    }

    /// Applies a lifecycle chunk received from the peer. Returns `true` if the state changed.
    pub fn process_chunk(&self, chunk_type: ChunkType) -> bool {
        use ConnectionState::*;

        match chunk_type {
            ChunkType::Shutdown => {
                if self.transition(&[Established, SuspendReceived], ShutdownReceived) {
                    return true;
                }
                // both sides closed at the same time
                if self.current() == ShutdownSent || self.current() == ShutdownPending {
                    self.reply(ChunkType::ShutdownAck);
                }
                false
            }
            ChunkType::ShutdownAck => {
                self.reply(ChunkType::ShutdownComplete);
                self.transition(&[ShutdownSent, ShutdownPending, ShutdownAckSent], Closed)
            }
            ChunkType::ShutdownComplete => {
                self.transition(&[ShutdownAckSent, ShutdownSent], Closed)
            }
            ChunkType::Abort => {
                self.transition(&[Established, SuspendReceived, ShutdownPending, ShutdownSent, ShutdownReceived, ShutdownAckSent], Closed)
            }
            ChunkType::Suspend | ChunkType::SimpleSuspend => {
                let reply = if chunk_type == ChunkType::Suspend { ChunkType::SuspendAck } else { ChunkType::SimpleSuspendAck };
                self.reply(reply);
                self.transition(&[Established], SuspendReceived)
            }
            ChunkType::Resume => {
                self.reply(ChunkType::ResumeAck);
                self.transition(&[SuspendReceived], Established)
            }
            other => {
                debug!("ignoring lifecycle chunk {:?} in state {}", other, self.current());
                false
            }
        }
    }

    /// The application closed the connection: flush, then shut down
    pub fn close(&self) -> bool {
        self.transition(&[ConnectionState::Established, ConnectionState::SuspendReceived], ConnectionState::ShutdownPending)
    }

    pub fn abort(&self) -> bool {
        let changed = self.transition(&[
            ConnectionState::Established,
            ConnectionState::SuspendReceived,
            ConnectionState::ShutdownPending,
            ConnectionState::ShutdownSent,
            ConnectionState::ShutdownReceived,
            ConnectionState::ShutdownAckSent,
        ], ConnectionState::ApplicationAbort);
        if changed {
            self.reply(ChunkType::Abort);
        }
        changed
    }

    pub fn suspend(&self) -> bool {
        self.transition(&[ConnectionState::Established, ConnectionState::SuspendReceived], ConnectionState::Suspended)
    }

    /// Called by the transmitter when all queued data was sent and acknowledged. Returns the
    ///  chunk type to send next, if any.
    pub fn outstanding_queue_flushed(&self) -> Option<ChunkType> {
        if self.transition(&[ConnectionState::ShutdownPending], ConnectionState::ShutdownSent) {
            return Some(ChunkType::Shutdown);
        }
        if self.transition(&[ConnectionState::ShutdownReceived], ConnectionState::ShutdownAckSent) {
            return Some(ChunkType::ShutdownAck);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ConnectionState::*;

    fn drain(replies: &mut mpsc::UnboundedReceiver<ChunkType>) -> Vec<ChunkType> {
        let mut result = Vec::new();
        while let Ok(chunk_type) = replies.try_recv() {
            result.push(chunk_type);
        }
        result
    }

    #[rstest]
    #[case::shutdown(Established, ChunkType::Shutdown, ShutdownReceived, vec![])]
    #[case::simultaneous_shutdown(ShutdownSent, ChunkType::Shutdown, ShutdownSent, vec![ChunkType::ShutdownAck])]
    #[case::shutdown_ack(ShutdownSent, ChunkType::ShutdownAck, Closed, vec![ChunkType::ShutdownComplete])]
    #[case::shutdown_complete(ShutdownAckSent, ChunkType::ShutdownComplete, Closed, vec![])]
    #[case::abort(Established, ChunkType::Abort, Closed, vec![])]
    #[case::suspend(Established, ChunkType::Suspend, SuspendReceived, vec![ChunkType::SuspendAck])]
    #[case::resume(SuspendReceived, ChunkType::Resume, Established, vec![ChunkType::ResumeAck])]
    #[case::resume_when_established(Established, ChunkType::Resume, Established, vec![ChunkType::ResumeAck])]
    #[case::init_ignored(Established, ChunkType::Init, Established, vec![])]
    fn test_process_chunk(#[case] initial: ConnectionState, #[case] chunk_type: ChunkType, #[case] expected: ConnectionState, #[case] expected_replies: Vec<ChunkType>) {
        let (state_machine, mut replies) = StateMachine::new(initial);
        let changed = state_machine.process_chunk(chunk_type);
        assert_eq!(state_machine.current(), expected);
        assert_eq!(changed, initial != expected);
        assert_eq!(drain(&mut replies), expected_replies);
    }

    #[test]
    fn test_local_close() {
        let (state_machine, mut replies) = StateMachine::new(Established);
        assert!(state_machine.close());
        assert!(!state_machine.close());
        assert_eq!(state_machine.current(), ShutdownPending);

        assert_eq!(state_machine.outstanding_queue_flushed(), Some(ChunkType::Shutdown));
        assert_eq!(state_machine.current(), ShutdownSent);
        assert_eq!(state_machine.outstanding_queue_flushed(), None);

        state_machine.process_chunk(ChunkType::ShutdownAck);
        assert_eq!(state_machine.current(), Closed);
        assert_eq!(drain(&mut replies), vec![ChunkType::ShutdownComplete]);
    }

    #[test]
    fn test_peer_close() {
        let (state_machine, _replies) = StateMachine::new(Established);
        state_machine.process_chunk(ChunkType::Shutdown);
        assert_eq!(state_machine.outstanding_queue_flushed(), Some(ChunkType::ShutdownAck));
        assert_eq!(state_machine.current(), ShutdownAckSent);
        state_machine.process_chunk(ChunkType::ShutdownComplete);
        assert!(state_machine.current().is_terminated());
    }

    #[test]
    fn test_abort() {
        let (state_machine, mut replies) = StateMachine::new(Established);
        assert!(state_machine.abort());
        assert_eq!(state_machine.current(), ApplicationAbort);
        assert!(!state_machine.abort());
        assert_eq!(drain(&mut replies), vec![ChunkType::Abort]);
        assert!(!state_machine.close());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let (state_machine, _replies) = StateMachine::new(Established);
        let mut subscriber = state_machine.subscribe();
        assert!(state_machine.suspend());
        subscriber.changed().await.unwrap();
        assert_eq!(*subscriber.borrow(), Suspended);
        assert!(subscriber.borrow().stops_loops());
    }
}
