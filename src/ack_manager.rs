use crate::chunk::SAckChunk;
use crate::config::InitialTsns;
use crate::freeze::{Defroster, Freezer};
use crate::packet::TrafficClass;
use crate::tsn::Tsn;
use crate::tsn_range::ReceivedTsnTracker;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Keeps track of the reliable packets received from the peer, and of when the peer needs to
///  be told about them
#[derive(Debug)]
pub struct AckManager {
    control: ReceivedTsnTracker,
    reliable_sequenced: ReceivedTsnTracker,
    reliable_unsequenced: ReceivedTsnTracker,
    /// the time of the first change that was not acknowledged to the peer yet
    unsent_change_since: Option<Instant>,
    sack_requested_at: Option<Instant>,
    last_sack_sent: Option<Instant>,
}

impl AckManager {
    pub fn new(remote_initial_tsns: &InitialTsns) -> AckManager {
        AckManager {
            control: ReceivedTsnTracker::new(remote_initial_tsns.control),
            reliable_sequenced: ReceivedTsnTracker::new(remote_initial_tsns.reliable_sequenced),
            reliable_unsequenced: ReceivedTsnTracker::new(remote_initial_tsns.reliable_unsequenced),
            unsent_change_since: None,
            sack_requested_at: None,
            last_sack_sent: None,
        }
    }

    fn tracker_mut(&mut self, class: TrafficClass) -> Option<&mut ReceivedTsnTracker> {
        match class {
            TrafficClass::Control => Some(&mut self.control),
            TrafficClass::ReliableSequenced => Some(&mut self.reliable_sequenced),
            TrafficClass::ReliableUnsequenced => Some(&mut self.reliable_unsequenced),
            _ => None,
        }
    }

    /// Registers a received TSN of a reliable class. Returns `false` if it was received before,
    ///  and for unreliable classes which are not acknowledged.
    pub fn received(&mut self, class: TrafficClass, tsn: Tsn, now: Instant) -> bool {
        let is_new = match self.tracker_mut(class) {
            Some(tracker) => tracker.add(tsn),
            None => return false,
        };
        if is_new {
            trace!("registered {} #{} for acknowledgement", class, tsn);
            self.unsent_change_since.get_or_insert(now);
        }
        is_new
    }

    pub fn already_received(&self, class: TrafficClass, tsn: Tsn) -> bool {
        match class {
            TrafficClass::Control => self.control.already_received(tsn),
            TrafficClass::ReliableSequenced => self.reliable_sequenced.already_received(tsn),
            TrafficClass::ReliableUnsequenced => self.reliable_unsequenced.already_received(tsn),
            _ => false,
        }
    }

    /// Asks for a SAck to be sent as soon as possible, e.g. because the peer retransmitted a
    ///  packet that was acknowledged before
    pub fn request_sack(&mut self, now: Instant) {
        self.sack_requested_at.get_or_insert(now);
    }

    /// true if the next outgoing packet should carry a SAck chunk
    pub fn has_news(&self) -> bool {
        self.unsent_change_since.is_some() || self.sack_requested_at.is_some()
    }

    /// The time at which a standalone SAck packet is due if no other packet carries a SAck before
    ///  then, or `None` if there is nothing to acknowledge
    pub fn standalone_sack_due_at(&self, sack_transmit_timeout: Duration) -> Option<Instant> {
        let by_change = self.unsent_change_since.map(|changed| match self.last_sack_sent {
            Some(sent) => changed.max(sent + sack_transmit_timeout),
            None => changed,
        });
        match (by_change, self.sack_requested_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn sack_chunk(&self) -> SAckChunk {
        SAckChunk {
            control_cumulative: self.control.cumulative(),
            reliable_sequenced_cumulative: self.reliable_sequenced.cumulative(),
            reliable_unsequenced_cumulative: self.reliable_unsequenced.cumulative(),
            control: self.control.ranges().to_blocks(),
            reliable_sequenced: self.reliable_sequenced.ranges().to_blocks(),
            reliable_unsequenced: self.reliable_unsequenced.ranges().to_blocks(),
        }
    }

    pub fn sack_sent(&mut self, now: Instant) {
        self.unsent_change_since = None;
        self.sack_requested_at = None;
        self.last_sack_sent = Some(now);
    }

    pub fn freeze(&self, freezer: &mut Freezer) {
        self.control.freeze(freezer);
        self.reliable_sequenced.freeze(freezer);
        self.reliable_unsequenced.freeze(freezer);
    }

    /// The peer may have missed acknowledgements while the connection was frozen, so a defrosted
    ///  manager starts out with a SAck request.
    pub fn defrost(defroster: &mut Defroster) -> anyhow::Result<AckManager> {
        Ok(AckManager {
            control: ReceivedTsnTracker::defrost(defroster)?,
            reliable_sequenced: ReceivedTsnTracker::defrost(defroster)?,
            reliable_unsequenced: ReceivedTsnTracker::defrost(defroster)?,
            unsent_change_since: None,
            sack_requested_at: Some(defroster.now()),
            last_sack_sent: None,
        })
    }
}
