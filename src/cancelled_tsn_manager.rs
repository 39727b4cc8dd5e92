use crate::chunk::{CancelledChunk, SAckChunk};
use crate::freeze::{Defroster, Freezer};
use crate::packet::TrafficClass;
use crate::tsn::Tsn;
use crate::tsn_range::TsnRanges;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// TSNs that this side gave up on and announces to the peer as cancelled, so the peer's
///  delivery can move past them.
///
/// Entries for reliable flows are announced repeatedly until the peer's cumulative ack passes
///  them. Unreliable sequenced entries are never acknowledged, so they are announced only once.
#[derive(Debug, Default)]
pub struct CancelledTsnManager {
    reliable_sequenced: TsnRanges,
    reliable_unsequenced: TsnRanges,
    unreliable_sequenced: TsnRanges,
    pending_since: Option<Instant>,
    last_sent: Option<Instant>,
}

impl CancelledTsnManager {
    pub fn cancel(&mut self, class: TrafficClass, tsn: Tsn, now: Instant) {
        let ranges = match class {
            TrafficClass::ReliableSequenced => &mut self.reliable_sequenced,
            TrafficClass::ReliableUnsequenced => &mut self.reliable_unsequenced,
            TrafficClass::UnreliableSequenced => &mut self.unreliable_sequenced,
            other => {
                debug!("{} packets can not be cancelled - ignoring #{}", other, tsn);
                return;
            }
        };
        if ranges.add(tsn) {
            trace!("cancelled {} #{}", class, tsn);
            self.pending_since.get_or_insert(now);
        }
    }

    pub fn has_information(&self) -> bool {
        !(self.reliable_sequenced.is_empty() && self.reliable_unsequenced.is_empty() && self.unreliable_sequenced.is_empty())
    }

    /// the time at which cancelled TSNs should be announced in a standalone packet
    pub fn standalone_due_at(&self, transmit_interval: Duration) -> Option<Instant> {
        if !self.has_information() {
            return None;
        }
        match (self.last_sent, self.pending_since) {
            (Some(sent), _) => Some(sent + transmit_interval),
            (None, since) => since,
        }
    }

    pub fn cancelled_chunk(&self) -> Option<CancelledChunk> {
        if !self.has_information() {
            return None;
        }
        Some(CancelledChunk {
            reliable_sequenced: self.reliable_sequenced.to_blocks(),
            reliable_unsequenced: self.reliable_unsequenced.to_blocks(),
            unreliable_sequenced: self.unreliable_sequenced.to_blocks(),
        })
    }

    pub fn chunk_sent(&mut self, now: Instant) {
        self.unreliable_sequenced = TsnRanges::default();
        self.last_sent = Some(now);
        if !self.has_information() {
            self.pending_since = None;
        }
    }

    /// Drops the entries the peer acknowledged cumulatively
    pub fn on_sack(&mut self, sack: &SAckChunk) {
        self.reliable_sequenced.delete_up_to(sack.reliable_sequenced_cumulative);
        self.reliable_unsequenced.delete_up_to(sack.reliable_unsequenced_cumulative);
        if !self.has_information() {
            self.pending_since = None;
        }
    }

    pub fn freeze(&self, freezer: &mut Freezer) {
        self.reliable_sequenced.freeze(freezer);
        self.reliable_unsequenced.freeze(freezer);
        self.unreliable_sequenced.freeze(freezer);
    }

    pub fn defrost(defroster: &mut Defroster) -> anyhow::Result<CancelledTsnManager> {
        let mut result = CancelledTsnManager {
            reliable_sequenced: TsnRanges::defrost(defroster)?,
            reliable_unsequenced: TsnRanges::defrost(defroster)?,
            unreliable_sequenced: TsnRanges::defrost(defroster)?,
            pending_since: None,
            last_sent: None,
        };
        if result.has_information() {
            result.pending_since = Some(defroster.now());
        }
        Ok(result)
    }
}
