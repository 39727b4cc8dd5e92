use crate::freeze::{Defroster, Freezer};
use crate::packet_wrapper::PacketWrapper;
use crate::tsn::Tsn;
use anyhow::bail;
use std::collections::VecDeque;
use tracing::trace;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// the TSN is below the queue's floor, i.e. it was delivered or skipped already
    Stale,
    Duplicate,
}

/// Receive-side queue for one sequenced traffic class. Entries are ordered by TSN, and the floor
///  is the next TSN the class expects to deliver.
///
/// NB: All entries are at or above the floor, so their order relative to the floor is well
///      defined even when TSNs wrap around.
#[derive(Debug)]
pub struct SequencedPacketQueue {
    floor: Tsn,
    entries: VecDeque<PacketWrapper>,
    queued_bytes: usize,
}

impl SequencedPacketQueue {
    pub fn new(floor: Tsn) -> SequencedPacketQueue {
        SequencedPacketQueue {
            floor,
            entries: VecDeque::new(),
            queued_bytes: 0,
        }
    }

    pub fn floor(&self) -> Tsn {
        self.floor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    fn offset(&self, tsn: Tsn) -> u32 {
        self.floor.distance_to(tsn)
    }

    pub fn insert(&mut self, wrapper: PacketWrapper) -> InsertOutcome {
        let tsn = wrapper.tsn();
        if tsn.is_before(self.floor) {
            return InsertOutcome::Stale;
        }
        let offset = self.offset(tsn);

        // packets mostly arrive in order, so the new entry usually goes at the back
        let idx = match self.entries.back() {
            None => 0,
            Some(last) if self.offset(last.tsn()) < offset => self.entries.len(),
            _ => {
                match self.entries.iter().rposition(|e| self.offset(e.tsn()) <= offset) {
                    Some(i) if self.entries[i].tsn() == tsn => return InsertOutcome::Duplicate,
                    Some(i) => i + 1,
                    None => 0,
                }
            }
        };

        trace!("inserting #{} at position {} of {}", tsn, idx, self.entries.len());
        self.queued_bytes += wrapper.size();
        self.entries.insert(idx, wrapper);
        InsertOutcome::Inserted
    }

    /// true if an entry for the TSN would be inserted, i.e. it is neither stale nor present
    pub fn can_insert(&self, tsn: Tsn) -> bool {
        if tsn.is_before(self.floor) {
            return false;
        }
        !self.entries.iter().any(|e| e.tsn() == tsn)
    }

    /// the entry with the lowest TSN
    pub fn peek(&self) -> Option<&PacketWrapper> {
        self.entries.front()
    }

    pub fn remove(&mut self, tsn: Tsn) -> Option<PacketWrapper> {
        let idx = self.entries.iter().position(|e| e.tsn() == tsn)?;
        let removed = self.entries.remove(idx)?;
        self.queued_bytes -= removed.size();
        Some(removed)
    }

    /// Raises the floor and drops all entries below the new floor, returning the number of dropped
    ///  entries. A floor below the current floor is ignored.
    pub fn advance_floor(&mut self, new_floor: Tsn) -> usize {
        if new_floor.is_before(self.floor) {
            return 0;
        }
        self.floor = new_floor;

        let mut num_evicted = 0;
        while let Some(first) = self.entries.front() {
            if !first.tsn().is_before(new_floor) {
                break;
            }
            if let Some(evicted) = self.entries.pop_front() {
                trace!("evicting #{} below the new floor #{}", evicted.tsn(), new_floor);
                self.queued_bytes -= evicted.size();
                num_evicted += 1;
            }
        }
        num_evicted
    }

    pub fn freeze(&self, freezer: &mut Freezer) {
        freezer.put_tsn(self.floor);
        freezer.put_len(self.entries.len());
        for entry in &self.entries {
            entry.freeze(freezer);
        }
    }

    pub fn defrost(defroster: &mut Defroster) -> anyhow::Result<SequencedPacketQueue> {
        let mut result = SequencedPacketQueue::new(defroster.get_tsn()?);
        for _ in 0..defroster.get_len()? {
            let entry = PacketWrapper::defrost(defroster)?;
            let tsn = entry.tsn();
            if result.insert(entry) != InsertOutcome::Inserted {
                bail!("frozen sequenced queue contains stale or duplicate TSN #{}", tsn);
            }
        }
        Ok(result)
    }
}
