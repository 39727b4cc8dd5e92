use crate::chunk::TsnBlocks;
use crate::freeze::{get_marked_list, put_marked_list, Defroster, Freezer};
use crate::tsn::Tsn;
use anyhow::bail;
use std::collections::VecDeque;

/// A set of TSNs stored as ascending, disjoint and non-adjacent inclusive ranges
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TsnRanges {
    ranges: VecDeque<(Tsn, Tsn)>,
}

impl TsnRanges {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item=(Tsn, Tsn)> + '_ {
        self.ranges.iter().cloned()
    }

    pub fn contains(&self, tsn: Tsn) -> bool {
        self.ranges.iter()
            .any(|&(start, end)| start.is_before_or_eq(tsn) && tsn.is_before_or_eq(end))
    }

    /// Adds a TSN, merging it with adjacent ranges. Returns `false` if the TSN was present already.
    pub fn add(&mut self, tsn: Tsn) -> bool {
        // new TSNs are typically at or near the end
        let idx = self.ranges.iter()
            .rposition(|&(start, _)| start.is_before_or_eq(tsn))
            .map(|i| i + 1)
            .unwrap_or(0);

        if idx > 0 {
            let (_, prev_end) = self.ranges[idx - 1];
            if tsn.is_before_or_eq(prev_end) {
                return false;
            }
            if prev_end.next() == tsn {
                self.ranges[idx - 1].1 = tsn;
                if idx < self.ranges.len() && self.ranges[idx].0 == tsn.next() {
                    self.ranges[idx - 1].1 = self.ranges[idx].1;
                    self.ranges.remove(idx);
                }
                return true;
            }
        }

        if idx < self.ranges.len() && self.ranges[idx].0 == tsn.next() {
            self.ranges[idx].0 = tsn;
            return true;
        }

        self.ranges.insert(idx, (tsn, tsn));
        true
    }

    /// Removes every TSN up to and including `tsn`
    pub fn delete_up_to(&mut self, tsn: Tsn) {
        while let Some(&(start, end)) = self.ranges.front() {
            if end.is_before_or_eq(tsn) {
                self.ranges.pop_front();
            }
            else {
                if start.is_before_or_eq(tsn) {
                    self.ranges[0].0 = tsn.next();
                }
                break;
            }
        }
    }

    fn pop_front_if_starts_at(&mut self, tsn: Tsn) -> Option<(Tsn, Tsn)> {
        match self.ranges.front() {
            Some(&(start, _)) if start == tsn => self.ranges.pop_front(),
            _ => None,
        }
    }

    pub fn to_blocks(&self) -> TsnBlocks {
        let mut result = TsnBlocks::default();
        for (start, end) in self.iter() {
            result.push(start, end);
        }
        result
    }

    pub fn freeze(&self, freezer: &mut Freezer) {
        put_marked_list(freezer, self.iter(), |f, (start, end)| {
            f.put_tsn(start);
            f.put_tsn(end);
        });
    }

    pub fn defrost(defroster: &mut Defroster) -> anyhow::Result<TsnRanges> {
        let ranges = get_marked_list(defroster, |d| Ok((d.get_tsn()?, d.get_tsn()?)))?;
        for (i, &(start, end)) in ranges.iter().enumerate() {
            if end.is_before(start) {
                bail!("inverted TSN range #{}-#{} in frozen image", start, end);
            }
            if i > 0 && !ranges[i-1].1.next().is_before(start) {
                bail!("overlapping or adjacent TSN ranges in frozen image");
            }
        }
        Ok(TsnRanges { ranges: ranges.into() })
    }
}

/// Keeps track of the TSNs received on one flow: a cumulative TSN up to which everything was
///  received, and ranges of TSNs received beyond it
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedTsnTracker {
    cumulative: Tsn,
    ranges: TsnRanges,
}

impl ReceivedTsnTracker {
    /// `first_expected` is the first TSN the peer sends on this flow
    pub fn new(first_expected: Tsn) -> ReceivedTsnTracker {
        ReceivedTsnTracker {
            cumulative: first_expected.prev(),
            ranges: TsnRanges::default(),
        }
    }

    pub fn cumulative(&self) -> Tsn {
        self.cumulative
    }

    /// the received TSNs beyond the cumulative TSN
    pub fn ranges(&self) -> &TsnRanges {
        &self.ranges
    }

    pub fn already_received(&self, tsn: Tsn) -> bool {
        tsn.is_before_or_eq(self.cumulative) || self.ranges.contains(tsn)
    }

    /// Returns `false` if the TSN was received before
    pub fn add(&mut self, tsn: Tsn) -> bool {
        if tsn.is_before_or_eq(self.cumulative) {
            return false;
        }
        if !self.ranges.add(tsn) {
            return false;
        }
        if let Some((_, end)) = self.ranges.pop_front_if_starts_at(self.cumulative.next()) {
            self.cumulative = end;
        }
        true
    }

    pub fn freeze(&self, freezer: &mut Freezer) {
        freezer.put_tsn(self.cumulative);
        self.ranges.freeze(freezer);
    }

    pub fn defrost(defroster: &mut Defroster) -> anyhow::Result<ReceivedTsnTracker> {
        let cumulative = defroster.get_tsn()?;
        let ranges = TsnRanges::defrost(defroster)?;
        if let Some((start, _)) = ranges.iter().next() {
            if !cumulative.next().is_before(start) {
                bail!("received TSN range #{} is not beyond the cumulative TSN #{}", start, cumulative);
            }
        }
        Ok(ReceivedTsnTracker { cumulative, ranges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::time::Instant;

    fn tsn(raw: u32) -> Tsn {
        Tsn::from_raw(raw)
    }

    fn ranges_of(raw: &[u32]) -> TsnRanges {
        let mut result = TsnRanges::default();
        for &t in raw {
            result.add(tsn(t));
        }
        result
    }

    fn as_raw(ranges: &TsnRanges) -> Vec<(u32, u32)> {
        ranges.iter().map(|(s, e)| (s.to_raw(), e.to_raw())).collect()
    }

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![5], vec![(5, 5)])]
    #[case::append(vec![5, 6, 7], vec![(5, 7)])]
    #[case::prepend(vec![7, 6, 5], vec![(5, 7)])]
    #[case::gap(vec![5, 7], vec![(5, 5), (7, 7)])]
    #[case::fill_gap(vec![5, 7, 6], vec![(5, 7)])]
    #[case::insert_front(vec![10, 3], vec![(3, 3), (10, 10)])]
    #[case::insert_middle(vec![1, 10, 5], vec![(1, 1), (5, 5), (10, 10)])]
    #[case::duplicate(vec![5, 6, 5], vec![(5, 6)])]
    #[case::wrap(vec![u32::MAX, 0, 1], vec![(u32::MAX, 1)])]
    fn test_add(#[case] added: Vec<u32>, #[case] expected: Vec<(u32, u32)>) {
        assert_eq!(as_raw(&ranges_of(&added)), expected);
    }

    #[test]
    fn test_add_reports_duplicates() {
        let mut ranges = ranges_of(&[3, 4, 8]);
        assert!(!ranges.add(tsn(4)));
        assert!(!ranges.add(tsn(8)));
        assert!(ranges.add(tsn(6)));
        assert!(ranges.contains(tsn(6)));
        assert!(!ranges.contains(tsn(5)));
    }

    #[rstest]
    #[case::nothing(vec![5, 6, 9], 2, vec![(5, 6), (9, 9)])]
    #[case::first_range(vec![5, 6, 9], 6, vec![(9, 9)])]
    #[case::inside_range(vec![5, 6, 7, 9], 5, vec![(6, 7), (9, 9)])]
    #[case::everything(vec![5, 6, 9], 20, vec![])]
    fn test_delete_up_to(#[case] added: Vec<u32>, #[case] up_to: u32, #[case] expected: Vec<(u32, u32)>) {
        let mut ranges = ranges_of(&added);
        ranges.delete_up_to(tsn(up_to));
        assert_eq!(as_raw(&ranges), expected);
    }

    #[test]
    fn test_to_blocks() {
        let blocks = ranges_of(&[1, 2, 3, 7, 9, 10]).to_blocks();
        assert_eq!(blocks.ranges, vec![(tsn(1), tsn(3)), (tsn(9), tsn(10))]);
        assert_eq!(blocks.singles, vec![tsn(7)]);
    }

    #[test]
    fn test_received_tracker() {
        let mut tracker = ReceivedTsnTracker::new(tsn(1));
        assert_eq!(tracker.cumulative(), tsn(0));
        assert!(!tracker.already_received(tsn(1)));

        assert!(tracker.add(tsn(2)));
        assert_eq!(tracker.cumulative(), tsn(0));
        assert!(tracker.already_received(tsn(2)));

        assert!(tracker.add(tsn(1)));
        assert_eq!(tracker.cumulative(), tsn(2));
        assert!(tracker.ranges().is_empty());

        assert!(tracker.add(tsn(5)));
        assert!(!tracker.add(tsn(5)));
        assert!(!tracker.add(tsn(1)));
        assert_eq!(as_raw(tracker.ranges()), vec![(5, 5)]);

        assert!(tracker.add(tsn(3)));
        assert!(tracker.add(tsn(4)));
        assert_eq!(tracker.cumulative(), tsn(5));
        assert!(tracker.ranges().is_empty());
    }

    #[test]
    fn test_received_tracker_starting_at_zero() {
        let mut tracker = ReceivedTsnTracker::new(tsn(0));
        assert!(!tracker.already_received(tsn(0)));
        assert!(tracker.add(tsn(0)));
        assert!(tracker.already_received(tsn(0)));
        assert_eq!(tracker.cumulative(), tsn(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_defrost() {
        let mut tracker = ReceivedTsnTracker::new(tsn(10));
        for t in [10, 11, 14, 15, 18] {
            tracker.add(tsn(t));
        }

        let mut freezer = Freezer::new(Instant::now());
        tracker.freeze(&mut freezer);
        let image = freezer.finish();

        let mut defroster = Defroster::new(image, Instant::now()).unwrap();
        assert_eq!(ReceivedTsnTracker::defrost(&mut defroster).unwrap(), tracker);
        defroster.finish().unwrap();
    }
}
