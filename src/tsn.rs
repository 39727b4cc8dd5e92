use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::Add;

/// A transmission sequence number. TSNs are assigned per traffic class and wrap around at 2^32,
///  so they are compared with sequential arithmetic: `a` is before `b` if `b` can be reached from
///  `a` by moving forward less than half the number space.
///
/// NB: Sequential comparison is not transitive across the whole number space, which is why
///      `Tsn` deliberately does not implement `Ord` / `PartialOrd`. Code that sorts TSNs must do so
///      relative to a reference point (e.g. a queue's floor) or by pairwise comparison of values
///      known to be close together.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Tsn(u32);

impl Display for Tsn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Tsn {
    pub const ZERO: Tsn = Tsn(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Tsn {
        Tsn(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> Tsn {
        Tsn(self.0.wrapping_sub(1))
    }

    pub fn seq_cmp(&self, other: Tsn) -> Ordering {
        if self.0 == other.0 {
            Ordering::Equal
        }
        else if (other.0.wrapping_sub(self.0) as i32) > 0 {
            Ordering::Less
        }
        else {
            Ordering::Greater
        }
    }

    pub fn is_before(&self, other: Tsn) -> bool {
        self.seq_cmp(other) == Ordering::Less
    }

    pub fn is_before_or_eq(&self, other: Tsn) -> bool {
        self.seq_cmp(other) != Ordering::Greater
    }

    pub fn is_after(&self, other: Tsn) -> bool {
        self.seq_cmp(other) == Ordering::Greater
    }

    pub fn is_after_or_eq(&self, other: Tsn) -> bool {
        self.seq_cmp(other) != Ordering::Less
    }

    /// the number of steps needed to get from `self` forward to `later`
    pub fn distance_to(&self, later: Tsn) -> u32 {
        later.0.wrapping_sub(self.0)
    }
}

impl Add<u32> for Tsn {
    type Output = Tsn;

    fn add(self, rhs: u32) -> Self::Output {
        Tsn(self.0.wrapping_add(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::equal(5, 5, Ordering::Equal)]
    #[case::less(3, 5, Ordering::Less)]
    #[case::greater(5, 3, Ordering::Greater)]
    #[case::wrap_less(u32::MAX, 0, Ordering::Less)]
    #[case::wrap_greater(0, u32::MAX, Ordering::Greater)]
    #[case::wrap_far(u32::MAX - 10, 20, Ordering::Less)]
    #[case::half_space(0, 0x7fff_ffff, Ordering::Less)]
    #[case::beyond_half_space(0, 0x8000_0001, Ordering::Greater)]
    fn test_seq_cmp(#[case] a: u32, #[case] b: u32, #[case] expected: Ordering) {
        let a = Tsn::from_raw(a);
        let b = Tsn::from_raw(b);
        assert_eq!(a.seq_cmp(b), expected);
        assert_eq!(a.is_before(b), expected == Ordering::Less);
        assert_eq!(a.is_after(b), expected == Ordering::Greater);
        assert_eq!(a.is_before_or_eq(b), expected != Ordering::Greater);
        assert_eq!(a.is_after_or_eq(b), expected != Ordering::Less);
    }

    #[rstest]
    #[case::regular(7, 8)]
    #[case::wrap(u32::MAX, 0)]
    fn test_next_prev(#[case] tsn: u32, #[case] expected_next: u32) {
        let tsn = Tsn::from_raw(tsn);
        assert_eq!(tsn.next(), Tsn::from_raw(expected_next));
        assert_eq!(tsn.next().prev(), tsn);
        assert_eq!(tsn + 1, tsn.next());
    }

    #[rstest]
    #[case::zero(5, 5, 0)]
    #[case::regular(5, 9, 4)]
    #[case::wrap(u32::MAX - 1, 2, 4)]
    fn test_distance_to(#[case] from: u32, #[case] to: u32, #[case] expected: u32) {
        assert_eq!(Tsn::from_raw(from).distance_to(Tsn::from_raw(to)), expected);
    }
}
