use std::fmt::{Display, Formatter};
use anyhow::bail;

/// Marks an acknowledgement in place of a sequence number. Sequence numbers skip this value
///  when they wrap around, so data and acks can not be confused.
pub const ACK_SENTINEL: u16 = 0xFFFF;

/// number of distinct sequence numbers
const MODULUS: u32 = ACK_SENTINEL as u32;

/// Sequence numbers less than this far 'ahead' are treated as new, everything else as already
///  seen.
const HALF_WINDOW: u16 = (MODULUS / 2) as u16;

/// The sequence number of a reliable channel's envelope. Valid values are `0..=0xFFFE`, and
///  `next()` wraps from `0xFFFE` to `0`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequenceNumber(u16);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u16) -> anyhow::Result<SequenceNumber> {
        if value == ACK_SENTINEL {
            bail!("{:#x} is reserved for acks and not a valid sequence number", value);
        }
        Ok(SequenceNumber(value))
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        if self.0 == ACK_SENTINEL - 1 {
            SequenceNumber(0)
        }
        else {
            SequenceNumber(self.0 + 1)
        }
    }

    /// the number of `next()` steps it takes to get from `self` to `other`
    pub fn distance_to(&self, other: SequenceNumber) -> u16 {
        ((other.0 as u32 + MODULUS - self.0 as u32) % MODULUS) as u16
    }

    /// Interprets `self` as the next expected sequence number on the receiving side, and checks if
    ///  `other` lies behind it. Since sequence numbers wrap, 'behind' means 'less than half the
    ///  number space away in the backwards direction'.
    pub fn is_already_passed(&self, other: SequenceNumber) -> bool {
        self.distance_to(other) >= HALF_WINDOW
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 1)]
    #[case::regular(1234, 1235)]
    #[case::before_wrap(0xFFFD, 0xFFFE)]
    #[case::wrap(0xFFFE, 0)]
    fn test_next(#[case] raw: u16, #[case] expected: u16) {
        assert_eq!(SequenceNumber::from_raw(raw).unwrap().next().to_raw(), expected);
    }

    #[test]
    fn test_sentinel_is_not_a_sequence_number() {
        assert!(SequenceNumber::from_raw(ACK_SENTINEL).is_err());
    }

    #[rstest]
    #[case::same(5, 5, 0)]
    #[case::ahead(5, 8, 3)]
    #[case::across_wrap(0xFFFD, 1, 3)]
    #[case::behind(5, 4, 0xFFFE)]
    fn test_distance(#[case] from: u16, #[case] to: u16, #[case] expected: u16) {
        let from = SequenceNumber::from_raw(from).unwrap();
        let to = SequenceNumber::from_raw(to).unwrap();
        assert_eq!(from.distance_to(to), expected);
    }

    #[rstest]
    #[case::expected_itself(10, 10, false)]
    #[case::ahead(10, 11, false)]
    #[case::just_behind(10, 9, true)]
    #[case::behind_across_wrap(2, 0xFFFE, true)]
    #[case::ahead_across_wrap(0xFFFE, 3, false)]
    #[case::far_ahead(0, 0x7FFE, false)]
    #[case::half_window(0, 0x7FFF, true)]
    fn test_is_already_passed(#[case] expected: u16, #[case] received: u16, #[case] passed: bool) {
        let expected = SequenceNumber::from_raw(expected).unwrap();
        let received = SequenceNumber::from_raw(received).unwrap();
        assert_eq!(expected.is_already_passed(received), passed);
    }
}
