//! Kademlia node Id or a lookup target
use rand::Rng;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Default)]
/// Kademlia node Id or a lookup target.
///
/// Ordering is the unsigned big-endian (byte-wise lexicographic) order of the 160-bit value.
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// The all-zero identifier, lower bound of the id space.
    pub const MIN: Id = Id([0x00; ID_SIZE]);
    /// The all-ones identifier, upper bound of the id space.
    pub const MAX: Id = Id([0xFF; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// XOR distance between this Id and a target Id.
    ///
    /// Distances compare with the same ordering as ids, smaller is closer.
    pub fn distance(&self, other: &Id) -> Id {
        let mut out = [0; ID_SIZE];

        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(out)
    }

    /// Strict unsigned less-than.
    pub fn less(&self, other: &Id) -> bool {
        self < other
    }

    /// Returns `true` if this id lies in the half-open interval `[min, max)`.
    pub fn in_range(&self, min: &Id, max: &Id) -> bool {
        self.less(max) && (min.less(self) || min == self)
    }

    /// Exact integer bisection `min + (max - min) / 2` over the full 160 bits.
    ///
    /// For any `min < max` the result satisfies `min <= mid < max`.
    pub fn midpoint(min: &Id, max: &Id) -> Id {
        let mut split = [0u8; ID_SIZE];

        // max - min, as max + !min + 1
        let mut carry = 1u16;
        for i in (0..ID_SIZE).rev() {
            let sum = max.0[i] as u16 + (!min.0[i]) as u16 + carry;
            split[i] = sum as u8;
            carry = sum >> 8;
        }

        // halve
        let mut low_bit = 0u8;
        for byte in split.iter_mut() {
            let current = *byte;
            *byte = (low_bit << 7) | (current >> 1);
            low_bit = current & 1;
        }

        // + min
        let mut carry = 0u16;
        for i in (0..ID_SIZE).rev() {
            let sum = split[i] as u16 + min.0[i] as u16 + carry;
            split[i] = sum as u8;
            carry = sum >> 8;
        }

        Id(split)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Id(bytes)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let mut bytes = [0u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_to_self() {
        let id = Id::random();
        assert_eq!(id.distance(&id), Id::MIN);
    }

    #[test]
    fn distance_is_symmetric() {
        for _ in 0..100 {
            let a = Id::random();
            let b = Id::random();

            assert_eq!(a.distance(&b), b.distance(&a));
        }
    }

    #[test]
    fn ordering_is_big_endian() {
        let mut low = [0u8; ID_SIZE];
        low[ID_SIZE - 1] = 0xFF;
        let mut high = [0u8; ID_SIZE];
        high[0] = 0x01;

        assert!(Id(low).less(&Id(high)));
        assert!(!Id(high).less(&Id(low)));
        assert!(!Id(low).less(&Id(low)));
    }

    #[test]
    fn in_range_is_half_open() {
        let min = Id::from_str("1000000000000000000000000000000000000000").unwrap();
        let max = Id::from_str("2000000000000000000000000000000000000000").unwrap();
        let inside = Id::from_str("1fffffffffffffffffffffffffffffffffffffff").unwrap();

        assert!(min.in_range(&min, &max));
        assert!(inside.in_range(&min, &max));
        assert!(!max.in_range(&min, &max));
        assert!(!Id::MIN.in_range(&min, &max));
    }

    #[test]
    fn midpoint_of_full_space() {
        let mid = Id::midpoint(&Id::MIN, &Id::MAX);
        assert_eq!(
            mid,
            Id::from_str("7fffffffffffffffffffffffffffffffffffffff").unwrap()
        );
    }

    #[test]
    fn midpoint_carries_across_bytes() {
        let min = Id::from_str("00000000000000000000000000000000000000ff").unwrap();
        let max = Id::from_str("0000000000000000000000000000000000000201").unwrap();

        assert_eq!(
            Id::midpoint(&min, &max),
            Id::from_str("0000000000000000000000000000000000000180").unwrap()
        );
    }

    #[test]
    fn midpoint_of_adjacent_ids() {
        let min = Id::from_str("00000000000000000000000000000000000000fe").unwrap();
        let max = Id::from_str("00000000000000000000000000000000000000ff").unwrap();

        assert_eq!(Id::midpoint(&min, &max), min);
    }

    #[test]
    fn midpoint_partitions_range() {
        for _ in 0..200 {
            let a = Id::random();
            let b = Id::random();
            if a == b {
                continue;
            }
            let (min, max) = if a < b { (a, b) } else { (b, a) };

            let mid = Id::midpoint(&min, &max);
            assert!(min <= mid && mid < max);

            let probe = Id::random();
            if probe.in_range(&min, &max) {
                assert!(probe.in_range(&min, &mid) ^ probe.in_range(&mid, &max));
            } else {
                assert!(!probe.in_range(&min, &mid) && !probe.in_range(&mid, &max));
            }
        }
    }

    #[test]
    fn repeated_bisection_converges_on_max() {
        let mut min = Id::MIN;
        for _ in 0..160 {
            let mid = Id::midpoint(&min, &Id::MAX);
            assert!(min <= mid);
            min = mid;
        }
        assert_eq!(
            min,
            Id::from_str("fffffffffffffffffffffffffffffffffffffffe").unwrap()
        );
    }

    #[test]
    fn from_str_rejects_bad_input() {
        assert!(matches!(
            Id::from_str("abc"),
            Err(Error::InvalidIdEncoding(_))
        ));
        assert!(matches!(
            Id::from_str("zz00000000000000000000000000000000000000"),
            Err(Error::InvalidIdEncoding(_))
        ));
        assert!(matches!(Id::from_bytes([0u8; 3]), Err(Error::InvalidIdSize(3))));
    }

    #[test]
    fn display_round_trips() {
        let id = Id::random();
        assert_eq!(Id::from_str(&id.to_string()).unwrap(), id);
    }
}
