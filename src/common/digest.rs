//! Deterministic content fingerprint used to derive ids from blobs.
//!
//! Not a cryptographic hash, collisions are tolerated. The procedure is fixed bit-for-bit
//! so that every node derives the same id for the same bytes.

use super::{Id, ID_SIZE};

/// Salt for inputs shorter than 16 bytes, laid out as little-endian words.
const SHORT_INPUT_SALT: [u32; 4] = [0xFFAB10FA, 0xA123ACDB, 0x7FACE134, 0xF0BC1724];
const MIN_INPUT_LEN: usize = 16;

const WORDS: usize = ID_SIZE / 4;

/// Minimal PCG32 (XSH-RR) generator.
#[derive(Debug, Clone)]
struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    const MULTIPLIER: u64 = 6364136223846793005;

    fn new(state: u64, inc: u64) -> Self {
        Self { state, inc }
    }

    fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old
            .wrapping_mul(Self::MULTIPLIER)
            .wrapping_add(self.inc | 1);

        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;

        xorshifted.rotate_right(rot)
    }
}

/// Compute the [Id] of a blob.
pub fn digest(bytes: &[u8]) -> Id {
    let salted;
    let input: &[u8] = if bytes.len() < MIN_INPUT_LEN {
        let mut buffer = [0u8; MIN_INPUT_LEN];
        for (i, word) in SHORT_INPUT_SALT.iter().enumerate() {
            buffer[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        buffer[..bytes.len()].copy_from_slice(bytes);
        salted = buffer;
        &salted
    } else {
        bytes
    };

    let tail = &input[input.len() - input.len() % 4..];
    let seed = tail
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | *byte as u64);

    let mut pcg = Pcg32::new(seed, 1);
    let mut words = [0u32; WORDS];

    mix(&mut words, &mut pcg);

    for group in input.chunks_exact(4) {
        let value = u32::from_le_bytes([group[0], group[1], group[2], group[3]]);
        pcg.state ^= value as u64;
        mix(&mut words, &mut pcg);
    }

    let mut out = [0u8; ID_SIZE];
    for (i, word) in words.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }

    Id::from(out)
}

fn mix(words: &mut [u32; WORDS], pcg: &mut Pcg32) {
    for word in words.iter_mut() {
        *word ^= pcg.next_u32();
    }
}

/// Default node id for a node listening on `port`.
pub fn port_id(port: u16) -> Id {
    digest(&(port as u32).to_le_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pcg32_reference_output() {
        // First outputs of pcg32 seeded with state 0 and increment 1.
        let mut pcg = Pcg32::new(0, 1);
        assert_eq!(pcg.next_u32(), 0);
        assert_eq!(pcg.state, 1);
        assert_eq!(pcg.next_u32(), 0);
        assert_eq!(pcg.state, 6364136223846793006);
    }

    #[test]
    fn deterministic() {
        let input = b"This a test #1";
        assert_eq!(digest(input), digest(input));

        let long = vec![7u8; 10_000];
        assert_eq!(digest(&long), digest(&long));
    }

    #[test]
    fn single_byte_change_changes_digest() {
        let original = b"the quick brown fox jumps over the lazy dog".to_vec();
        let reference = digest(&original);

        for i in 0..original.len() {
            let mut changed = original.clone();
            changed[i] ^= 0x01;
            assert_ne!(digest(&changed), reference, "byte {i}");
        }
    }

    #[test]
    fn short_inputs_are_salted() {
        assert_ne!(digest(b""), Id::MIN);
        assert_ne!(digest(b"a"), digest(b"b"));
        assert_ne!(digest(b"hello"), digest(b"hellp"));
    }

    #[test]
    fn trailing_bytes_seed_the_generator() {
        // Same 4-byte groups, different remainder.
        assert_ne!(
            digest(b"0123456789abcdef!"),
            digest(b"0123456789abcdef?")
        );
    }

    #[test]
    fn reference_vectors() {
        let vectors: [(&[u8], &str); 3] = [
            (b"hello", "EBF5536460E1E37D9F29AF30C1A0EDFA286D86F1"),
            (b"This a test #1", "D59E7CA1B63221F02C6AFA58D4622DD0FD26049F"),
            (b"0123456789abcdef!", "59E06DF840673E65E30D1AED2554DDACBD793BC7"),
        ];

        for (input, expected) in vectors {
            assert_eq!(digest(input).to_string(), expected);
        }

        assert_eq!(
            port_id(4000).to_string(),
            "35F09097FAD20B4F80B8C0B586A4ACB81AF6CD5E"
        );
    }

    #[test]
    fn port_ids_are_distinct() {
        assert_ne!(port_id(4000), port_id(4001));
        assert_eq!(port_id(4000), digest(&[0xA0, 0x0F, 0, 0]));
    }
}
