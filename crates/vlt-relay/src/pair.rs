//! Pair-code generation for the Relay pairing flow.

use rand::Rng;

/// A–Z and 2–9 minus the look-alikes I, O, 0, 1.
pub const PAIR_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const PAIR_CODE_LEN: usize = 8;

pub fn generate_pair_code() -> String {
    let mut rng = rand::thread_rng();
    (0..PAIR_CODE_LEN)
        .map(|_| PAIR_CODE_ALPHABET[rng.gen_range(0..PAIR_CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphabet_excludes_look_alikes() {
        assert_eq!(PAIR_CODE_ALPHABET.len(), 32);
        for c in [b'I', b'O', b'0', b'1'] {
            assert!(!PAIR_CODE_ALPHABET.contains(&c));
        }
    }

    #[test]
    fn codes_are_eight_chars_from_the_alphabet() {
        for _ in 0..200 {
            let code = generate_pair_code();
            assert_eq!(code.len(), PAIR_CODE_LEN);
            assert!(code.bytes().all(|b| PAIR_CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn codes_vary() {
        let a = generate_pair_code();
        let b = generate_pair_code();
        let c = generate_pair_code();
        // Three identical 8-char draws from a 32-symbol alphabet would be
        // a broken RNG, not bad luck.
        assert!(!(a == b && b == c));
    }
}
