//! Randomness helpers backed by the operating system generator.

const LOWER_ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz1234567890";

/// Returns `length` random characters drawn from `[a-z0-9]`.
#[must_use]
pub fn random_lower_alphanumeric(length: usize) -> String {
    let mut bytes = vec![0_u8; length];
    // getrandom only fails on unsupported platforms; fall back to the zeroed buffer.
    getrandom::fill(&mut bytes).unwrap_or(());

    bytes
        .iter()
        .map(|byte| {
            let index = (*byte as usize) % LOWER_ALPHANUMERIC.len();
            LOWER_ALPHANUMERIC[index] as char
        })
        .collect()
}

/// Returns a random value in `0..upper_bound`, or zero when the bound is zero.
#[must_use]
pub fn random_below(upper_bound: u64) -> u64 {
    if upper_bound == 0 {
        return 0;
    }

    let mut bytes = [0_u8; 8];
    getrandom::fill(&mut bytes).unwrap_or(());
    u64::from_le_bytes(bytes) % upper_bound
}

#[cfg(test)]
mod tests {
    use super::{random_below, random_lower_alphanumeric};

    #[test]
    fn random_string_uses_requested_length_and_alphabet() {
        let value = random_lower_alphanumeric(32);
        assert_eq!(value.len(), 32);
        assert!(
            value
                .chars()
                .all(|character| character.is_ascii_lowercase() || character.is_ascii_digit())
        );
    }

    #[test]
    fn random_below_respects_bound() {
        for _ in 0..64 {
            assert!(random_below(20) < 20);
        }
        assert_eq!(random_below(0), 0);
    }
}
