pub mod env;
pub mod telemetry;

use subtle::ConstantTimeEq;
use tinyrand::{Rand, RandRange, Seeded, StdRand};
use tinyrand_std::clock_seed::ClockSeed;

/// Performs `&str` comparisons in constant time in an attempt to close any and all side-channels
/// that might leak information about our keys. Length is the only thing an attacker can learn.
pub fn constant_time_cmp(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Uniform jitter in `0..max`, used to spread out storage retries.
pub fn jitter(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }

    let seed = ClockSeed::default().next_u64();
    let mut rng = StdRand::seed(seed);

    rng.next_range(0..max)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_const_time_cmp() {
        let expects = "test_string";
        let passing = "test_string";

        let bad_start = "__st_string";
        let bad_end = "test_str___";

        let short = "test_strin";
        let long = "test_string_";

        assert!(constant_time_cmp(expects, passing));
        assert!(!constant_time_cmp(expects, bad_start));
        assert!(!constant_time_cmp(expects, bad_end));
        assert!(!constant_time_cmp(expects, short));
        assert!(!constant_time_cmp(expects, long));
    }

    #[test]
    fn test_jitter_bounds() {
        assert_eq!(jitter(0), 0);
        for _ in 0..64 {
            assert!(jitter(50) < 50);
        }
    }
}
