//! cgroup CPU weight conversions

/// Smallest CPU shares value the kernel accepts.
const MIN_SHARES: u64 = 2;
/// Largest CPU shares value the kernel accepts.
const MAX_SHARES: u64 = 262_144;
/// Shares corresponding to one full CPU.
const SHARES_PER_CPU: u64 = 1024;
const MILLI_CPU_PER_CPU: u64 = 1000;

/// Convert a millicpu amount to cgroup v1 CPU shares, clamped to the
/// range the kernel accepts. Zero millicpu maps to the minimum weight.
pub fn millicpu_to_shares(millicpu: i64) -> u64 {
    if millicpu <= 0 {
        return MIN_SHARES;
    }
    let shares = millicpu as u64 * SHARES_PER_CPU / MILLI_CPU_PER_CPU;
    shares.clamp(MIN_SHARES, MAX_SHARES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_cpu_is_1024_shares() {
        assert_eq!(millicpu_to_shares(1000), 1024);
        assert_eq!(millicpu_to_shares(2000), 2048);
    }

    #[test]
    fn fractions_round_down() {
        assert_eq!(millicpu_to_shares(500), 512);
        assert_eq!(millicpu_to_shares(1), 2);
    }

    #[test]
    fn clamped_to_kernel_range() {
        assert_eq!(millicpu_to_shares(0), 2);
        assert_eq!(millicpu_to_shares(-5), 2);
        assert_eq!(millicpu_to_shares(1_000_000_000), 262_144);
    }
}
