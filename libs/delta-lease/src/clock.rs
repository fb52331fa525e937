//! The monotonic clock behind every on-disk timestamp. Wall time is never
//! written to disk: hosts compare timestamps only for change, not order.

/// Seconds on CLOCK_MONOTONIC.
pub fn monotime() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: valid timespec pointer; CLOCK_MONOTONIC cannot fail.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotime_advances() {
        let a = monotime();
        let b = monotime();
        assert!(b >= a);
        assert!(a > 0);
    }
}
