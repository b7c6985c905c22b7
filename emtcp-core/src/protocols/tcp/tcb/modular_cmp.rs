//! Comparisons between sequence numbers. Sequence space is a ring of 2^32
//! values, so `a < b` means `b` lies less than half the ring ahead of `a`.

/// a < b under modular arithmetic
pub fn mod_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// a <= b under modular arithmetic
pub fn mod_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// a > b under modular arithmetic
pub fn mod_gt(a: u32, b: u32) -> bool {
    mod_lt(b, a)
}

/// a >= b under modular arithmetic
pub fn mod_ge(a: u32, b: u32) -> bool {
    mod_le(b, a)
}

/// Whether `x` falls in the `len` sequence numbers starting at `start`
pub fn mod_in_window(x: u32, start: u32, len: u32) -> bool {
    x.wrapping_sub(start) < len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modular_comparison() {
        assert!(mod_lt(10, 20));
        assert!(!mod_lt(20, 10));
        assert!(mod_lt(3_000_000_000, 4_000_000_000));
        assert!(!mod_lt(5, 5));
        assert!(mod_le(5, 5));
        assert!(mod_gt(20, 10));
        assert!(mod_ge(5, 5));

        // Across the wrap
        assert!(mod_lt(u32::MAX - 5, 5));
        assert!(mod_gt(5, u32::MAX - 5));
        assert!(mod_le(u32::MAX, 0));
    }

    #[test]
    fn windows() {
        assert!(mod_in_window(100, 100, 10));
        assert!(mod_in_window(109, 100, 10));
        assert!(!mod_in_window(110, 100, 10));
        assert!(!mod_in_window(99, 100, 10));
        assert!(mod_in_window(3, u32::MAX - 2, 10));
        assert!(!mod_in_window(100, 100, 0));
    }
}
