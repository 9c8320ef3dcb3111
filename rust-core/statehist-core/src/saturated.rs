// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Overflow-safe timestamp arithmetic.
//
// Node bounds and query windows combine timestamps with durations. Results
// clamp to `i64::MIN`/`i64::MAX` instead of wrapping, so an open node end
// (`i64::MAX`) stays open after `+ 1`.

/// Adds two values, clamping to the `i64` range.
#[inline]
pub fn saturated_add(a: i64, b: i64) -> i64 {
    a.saturating_add(b)
}

/// Subtracts `b` from `a`, clamping to the `i64` range.
#[inline]
pub fn saturated_sub(a: i64, b: i64) -> i64 {
    a.saturating_sub(b)
}

/// Multiplies two values, clamping to the `i64` range.
#[inline]
pub fn saturated_mul(a: i64, b: i64) -> i64 {
    a.saturating_mul(b)
}

/// Multiplies two `i32` values, clamping to the `i32` range.
#[inline]
pub fn saturated_mul_i32(a: i32, b: i32) -> i32 {
    a.saturating_mul(b)
}

/// Returns true if both values are strictly positive or both strictly
/// negative.
#[inline]
pub fn same_sign(a: i64, b: i64) -> bool {
    (a > 0 && b > 0) || (a < 0 && b < 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_clamps_at_max() {
        assert_eq!(saturated_add(i64::MAX, 1), i64::MAX);
        assert_eq!(saturated_add(i64::MAX - 5, 3), i64::MAX - 2);
    }

    #[test]
    fn test_add_clamps_at_min() {
        assert_eq!(saturated_add(i64::MIN, -1), i64::MIN);
        assert_eq!(saturated_add(-10, 4), -6);
    }

    #[test]
    fn test_sub() {
        assert_eq!(saturated_sub(i64::MIN, 1), i64::MIN);
        assert_eq!(saturated_sub(i64::MAX, -1), i64::MAX);
        assert_eq!(saturated_sub(100, 1), 99);
    }

    #[test]
    fn test_mul() {
        assert_eq!(saturated_mul(i64::MAX / 2, 3), i64::MAX);
        assert_eq!(saturated_mul(i64::MIN / 2, 3), i64::MIN);
        assert_eq!(saturated_mul(-4, 5), -20);
        assert_eq!(saturated_mul_i32(i32::MAX, 2), i32::MAX);
    }

    #[test]
    fn test_same_sign() {
        assert!(same_sign(1, 7));
        assert!(same_sign(-1, -7));
        assert!(!same_sign(-1, 7));
        assert!(!same_sign(0, 7));
    }
}
