//! Math utilities

/// Rounds up to the next power of two. Zero maps to one.
#[inline]
pub fn next_power_of_two(value: u32) -> u32 {
    value.max(1).checked_next_power_of_two().unwrap_or(1 << 31)
}

/// Integer base-2 logarithm, rounded down. Returns 0 for 0.
#[inline]
pub fn log_base_two(value: u32) -> u32 {
    if value == 0 {
        0
    } else {
        31 - value.leading_zeros()
    }
}

/// Integer base-2 logarithm of the next power of two
#[inline]
pub fn ilog2_ceil(value: u32) -> u32 {
    log_base_two(next_power_of_two(value))
}

/// Clamps a value between min and max
#[inline]
pub fn clamp<T: PartialOrd>(value: T, min: T, max: T) -> T {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

/// Squared distance on the XZ plane
#[inline]
pub fn dist_sqr_2d(ax: f32, az: f32, bx: f32, bz: f32) -> f32 {
    let dx = bx - ax;
    let dz = bz - az;
    dx * dx + dz * dz
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_power_of_two() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(1), 1);
        assert_eq!(next_power_of_two(9), 16);
        assert_eq!(next_power_of_two(16), 16);
        assert_eq!(next_power_of_two(17), 32);
    }

    #[test]
    fn test_log_base_two() {
        assert_eq!(log_base_two(1), 0);
        assert_eq!(log_base_two(16), 4);
        assert_eq!(log_base_two(17), 4);
        assert_eq!(ilog2_ceil(17), 5);
        assert_eq!(ilog2_ceil(4096), 12);
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(1, 3, 255), 3);
        assert_eq!(clamp(300, 3, 255), 255);
        assert_eq!(clamp(16, 3, 255), 16);
    }
}
