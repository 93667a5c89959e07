//! Two-source PCM mixing
//!
//! Sums interleaved 16-bit samples with saturation so loud passages clip at
//! the signed 16-bit bounds instead of wrapping around.

/// Mix two blocks into a new one, bounded to the shorter input
pub fn mix(a: &[i16], b: &[i16]) -> Vec<i16> {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| x.saturating_add(*y))
        .collect()
}

/// Mix `other` into `dst` in place, touching only the overlapping prefix
///
/// Returns the number of samples mixed.
pub fn mix_in_place(dst: &mut [i16], other: &[i16]) -> usize {
    let len = dst.len().min(other.len());
    for (d, s) in dst[..len].iter_mut().zip(&other[..len]) {
        *d = d.saturating_add(*s);
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_clipping() {
        assert_eq!(mix(&[32_000], &[32_000]), vec![i16::MAX]);
    }

    #[test]
    fn test_negative_clipping() {
        assert_eq!(mix(&[-32_000], &[-32_000]), vec![i16::MIN]);
    }

    #[test]
    fn test_bounded_to_shorter_input() {
        assert_eq!(mix(&[1, 2, 3], &[10, 20]), vec![11, 22]);
    }

    #[test]
    fn test_in_place_leaves_tail_untouched() {
        let mut dst = [100, 200, 300, 400];
        let mixed = mix_in_place(&mut dst, &[1, 1]);
        assert_eq!(mixed, 2);
        assert_eq!(dst, [101, 201, 300, 400]);
    }
}
