//! Format-agnostic byte statistics: histogram, entropy histogram, Shannon entropy.

pub const BYTE_HISTOGRAM_DIM: usize = 256;
pub const BYTE_ENTROPY_DIM: usize = 256;

const ENTROPY_WINDOW: usize = 2048;
const ENTROPY_STEP: usize = 1024;

/// Byte value counts normalized by the total byte count.
pub fn byte_histogram(bytes: &[u8]) -> Vec<f64> {
    let mut counts = [0u64; 256];
    for &b in bytes {
        counts[b as usize] += 1;
    }
    normalize(&counts)
}

/// Joint histogram of (window entropy bin, high nibble).
///
/// Slides a 2048-byte window with a step of 1024. For each window the
/// 16-bin high-nibble histogram is added to the row selected by the
/// window's entropy, giving a 16×16 grid normalized by its total.
/// Inputs shorter than one window are treated as a single window.
pub fn byte_entropy_histogram(bytes: &[u8]) -> Vec<f64> {
    let mut grid = [0u64; BYTE_ENTROPY_DIM];

    if bytes.len() < ENTROPY_WINDOW {
        accumulate_window(bytes, &mut grid);
    } else {
        let mut start = 0;
        while start + ENTROPY_WINDOW <= bytes.len() {
            accumulate_window(&bytes[start..start + ENTROPY_WINDOW], &mut grid);
            start += ENTROPY_STEP;
        }
    }

    normalize(&grid)
}

fn accumulate_window(block: &[u8], grid: &mut [u64; BYTE_ENTROPY_DIM]) {
    let mut nibbles = [0u64; 16];
    for &b in block {
        nibbles[(b >> 4) as usize] += 1;
    }

    // Probabilities are taken over the full window size even for short blocks.
    let mut h = 0.0f64;
    for &c in &nibbles {
        if c > 0 {
            let p = c as f64 / ENTROPY_WINDOW as f64;
            h -= p * p.log2();
        }
    }
    // 16 bins carry 4 bits; doubling rescales to the 8-bit range, then 2 bins per bit
    let bin = ((h * 2.0 * 2.0) as usize).min(15);

    for (i, &c) in nibbles.iter().enumerate() {
        grid[bin * 16 + i] += c;
    }
}

/// Shannon entropy in bits per byte (0.0 for empty input).
pub fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for &b in bytes {
        counts[b as usize] += 1;
    }
    let total = bytes.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

fn normalize(counts: &[u64]) -> Vec<f64> {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return vec![0.0; counts.len()];
    }
    counts.iter().map(|&c| c as f64 / total as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_histogram_sums_to_one() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let hist = byte_histogram(&data);
        assert_eq!(hist.len(), BYTE_HISTOGRAM_DIM);
        let total: f64 = hist.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_byte_histogram_single_value() {
        let hist = byte_histogram(&[0x41; 64]);
        assert_eq!(hist[0x41], 1.0);
        assert_eq!(hist.iter().filter(|v| **v > 0.0).count(), 1);
    }

    #[test]
    fn test_entropy_histogram_constant_input_lands_in_row_zero() {
        let hist = byte_entropy_histogram(&[0u8; 8192]);
        assert_eq!(hist.len(), BYTE_ENTROPY_DIM);
        // zero entropy → row 0, nibble 0
        assert!((hist[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_entropy_histogram_high_entropy_row() {
        // every high nibble equally likely → 4 bits → top row
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let hist = byte_entropy_histogram(&data);
        let top_row: f64 = hist[15 * 16..].iter().sum();
        assert!((top_row - 1.0).abs() < 1e-9, "top row mass {top_row}");
    }

    #[test]
    fn test_entropy_histogram_window_count() {
        // 4096 bytes → windows at 0, 1024, 2048 → 3 windows of 2048 bytes
        let data = vec![0u8; 4096];
        let mut grid = [0u64; BYTE_ENTROPY_DIM];
        let mut start = 0;
        let mut windows = 0;
        while start + ENTROPY_WINDOW <= data.len() {
            accumulate_window(&data[start..start + ENTROPY_WINDOW], &mut grid);
            start += ENTROPY_STEP;
            windows += 1;
        }
        assert_eq!(windows, 3);
        assert_eq!(grid[0], 3 * ENTROPY_WINDOW as u64);
    }

    #[test]
    fn test_shannon_entropy_bounds() {
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[7u8; 100]), 0.0);
        let uniform: Vec<u8> = (0..=255u8).collect();
        assert!((shannon_entropy(&uniform) - 8.0).abs() < 1e-9);
    }
}
