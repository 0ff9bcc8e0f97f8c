//! LSD radix sort for shard entries.
//! 8-bit digits, up to 8 passes; a pass whose digit is constant is skipped.

/// Sort `keys` ascending. One scratch buffer is allocated and reused.
pub fn radix_sort_u64(keys: &mut [u64]) {
    let n = keys.len();
    if n <= 1 {
        return;
    }
    if n < 64 {
        keys.sort_unstable();
        return;
    }

    // All eight histograms in one read of the input.
    let mut counts = [[0usize; 256]; 8];
    for &k in keys.iter() {
        for (pass, c) in counts.iter_mut().enumerate() {
            c[((k >> (pass * 8)) & 0xFF) as usize] += 1;
        }
    }

    let mut tmp = vec![0u64; n];
    let mut in_keys = true;
    for (pass, c) in counts.iter_mut().enumerate() {
        if c.iter().any(|&x| x == n) {
            continue;
        }
        let shift = pass * 8;

        // Prefix sums -> positions
        let mut sum = 0usize;
        for slot in c.iter_mut() {
            let count = *slot;
            *slot = sum;
            sum += count;
        }

        let (src, dst): (&[u64], &mut [u64]) = if in_keys {
            (&*keys, tmp.as_mut_slice())
        } else {
            (tmp.as_slice(), &mut *keys)
        };
        // Scatter (stable)
        for &k in src {
            let b = ((k >> shift) & 0xFF) as usize;
            dst[c[b]] = k;
            c[b] += 1;
        }
        in_keys = !in_keys;
    }
    if !in_keys {
        keys.copy_from_slice(&tmp);
    }
}

#[cfg(test)]
mod tests {
    use super::radix_sort_u64;

    #[test]
    fn matches_std_sort() {
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let mut keys: Vec<u64> = (0..5000)
            .map(|i| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                // mix narrow and wide keys so some passes are skipped
                if i % 3 == 0 { state & 0xFFFF } else { state }
            })
            .collect();
        let mut expected = keys.clone();
        expected.sort_unstable();
        radix_sort_u64(&mut keys);
        assert_eq!(keys, expected);
    }

    #[test]
    fn narrow_keys_skip_passes() {
        let mut keys: Vec<u64> = (0..200u64).rev().map(|x| x << 8).collect();
        radix_sort_u64(&mut keys);
        assert!(keys.windows(2).all(|w| w[0] <= w[1]));
    }
}
