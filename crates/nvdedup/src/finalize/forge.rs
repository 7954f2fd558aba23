//! Forge chunks that collide on the weak fingerprint. Test support only.

/// Build a chunk that differs from `original` but has the same CRC-32.
///
/// For a fixed length CRC-32 is affine over GF(2), so the last four bytes
/// of a `fill`-filled chunk are solved for by Gaussian elimination over the
/// 32 tail bits.
pub fn forge_weak_collision(original: &[u8], fill: u8) -> Vec<u8> {
    let n = original.len();
    let target = crc32fast::hash(original);
    let mut forged = vec![fill; n];
    forged[n - 4..].fill(0);
    let base = crc32fast::hash(&forged);

    // (crc delta, tail bits flipped) per tail bit
    let mut rows: Vec<(u32, u32)> = (0..32)
        .map(|j| {
            let mut flipped = forged.clone();
            flipped[n - 4 + j / 8] ^= 1 << (j % 8);
            (crc32fast::hash(&flipped) ^ base, 1u32 << j)
        })
        .collect();

    let mut want = target ^ base;
    let mut solution = 0u32;
    for bit in (0..32).rev() {
        let Some(pivot) = rows.iter().position(|(d, _)| (d >> bit) & 1 == 1) else {
            continue;
        };
        let (pd, pm) = rows.swap_remove(pivot);
        for row in rows.iter_mut() {
            if (row.0 >> bit) & 1 == 1 {
                row.0 ^= pd;
                row.1 ^= pm;
            }
        }
        if (want >> bit) & 1 == 1 {
            want ^= pd;
            solution ^= pm;
        }
    }
    assert_eq!(want, 0, "tail bits must span every CRC delta");
    forged[n - 4..].copy_from_slice(&solution.to_le_bytes());
    assert_eq!(crc32fast::hash(&forged), target);
    assert_ne!(forged, original);
    forged
}
