// hash function

/// Polynomial (x31) hash over the key bytes. No seed, so the value is the
/// same in every process and every run.
pub(crate) fn hash(key: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in key {
        h = (h << 5).wrapping_sub(h).wrapping_add(b as u32);
    }
    h
}
