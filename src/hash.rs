//! Stable hashes used for key partitioning and derived tuple ids.
//!
//! Both functions are part of the wire-compatibility contract: every worker
//! in a cluster must compute identical values for identical inputs, across
//! releases. Do not swap these for `std::hash` implementations, which are
//! allowed to differ between processes.

/// MurmurHash3, x86 32-bit variant, seed 0.
///
/// Drives keyed partitioning: the same key string must land on the same task
/// no matter which worker computes the route.
#[must_use]
pub fn hash32(data: &[u8]) -> u32 {
  const C1: u32 = 0xcc9e_2d51;
  const C2: u32 = 0x1b87_3593;

  let mut h: u32 = 0;
  let mut chunks = data.chunks_exact(4);
  for chunk in chunks.by_ref() {
    let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    k = k.wrapping_mul(C1);
    k = k.rotate_left(15);
    k = k.wrapping_mul(C2);
    h ^= k;
    h = h.rotate_left(13);
    h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
  }

  let tail = chunks.remainder();
  if !tail.is_empty() {
    let mut k: u32 = 0;
    for (i, byte) in tail.iter().enumerate() {
      k |= u32::from(*byte) << (8 * i);
    }
    k = k.wrapping_mul(C1);
    k = k.rotate_left(15);
    k = k.wrapping_mul(C2);
    h ^= k;
  }

  h ^= data.len() as u32;
  h ^= h >> 16;
  h = h.wrapping_mul(0x85eb_ca6b);
  h ^= h >> 13;
  h = h.wrapping_mul(0xc2b2_ae35);
  h ^= h >> 16;
  h
}

/// MurmurHash2, 64-bit variant A, seed 0.
///
/// Used to derive stable tuple ids from string seeds, so replayed input
/// produces the same lineage roots.
#[must_use]
pub fn hash64(data: &[u8]) -> u64 {
  const M: u64 = 0xc6a4_a793_5bd1_e995;
  const R: u32 = 47;

  let mut h: u64 = (data.len() as u64).wrapping_mul(M);
  let mut chunks = data.chunks_exact(8);
  for chunk in chunks.by_ref() {
    let mut k = u64::from_le_bytes([
      chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
    ]);
    k = k.wrapping_mul(M);
    k ^= k >> R;
    k = k.wrapping_mul(M);
    h ^= k;
    h = h.wrapping_mul(M);
  }

  let tail = chunks.remainder();
  if !tail.is_empty() {
    let mut k: u64 = 0;
    for (i, byte) in tail.iter().enumerate() {
      k |= u64::from(*byte) << (8 * i);
    }
    h ^= k;
    h = h.wrapping_mul(M);
  }

  h ^= h >> R;
  h = h.wrapping_mul(M);
  h ^= h >> R;
  h
}
