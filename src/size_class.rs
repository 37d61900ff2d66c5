use crate::{BASE_GRANULARITY, BLOCKS_PER_SPAN, MAX_BATCH_BYTES, PAGE_SIZE, SPAN_PAGES, align_up};

/// Rounds `size` up to the next size-class boundary. Zero maps to the smallest class.
#[inline(always)]
pub const fn round_up(size: usize) -> usize {
  let size = if size == 0 { 1 } else { size };
  align_up(size, BASE_GRANULARITY)
}

/// Convert a request size to its class index (`round_up(size) / BASE_GRANULARITY - 1`).
#[inline(always)]
pub const fn class_index(size: usize) -> usize {
  round_up(size) / BASE_GRANULARITY - 1
}

/// Convert class index to block size (inverse of `class_index`).
#[inline(always)]
pub const fn class_size(index: usize) -> usize {
  (index + 1) * BASE_GRANULARITY
}

/// Number of blocks moved between the thread and central tiers per call.
///
/// Small classes move many blocks at once, large ones few, capped so one
/// batch stays around `MAX_BATCH_BYTES`.
pub const fn batch_size(size: usize) -> usize {
  let base = if size <= 32 {
    64
  } else if size <= 64 {
    32
  } else if size <= 128 {
    16
  } else if size <= 256 {
    8
  } else if size <= 512 {
    4
  } else if size <= 1024 {
    2
  } else {
    1
  };

  let by_bytes = MAX_BATCH_BYTES / size;
  let n = if base < by_bytes { base } else { by_bytes };
  if n == 0 { 1 } else { n }
}

/// Bytes requested from the page provider for a fresh span of `size`-byte blocks.
pub const fn span_bytes(size: usize) -> usize {
  let by_blocks = size * BLOCKS_PER_SPAN;
  let floor = SPAN_PAGES * PAGE_SIZE;
  align_up(if by_blocks > floor { by_blocks } else { floor }, PAGE_SIZE)
}

/// Page count covering `bytes`.
#[inline(always)]
pub const fn pages_for(bytes: usize) -> usize {
  bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{CLASS_COUNT, MAX_SMALL_SIZE};

  #[test]
  fn twenty_bytes_lands_in_thirty_two_byte_class() {
    assert_eq!(round_up(20), 32);
    assert_eq!(class_index(20), 1);
    assert_eq!(class_size(class_index(20)), 32);
  }

  #[test]
  fn zero_and_exact_boundaries() {
    assert_eq!(class_index(0), 0);
    assert_eq!(class_index(1), 0);
    assert_eq!(class_index(16), 0);
    assert_eq!(class_index(17), 1);
    assert_eq!(class_index(MAX_SMALL_SIZE), CLASS_COUNT - 1);
  }

  #[test]
  fn class_size_covers_request() {
    for size in 1..=MAX_SMALL_SIZE {
      let served = class_size(class_index(size));
      assert!(served >= size);
      assert!(served - size < BASE_GRANULARITY);
    }
  }

  #[test]
  fn batches_stay_bounded() {
    assert_eq!(batch_size(16), 64);
    assert_eq!(batch_size(48), 32);
    assert_eq!(batch_size(2048), 1);
    assert_eq!(batch_size(MAX_SMALL_SIZE), 1);
    for index in 0..CLASS_COUNT {
      let size = class_size(index);
      let n = batch_size(size);
      assert!(n >= 1);
      assert!(n == 1 || n * size <= MAX_BATCH_BYTES);
    }
  }

  #[test]
  fn spans_hold_at_least_one_batch() {
    for index in 0..CLASS_COUNT {
      let size = class_size(index);
      let bytes = span_bytes(size);
      assert_eq!(bytes % PAGE_SIZE, 0);
      assert!(bytes / size >= batch_size(size));
      assert!(bytes >= SPAN_PAGES * PAGE_SIZE);
    }
  }
}
