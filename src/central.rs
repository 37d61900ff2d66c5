use core::{
  mem::size_of,
  ptr::NonNull,
  sync::atomic::{AtomicUsize, Ordering},
};
use std::{
  sync::OnceLock,
  time::{Duration, Instant},
};

use crate::{
  AllocError, CLASS_COUNT, PAGE_SIZE, SPAN_TABLE_CAPACITY, padding_for,
  page::{OsPages, PageProvider, Span},
  size_class::{batch_size, class_size, span_bytes},
  slot::{Batch, Slot, SlotList},
  sync::SpinLock,
};

/// Consecutive full-free events tolerated before spans go back to the provider.
pub const DEFAULT_MAX_DELAY_COUNT: usize = 48;
/// Time after the last return at which the next full-free event returns spans.
pub const DEFAULT_MIN_DELAY_INTERVAL: Duration = Duration::from_millis(1000);

// =============================================================================
// Delayed-return policy
// =============================================================================

/// When a size class hands fully free spans back to the page provider.
///
/// A span that becomes fully free stays resident until either
/// `max_delay_count` such events accumulated in its class, or
/// `min_delay_interval` passed since the class last returned spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayPolicy {
  pub max_delay_count: usize,
  pub min_delay_interval: Duration,
}

impl DelayPolicy {
  pub fn with_max_delay_count(mut self, count: usize) -> Self {
    self.max_delay_count = count;
    self
  }

  pub fn with_min_delay_interval(mut self, interval: Duration) -> Self {
    self.min_delay_interval = interval;
    self
  }

  fn is_due(&self, delay: &DelayState, now: Instant) -> bool {
    delay.count >= self.max_delay_count
      || now.saturating_duration_since(delay.last_return) >= self.min_delay_interval
  }
}

impl Default for DelayPolicy {
  fn default() -> Self {
    Self {
      max_delay_count: DEFAULT_MAX_DELAY_COUNT,
      min_delay_interval: DEFAULT_MIN_DELAY_INTERVAL,
    }
  }
}

struct DelayState {
  count: usize,
  last_return: Instant,
}

// =============================================================================
// Span table
// =============================================================================

const VACANT: usize = 0;
/// Claimed by a registration that has not published its fields yet.
const RESERVED: usize = 1;

/// Bookkeeping for one span owned by the central cache.
///
/// `base` publishes the entry: the other fields are written before it is
/// stored with release ordering. `free_count` is only changed under the lock
/// of the owning class.
struct SpanDescriptor {
  base: AtomicUsize,
  pages: AtomicUsize,
  block_count: AtomicUsize,
  free_count: AtomicUsize,
  class: AtomicUsize,
}

impl SpanDescriptor {
  const fn new() -> Self {
    Self {
      base: AtomicUsize::new(VACANT),
      pages: AtomicUsize::new(0),
      block_count: AtomicUsize::new(0),
      free_count: AtomicUsize::new(0),
      class: AtomicUsize::new(0),
    }
  }

  #[inline]
  fn contains(&self, addr: usize) -> bool {
    let base = self.base.load(Ordering::Acquire);
    if base <= RESERVED || addr < base {
      return false;
    }
    let end = base + self.pages.load(Ordering::Relaxed) * PAGE_SIZE;
    // A concurrent vacate/re-register of the entry invalidates what was read.
    addr < end && self.base.load(Ordering::Acquire) == base
  }

  fn is_fully_free(&self) -> bool {
    self.free_count.load(Ordering::Relaxed) == self.block_count.load(Ordering::Relaxed)
  }

  fn owned_by(&self, class: usize) -> Option<usize> {
    let base = self.base.load(Ordering::Acquire);
    (base > RESERVED && self.class.load(Ordering::Relaxed) == class).then_some(base)
  }
}

struct SpanTable {
  slots: [SpanDescriptor; SPAN_TABLE_CAPACITY],
  cursor: AtomicUsize,
}

impl SpanTable {
  const fn new() -> Self {
    Self {
      slots: [const { SpanDescriptor::new() }; SPAN_TABLE_CAPACITY],
      cursor: AtomicUsize::new(0),
    }
  }

  /// Claims a vacant descriptor for `span`, or `None` when every slot is taken.
  fn register(&self, span: Span, class: usize, block_count: usize, free_count: usize) -> Option<usize> {
    let start = self.cursor.fetch_add(1, Ordering::Relaxed);
    for i in 0..SPAN_TABLE_CAPACITY {
      let slot = (start + i) % SPAN_TABLE_CAPACITY;
      let desc = &self.slots[slot];
      if desc
        .base
        .compare_exchange(VACANT, RESERVED, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
      {
        desc.pages.store(span.pages, Ordering::Relaxed);
        desc.block_count.store(block_count, Ordering::Relaxed);
        desc.free_count.store(free_count, Ordering::Relaxed);
        desc.class.store(class, Ordering::Relaxed);
        desc.base.store(span.base.as_ptr() as usize, Ordering::Release);
        return Some(slot);
      }
    }
    None
  }

  /// Linear scan; the table is small and bounded.
  fn find(&self, addr: usize, class: usize) -> Option<usize> {
    self
      .slots
      .iter()
      .position(|desc| desc.contains(addr) && desc.class.load(Ordering::Relaxed) == class)
  }

  fn vacate(&self, slot: usize) {
    self.slots[slot].base.store(VACANT, Ordering::Release);
  }
}

// =============================================================================
// Pinned spans
// =============================================================================

/// Header at the base of a span that found the span table full.
///
/// Pinned spans carry no free count: they stay mapped until the cache is
/// dropped. The owning class chains them through `next`.
#[derive(Clone, Copy)]
struct PinnedSpan {
  next: Option<NonNull<PinnedSpan>>,
  pages: usize,
  block_count: usize,
}

const PINNED_HEADER: usize = size_of::<PinnedSpan>();

// =============================================================================
// Central cache
// =============================================================================

struct LaneState {
  free: SlotList,
  delay: DelayState,
  pinned: Option<NonNull<PinnedSpan>>,
}

// Pinned headers live in spans owned by the cache and are only touched under the lane lock.
unsafe impl Send for LaneState {}

impl LaneState {
  fn pinned_spans(&self) -> impl Iterator<Item = (NonNull<PinnedSpan>, PinnedSpan)> + '_ {
    let mut cur = self.pinned;
    core::iter::from_fn(move || {
      let span = cur?;
      let header = unsafe { span.read() };
      cur = header.next;
      Some((span, header))
    })
  }

  /// Address range of the pinned span holding `addr`.
  fn pinned_range(&self, addr: usize) -> Option<(usize, usize)> {
    self.pinned_spans().find_map(|(span, header)| {
      let lo = span.as_ptr() as usize;
      let hi = lo + header.pages * PAGE_SIZE;
      (lo..hi).contains(&addr).then_some((lo, hi))
    })
  }
}

/// Where the last looked-up block lived.
#[derive(Clone, Copy)]
enum Owner {
  Table(usize),
  Pinned { lo: usize, hi: usize },
}

/// Counts of what one delayed-return pass did.
#[derive(Default)]
struct Released {
  spans: usize,
  pages: usize,
  refused: usize,
}

/// Point-in-time view of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassSnapshot {
  /// Blocks on the shared free list.
  pub free_blocks: usize,
  /// Spans of this class tracked in the span table.
  pub spans: usize,
  /// Tracked spans whose every block is on the free list.
  pub free_spans: usize,
  /// Spans taken while the span table was full.
  pub pinned_spans: usize,
  /// Blocks carved across every span of this class.
  pub capacity: usize,
  /// Full-free events since the last return.
  pub delay_count: usize,
}

static CENTRAL: OnceLock<CentralCache> = OnceLock::new();

/// Shared middle tier: per-class free lists fed by spans from a [`PageProvider`].
///
/// Every size class has its own spin-lock; its free list, its spans' free
/// counts and its delay state only change while that lock is held, so
/// classes never contend with each other.
///
/// Spans are tracked in a fixed table so that fully free ones can go back to
/// the provider. Once the table is full, new spans are pinned instead: they
/// keep serving blocks but are only released when the cache is dropped.
pub struct CentralCache<P: PageProvider = OsPages> {
  lanes: [SpinLock<LaneState>; CLASS_COUNT],
  spans: SpanTable,
  policy: DelayPolicy,
  provider: P,
}

impl CentralCache<OsPages> {
  /// The process-wide cache backed by [`OsPages`].
  pub fn global() -> &'static Self {
    CENTRAL.get_or_init(|| CentralCache::new(OsPages))
  }
}

impl<P: PageProvider> CentralCache<P> {
  pub fn new(provider: P) -> Self {
    Self::with_policy(provider, DelayPolicy::default())
  }

  pub fn with_policy(provider: P, policy: DelayPolicy) -> Self {
    let now = Instant::now();
    Self {
      lanes: core::array::from_fn(|_| {
        SpinLock::new(LaneState {
          free: SlotList::new(),
          delay: DelayState {
            count: 0,
            last_return: now,
          },
          pinned: None,
        })
      }),
      spans: SpanTable::new(),
      policy,
      provider,
    }
  }

  pub fn provider(&self) -> &P {
    &self.provider
  }

  /// Hands out a batch of `class_size(index)`-byte blocks.
  ///
  /// Served from the shared list when it has blocks, otherwise from a
  /// freshly carved span.
  pub fn fetch_range(&self, index: usize) -> Result<Batch, AllocError> {
    assert!(index < CLASS_COUNT, "size class {index} out of range");
    let size = class_size(index);
    let want = batch_size(size);

    {
      let mut lane = self.lanes[index].lock();
      if let Some(batch) = lane.free.take(want) {
        self.debit(&lane, &batch, index);
        return Ok(batch);
      }
    }

    self.fetch_from_pages(index, size, want)
  }

  /// Takes back `count` blocks of class `index`.
  ///
  /// # Safety
  /// `start` must head a chain of at least `count` blocks, linked through
  /// their first word, that were handed out by `fetch_range(index)` on this
  /// cache and are no longer in use. Links past the `count`-th block are
  /// ignored.
  pub unsafe fn return_range(&self, start: NonNull<u8>, count: usize, index: usize) {
    assert!(index < CLASS_COUNT, "size class {index} out of range");
    if count == 0 {
      return;
    }
    let batch = unsafe { Batch::from_raw(Slot::from_block(start), count) };

    let released = {
      let mut lane = self.lanes[index].lock();

      let mut became_free = 0;
      let mut hint = None;
      for block in unsafe { batch.blocks() } {
        let addr = block.as_ptr() as usize;
        let Some(desc) = self.span_of(&lane, addr, index, &mut hint) else {
          continue;
        };
        let blocks = desc.block_count.load(Ordering::Relaxed);
        let prev = desc.free_count.fetch_add(1, Ordering::Relaxed);
        assert!(prev < blocks, "block {addr:#x} freed into a span that is already fully free");
        if prev + 1 == blocks {
          became_free += 1;
        }
      }
      lane.free.push_batch(batch);

      let mut released = Released::default();
      if became_free > 0 {
        let now = Instant::now();
        for _ in 0..became_free {
          lane.delay.count += 1;
          if self.policy.is_due(&lane.delay, now) {
            let pass = self.return_free_spans(&mut lane, index, now);
            released.spans += pass.spans;
            released.pages += pass.pages;
            released.refused += pass.refused;
          }
        }
      }
      released
    };

    #[cfg(feature = "tracing")]
    if released.spans > 0 || released.refused > 0 {
      tracing::debug!(
        class = index,
        spans = released.spans,
        pages = released.pages,
        refused = released.refused,
        "returned fully free spans to the page provider"
      );
    }
    #[cfg(not(feature = "tracing"))]
    let _ = released;
  }

  pub fn snapshot(&self, index: usize) -> ClassSnapshot {
    assert!(index < CLASS_COUNT, "size class {index} out of range");
    let lane = self.lanes[index].lock();
    let mut spans = 0;
    let mut free_spans = 0;
    let mut capacity = 0;
    for desc in &self.spans.slots {
      if desc.owned_by(index).is_some() {
        spans += 1;
        capacity += desc.block_count.load(Ordering::Relaxed);
        if desc.is_fully_free() {
          free_spans += 1;
        }
      }
    }

    let mut pinned_spans = 0;
    for (_, header) in lane.pinned_spans() {
      pinned_spans += 1;
      capacity += header.block_count;
    }

    ClassSnapshot {
      free_blocks: lane.free.len(),
      spans,
      free_spans,
      pinned_spans,
      capacity,
      delay_count: lane.delay.count,
    }
  }

  fn fetch_from_pages(&self, index: usize, size: usize, want: usize) -> Result<Batch, AllocError> {
    let span = self.provider.acquire_span(span_bytes(size))?;
    let base = span.base.as_ptr() as usize;

    let offset = padding_for(base, size);
    let block_count = (span.bytes() - offset) / size;
    let served = want.min(block_count);

    let (mut carved, served, pinned) = match self.spans.register(span, index, block_count, block_count - served) {
      Some(_slot) => {
        #[cfg(feature = "tracing")]
        tracing::trace!(class = index, pages = span.pages, blocks = block_count, slot = _slot, "carved new span");
        (carve(span, offset, size, block_count), served, None)
      }
      None => {
        let offset = PINNED_HEADER + padding_for(base + PINNED_HEADER, size);
        let block_count = (span.bytes() - offset) / size;
        let header = span.base.cast::<PinnedSpan>();
        unsafe {
          header.write(PinnedSpan {
            next: None,
            pages: span.pages,
            block_count,
          })
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(class = index, pages = span.pages, capacity = SPAN_TABLE_CAPACITY, "span table full, pinned new span");
        (carve(span, offset, size, block_count), want.min(block_count), Some(header))
      }
    };

    let Some(batch) = carved.take(served) else {
      unreachable!("span of {} bytes holds no {size}-byte block", span.bytes());
    };

    let mut lane = self.lanes[index].lock();
    if let Some(mut header) = pinned {
      unsafe { header.as_mut().next = lane.pinned };
      lane.pinned = Some(header);
    }
    lane.free.append(&mut carved);
    Ok(batch)
  }

  /// Decrements owning spans' free counts for blocks leaving the shared list.
  fn debit(&self, lane: &LaneState, batch: &Batch, index: usize) {
    let mut hint = None;
    for block in unsafe { batch.blocks() } {
      if let Some(desc) = self.span_of(lane, block.as_ptr() as usize, index, &mut hint) {
        let prev = desc.free_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
      }
    }
  }

  /// Finds the tracked span holding `addr`, trying the last hit first.
  ///
  /// `None` means the block lives in one of the class's pinned spans.
  fn span_of(&self, lane: &LaneState, addr: usize, index: usize, hint: &mut Option<Owner>) -> Option<&SpanDescriptor> {
    match *hint {
      Some(Owner::Table(slot)) if self.spans.slots[slot].contains(addr) => return Some(&self.spans.slots[slot]),
      Some(Owner::Pinned { lo, hi }) if (lo..hi).contains(&addr) => return None,
      _ => {}
    }

    if let Some(slot) = self.spans.find(addr, index) {
      *hint = Some(Owner::Table(slot));
      return Some(&self.spans.slots[slot]);
    }
    match lane.pinned_range(addr) {
      Some((lo, hi)) => {
        *hint = Some(Owner::Pinned { lo, hi });
        None
      }
      None => panic!("block {addr:#x} does not belong to any span of size class {index}"),
    }
  }

  /// Gives every fully free span of `index` back to the provider.
  ///
  /// Spans the provider refuses keep their blocks on the free list.
  fn return_free_spans(&self, lane: &mut LaneState, index: usize, now: Instant) -> Released {
    lane.delay.count = 0;
    lane.delay.last_return = now;

    let mut released = Released::default();
    for (slot, desc) in self.spans.slots.iter().enumerate() {
      let Some(base) = desc.owned_by(index) else {
        continue;
      };
      if !desc.is_fully_free() {
        continue;
      }

      let pages = desc.pages.load(Ordering::Relaxed);
      let mut removed = lane.free.remove_range(base, base + pages * PAGE_SIZE);
      debug_assert_eq!(removed.len(), desc.block_count.load(Ordering::Relaxed));

      let ptr = unsafe { NonNull::new_unchecked(base as *mut u8) };
      match unsafe { self.provider.release_span(ptr, pages) } {
        Ok(()) => {
          self.spans.vacate(slot);
          released.spans += 1;
          released.pages += pages;
        }
        Err(_) => {
          lane.free.append(&mut removed);
          released.refused += 1;
        }
      }
    }
    released
  }

  fn release_on_drop(&self, base: NonNull<u8>, pages: usize) {
    if let Err(_err) = unsafe { self.provider.release_span(base, pages) } {
      #[cfg(feature = "tracing")]
      tracing::warn!("span {base:p} leaked on drop: {_err}");
    }
  }
}

impl<P: PageProvider> Drop for CentralCache<P> {
  fn drop(&mut self) {
    for lane in &self.lanes {
      let mut cur = lane.lock().pinned.take();
      while let Some(span) = cur {
        let header = unsafe { span.read() };
        self.release_on_drop(span.cast(), header.pages);
        cur = header.next;
      }
    }

    for (slot, desc) in self.spans.slots.iter().enumerate() {
      let base = desc.base.load(Ordering::Acquire);
      if base <= RESERVED {
        continue;
      }
      let pages = desc.pages.load(Ordering::Relaxed);
      self.release_on_drop(unsafe { NonNull::new_unchecked(base as *mut u8) }, pages);
      self.spans.vacate(slot);
    }
  }
}

/// Links `block_count` blocks starting `offset` bytes into a fresh span,
/// lowest address on top.
fn carve(span: Span, offset: usize, size: usize, block_count: usize) -> SlotList {
  let mut list = SlotList::new();
  let base = span.base.as_ptr();
  for i in (0..block_count).rev() {
    let block = unsafe { NonNull::new_unchecked(base.add(offset + i * size)) };
    unsafe { list.push(Slot::from_block(block)) };
  }
  list
}
