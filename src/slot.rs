use core::{
  marker::PhantomData,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicU64, Ordering},
};

// =============================================================================
// Slot
// =============================================================================

/// Free-list node overlaying the first word of an unused block.
#[repr(C)]
pub struct Slot {
  next: AtomicPtr<Slot>,
}

impl Slot {
  /// # Safety
  /// `slot` must point to at least `size_of::<Slot>()` writable bytes.
  #[inline]
  pub(crate) unsafe fn set_next(slot: NonNull<Slot>, next: *mut Slot) {
    unsafe {
      slot.as_ptr().write(Slot {
        next: AtomicPtr::new(next),
      })
    };
  }

  /// # Safety
  /// `slot` must point to a slot previously written by `set_next`.
  #[inline]
  pub(crate) unsafe fn next(slot: NonNull<Slot>) -> *mut Slot {
    unsafe { (*slot.as_ptr()).next.load(Ordering::Relaxed) }
  }

  #[inline]
  pub(crate) fn from_block(block: NonNull<u8>) -> NonNull<Slot> {
    block.cast()
  }
}

// =============================================================================
// Lock-free free list (Treiber stack)
// =============================================================================

/// User-space addresses fit in the low 48 bits; the rest holds an ABA tag.
const ADDR_BITS: u32 = 48;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;
const TAG_MASK: u64 = (1 << (64 - ADDR_BITS)) - 1;

const _: () = assert!(usize::BITS == 64);

#[inline(always)]
fn pack(ptr: *mut Slot, tag: u64) -> u64 {
  debug_assert!(ptr as usize as u64 & !ADDR_MASK == 0, "slot address {ptr:p} exceeds 48 bits");
  (ptr as usize as u64) | ((tag & TAG_MASK) << ADDR_BITS)
}

#[inline(always)]
fn unpack(packed: u64) -> *mut Slot {
  (packed & ADDR_MASK) as usize as *mut Slot
}

#[inline(always)]
fn next_tag(packed: u64) -> u64 {
  (packed >> ADDR_BITS).wrapping_add(1)
}

/// Lock-free LIFO of free slots.
///
/// Every successful push or pop bumps the head tag, so a pop that read a
/// stale `next` fails its compare-and-swap even when the same node is back on
/// top. Nodes must stay mapped for the lifetime of the stack: a losing pop may
/// read the `next` word of a slot another thread has already taken.
pub(crate) struct FreeStack {
  head: AtomicU64,
}

impl FreeStack {
  pub(crate) const fn new() -> Self {
    Self {
      head: AtomicU64::new(0),
    }
  }

  /// # Safety
  /// `slot` must be a free block that stays mapped while the stack lives and
  /// is not a member of any other list.
  pub(crate) unsafe fn push(&self, slot: NonNull<Slot>) {
    loop {
      let packed = self.head.load(Ordering::Relaxed);
      unsafe { Slot::set_next(slot, unpack(packed)) };
      if self
        .head
        .compare_exchange_weak(
          packed,
          pack(slot.as_ptr(), next_tag(packed)),
          Ordering::Release,
          Ordering::Relaxed,
        )
        .is_ok()
      {
        return;
      }
    }
  }

  pub(crate) fn pop(&self) -> Option<NonNull<Slot>> {
    loop {
      let packed = self.head.load(Ordering::Acquire);
      let top = NonNull::new(unpack(packed))?;
      let next = unsafe { Slot::next(top) };
      if self
        .head
        .compare_exchange_weak(packed, pack(next, next_tag(packed)), Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
      {
        return Some(top);
      }
    }
  }

  /// Number of queued slots. Only meaningful while no other thread touches the stack.
  pub(crate) fn len(&self) -> usize {
    let mut n = 0;
    let mut cur = unpack(self.head.load(Ordering::Acquire));
    while let Some(slot) = NonNull::new(cur) {
      n += 1;
      cur = unsafe { Slot::next(slot) };
    }
    n
  }
}

// =============================================================================
// Batch
// =============================================================================

/// A null-terminated chain of `count` free blocks of one size class.
///
/// Handed between the thread and central tiers. The blocks are owned by
/// whoever holds the batch.
pub struct Batch {
  head: NonNull<Slot>,
  count: usize,
}

unsafe impl Send for Batch {}

impl Batch {
  /// # Safety
  /// `head` must start a chain of exactly `count` slots whose last link is null.
  pub(crate) unsafe fn from_raw(head: NonNull<Slot>, count: usize) -> Self {
    debug_assert!(count > 0);
    Self { head, count }
  }

  pub fn head(&self) -> NonNull<u8> {
    self.head.cast()
  }

  pub fn count(&self) -> usize {
    self.count
  }

  /// Walks the chain.
  ///
  /// # Safety
  /// No block of the batch may have been written to since it was handed out.
  pub unsafe fn blocks(&self) -> Blocks<'_> {
    Blocks {
      cur: self.head.as_ptr(),
      left: self.count,
      _batch: PhantomData,
    }
  }

  pub(crate) fn into_raw(self) -> (NonNull<Slot>, usize) {
    (self.head, self.count)
  }

  unsafe fn tail(&self) -> NonNull<Slot> {
    let mut tail = self.head;
    for _ in 1..self.count {
      tail = unsafe { NonNull::new_unchecked(Slot::next(tail)) };
    }
    tail
  }
}

pub struct Blocks<'a> {
  cur: *mut Slot,
  left: usize,
  _batch: PhantomData<&'a Batch>,
}

impl Iterator for Blocks<'_> {
  type Item = NonNull<u8>;

  fn next(&mut self) -> Option<NonNull<u8>> {
    if self.left == 0 {
      return None;
    }
    let slot = NonNull::new(self.cur)?;
    self.left -= 1;
    self.cur = unsafe { Slot::next(slot) };
    Some(slot.cast())
  }
}

// =============================================================================
// Owned free list
// =============================================================================

/// Singly-linked LIFO owned by one thread, or guarded by a lock.
pub(crate) struct SlotList {
  head: *mut Slot,
  len: usize,
}

unsafe impl Send for SlotList {}

impl SlotList {
  pub(crate) const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// # Safety
  /// `slot` must be a free block not linked into any other list.
  #[inline]
  pub(crate) unsafe fn push(&mut self, slot: NonNull<Slot>) {
    unsafe { Slot::set_next(slot, self.head) };
    self.head = slot.as_ptr();
    self.len += 1;
  }

  #[inline]
  pub(crate) fn pop(&mut self) -> Option<NonNull<Slot>> {
    let top = NonNull::new(self.head)?;
    self.head = unsafe { Slot::next(top) };
    self.len -= 1;
    Some(top)
  }

  /// Prepends a whole batch.
  pub(crate) fn push_batch(&mut self, batch: Batch) {
    let tail = unsafe { batch.tail() };
    unsafe { Slot::set_next(tail, self.head) };
    let (head, count) = batch.into_raw();
    self.head = head.as_ptr();
    self.len += count;
  }

  /// Detaches up to `n` slots from the top.
  pub(crate) fn take(&mut self, n: usize) -> Option<Batch> {
    let head = NonNull::new(self.head)?;
    let n = n.min(self.len);
    if n == 0 {
      return None;
    }

    let mut tail = head;
    for _ in 1..n {
      tail = unsafe { NonNull::new_unchecked(Slot::next(tail)) };
    }
    self.head = unsafe { Slot::next(tail) };
    unsafe { Slot::set_next(tail, null_mut()) };
    self.len -= n;

    Some(unsafe { Batch::from_raw(head, n) })
  }

  /// Keeps the top `keep` slots and detaches the rest.
  pub(crate) fn split_off(&mut self, keep: usize) -> Option<Batch> {
    if keep >= self.len {
      return None;
    }
    if keep == 0 {
      return self.take(self.len);
    }

    let mut last_kept = NonNull::new(self.head)?;
    for _ in 1..keep {
      last_kept = unsafe { NonNull::new_unchecked(Slot::next(last_kept)) };
    }
    let rest = unsafe { NonNull::new_unchecked(Slot::next(last_kept)) };
    unsafe { Slot::set_next(last_kept, null_mut()) };
    let count = self.len - keep;
    self.len = keep;

    Some(unsafe { Batch::from_raw(rest, count) })
  }

  /// Unlinks every slot whose address lies in `[lo, hi)` and returns them as a list.
  pub(crate) fn remove_range(&mut self, lo: usize, hi: usize) -> SlotList {
    let mut removed = SlotList::new();
    let mut kept = SlotList::new();
    let mut kept_tail: Option<NonNull<Slot>> = None;

    while let Some(slot) = self.pop() {
      let addr = slot.as_ptr() as usize;
      if addr >= lo && addr < hi {
        unsafe { removed.push(slot) };
      } else {
        // Append to preserve the original order of survivors.
        unsafe { Slot::set_next(slot, null_mut()) };
        match kept_tail {
          Some(tail) => unsafe { Slot::set_next(tail, slot.as_ptr()) },
          None => kept.head = slot.as_ptr(),
        }
        kept.len += 1;
        kept_tail = Some(slot);
      }
    }

    *self = kept;
    removed
  }

  /// Moves every slot of `other` on top of this list.
  pub(crate) fn append(&mut self, other: &mut SlotList) {
    let len = other.len;
    if let Some(batch) = other.take(len) {
      self.push_batch(batch);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{collections::HashSet, sync::Arc, thread};

  fn blocks(n: usize) -> Vec<Box<[usize; 2]>> {
    (0..n).map(|_| Box::new([0usize; 2])).collect()
  }

  fn slot_of(b: &mut Box<[usize; 2]>) -> NonNull<Slot> {
    NonNull::from(&mut **b).cast()
  }

  #[test]
  fn stack_is_lifo() {
    let mut mem = blocks(3);
    let stack = FreeStack::new();
    let slots: Vec<_> = mem.iter_mut().map(slot_of).collect();

    for &s in &slots {
      unsafe { stack.push(s) };
    }
    assert_eq!(stack.len(), 3);
    assert_eq!(stack.pop(), Some(slots[2]));
    assert_eq!(stack.pop(), Some(slots[1]));
    assert_eq!(stack.pop(), Some(slots[0]));
    assert_eq!(stack.pop(), None);
  }

  #[test]
  fn stack_survives_concurrent_churn() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 64;

    let mut mem = blocks(THREADS * PER_THREAD);
    let stack = Arc::new(FreeStack::new());
    for b in mem.iter_mut() {
      unsafe { stack.push(slot_of(b)) };
    }

    thread::scope(|s| {
      for _ in 0..THREADS {
        let stack = stack.clone();
        s.spawn(move || {
          for _ in 0..2_000 {
            let mut held = Vec::new();
            for _ in 0..4 {
              if let Some(slot) = stack.pop() {
                held.push(slot);
              }
            }
            for slot in held {
              unsafe { stack.push(slot) };
            }
          }
        });
      }
    });

    let mut seen = HashSet::new();
    while let Some(slot) = stack.pop() {
      assert!(seen.insert(slot.as_ptr() as usize), "slot popped twice");
    }
    assert_eq!(seen.len(), THREADS * PER_THREAD);
  }

  #[test]
  fn list_take_and_split() {
    let mut mem = blocks(10);
    let mut list = SlotList::new();
    for b in mem.iter_mut() {
      unsafe { list.push(slot_of(b)) };
    }

    let batch = list.take(4).unwrap();
    assert_eq!(batch.count(), 4);
    assert_eq!(list.len(), 6);
    assert_eq!(unsafe { batch.blocks() }.count(), 4);

    let rest = list.split_off(2).unwrap();
    assert_eq!(rest.count(), 4);
    assert_eq!(list.len(), 2);
    assert!(list.split_off(2).is_none());

    list.push_batch(rest);
    list.push_batch(batch);
    assert_eq!(list.len(), 10);

    let mut seen = HashSet::new();
    while let Some(slot) = list.pop() {
      assert!(seen.insert(slot.as_ptr() as usize));
    }
    assert_eq!(seen.len(), 10);
    assert!(list.is_empty());
  }

  #[test]
  fn remove_range_keeps_order_of_survivors() {
    let mut mem = blocks(6);
    let mut addrs: Vec<usize> = mem.iter_mut().map(|b| slot_of(b).as_ptr() as usize).collect();
    addrs.sort_unstable();

    let mut list = SlotList::new();
    for &a in &addrs {
      unsafe { list.push(NonNull::new(a as *mut Slot).unwrap()) };
    }

    // Remove the two lowest addresses.
    let mut removed = list.remove_range(addrs[0], addrs[1] + 1);
    assert_eq!(removed.len(), 2);
    assert_eq!(list.len(), 4);

    let order: Vec<usize> = std::iter::from_fn(|| list.pop().map(|s| s.as_ptr() as usize)).collect();
    assert_eq!(order, vec![addrs[5], addrs[4], addrs[3], addrs[2]]);

    list.append(&mut removed);
    assert_eq!(list.len(), 2);
    assert!(removed.is_empty());
  }
}
