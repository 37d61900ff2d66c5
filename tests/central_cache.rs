use std::{
  ptr::NonNull,
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use tiercache::{
  AllocError, CentralCache, DelayPolicy, OsPages, PAGE_SIZE, PageProvider, Span,
  size_class::{batch_size, class_size},
};

/// Provider that remembers every outstanding span.
#[derive(Default)]
struct Ledgered {
  live: Arc<Mutex<Vec<(usize, usize)>>>,
  acquires: AtomicUsize,
}

unsafe impl PageProvider for Ledgered {
  fn acquire_span(&self, bytes: usize) -> Result<Span, AllocError> {
    let span = OsPages.acquire_span(bytes)?;
    self.acquires.fetch_add(1, Ordering::Relaxed);
    self.live.lock().unwrap().push((span.base.as_ptr() as usize, span.pages));
    Ok(span)
  }

  unsafe fn release_span(&self, base: NonNull<u8>, pages: usize) -> Result<(), AllocError> {
    let mut live = self.live.lock().unwrap();
    let at = live
      .iter()
      .position(|&entry| entry == (base.as_ptr() as usize, pages))
      .expect("released a span that was never acquired");
    live.swap_remove(at);
    unsafe { OsPages.release_span(base, pages) }
  }
}

fn drain<P: PageProvider>(cache: &CentralCache<P>, index: usize, blocks: usize) -> Vec<(NonNull<u8>, usize)> {
  let mut batches = Vec::new();
  let mut got = 0;
  while got < blocks {
    let batch = cache.fetch_range(index).unwrap();
    got += batch.count();
    batches.push((batch.head(), batch.count()));
  }
  batches
}

#[test]
fn batch_sizes_are_whole_blocks_of_the_class() {
  let cache = CentralCache::new(Ledgered::default());
  for index in [0, 1, 5, 63, 255, 1023] {
    let size = class_size(index);
    let batch = cache.fetch_range(index).unwrap();
    assert_eq!(batch.count(), batch_size(size).min(cache.snapshot(index).capacity));
    let blocks: Vec<_> = unsafe { batch.blocks() }.collect();
    assert_eq!(blocks.len(), batch.count());
    for block in blocks {
      assert_eq!(block.as_ptr() as usize % size, 0);
    }
  }
  assert_eq!(cache.provider().acquires.load(Ordering::Relaxed), 6);
}

#[test]
fn draining_a_span_pulls_exactly_one_more() {
  let cache = CentralCache::new(Ledgered::default());
  let index = 63;
  let first = cache.fetch_range(index).unwrap();
  let per_span = cache.snapshot(index).capacity;

  let mut held = drain(&cache, index, per_span - first.count());
  held.push((first.head(), first.count()));
  assert_eq!(cache.provider().acquires.load(Ordering::Relaxed), 1);
  assert_eq!(cache.snapshot(index).free_blocks, 0);

  let extra = cache.fetch_range(index).unwrap();
  assert_eq!(cache.provider().acquires.load(Ordering::Relaxed), 2);
  assert_eq!(cache.snapshot(index).spans, 2);

  for (head, count) in held {
    unsafe { cache.return_range(head, count, index) };
  }
  unsafe { cache.return_range(extra.head(), extra.count(), index) };

  let snap = cache.snapshot(index);
  assert_eq!(snap.free_spans, snap.spans);
}

#[test]
fn churn_releases_nothing_before_the_delay_expires() {
  let policy = DelayPolicy::default()
    .with_max_delay_count(10)
    .with_min_delay_interval(Duration::from_secs(3600));
  let cache = CentralCache::with_policy(Ledgered::default(), policy);
  let index = 3;

  for round in 1..10 {
    let batch = cache.fetch_range(index).unwrap();
    unsafe { cache.return_range(batch.head(), batch.count(), index) };
    assert_eq!(cache.snapshot(index).delay_count, round);
  }
  assert_eq!(cache.provider().live.lock().unwrap().len(), 1);

  let batch = cache.fetch_range(index).unwrap();
  unsafe { cache.return_range(batch.head(), batch.count(), index) };
  assert!(cache.provider().live.lock().unwrap().is_empty());
  assert_eq!(cache.provider().acquires.load(Ordering::Relaxed), 1);
}

#[test]
fn dropping_the_cache_returns_every_span() {
  let provider = Ledgered::default();
  let live = provider.live.clone();
  {
    let cache = CentralCache::new(provider);
    for index in 0..16 {
      cache.fetch_range(index).unwrap();
    }
    let spans = live.lock().unwrap().clone();
    assert_eq!(spans.len(), 16);
    assert!(spans.iter().all(|&(base, _)| base % PAGE_SIZE == 0));
  }
  assert!(live.lock().unwrap().is_empty());
}
