use core::ptr::{NonNull, null_mut};

use crate::{AllocError, PAGE_SIZE, align_up};

/// A run of contiguous pages handed out by a [`PageProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
  pub base: NonNull<u8>,
  pub pages: usize,
}

impl Span {
  pub fn bytes(&self) -> usize {
    self.pages * PAGE_SIZE
  }

  pub fn end(&self) -> usize {
    self.base.as_ptr() as usize + self.bytes()
  }
}

unsafe impl Send for Span {}

/// Page-granularity backing store for the central cache.
///
/// # Safety
/// `acquire_span` must return page-aligned memory of at least the requested
/// size that no one else uses until it comes back through `release_span`.
pub unsafe trait PageProvider: Sync {
  fn acquire_span(&self, bytes: usize) -> Result<Span, AllocError>;

  /// # Safety
  /// `base` and `pages` must describe a span obtained from `acquire_span` on
  /// this provider that has not been released yet. Its memory must not be
  /// touched afterwards.
  unsafe fn release_span(&self, base: NonNull<u8>, pages: usize) -> Result<(), AllocError>;
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) -> bool {
  unsafe { libc::munmap(ptr.cast(), size) == 0 }
}

/// Maps spans straight from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPages;

unsafe impl PageProvider for OsPages {
  fn acquire_span(&self, bytes: usize) -> Result<Span, AllocError> {
    if bytes > isize::MAX as usize - PAGE_SIZE {
      return Err(AllocError::Exhausted { bytes });
    }
    let size = align_up(bytes.max(1), PAGE_SIZE);
    let base = NonNull::new(unsafe { os_mmap(size) }).ok_or(AllocError::Exhausted { bytes: size })?;

    Ok(Span {
      base,
      pages: size / PAGE_SIZE,
    })
  }

  unsafe fn release_span(&self, base: NonNull<u8>, pages: usize) -> Result<(), AllocError> {
    if unsafe { os_munmap(base.as_ptr(), pages * PAGE_SIZE) } {
      Ok(())
    } else {
      Err(AllocError::ReleaseFailed {
        addr: base.as_ptr() as usize,
        pages,
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn spans_are_page_aligned_and_rounded() {
    let span = OsPages.acquire_span(PAGE_SIZE + 1).unwrap();
    assert_eq!(span.pages, 2);
    assert_eq!(span.base.as_ptr() as usize % PAGE_SIZE, 0);
    assert_eq!(span.end() - span.base.as_ptr() as usize, 2 * PAGE_SIZE);

    unsafe {
      span.base.as_ptr().write_bytes(0xAB, span.bytes());
      OsPages.release_span(span.base, span.pages).unwrap();
    }
  }

  #[test]
  fn impossible_request_is_exhaustion() {
    let err = OsPages.acquire_span(usize::MAX / 2).unwrap_err();
    assert!(matches!(err, AllocError::Exhausted { .. }));
  }
}
