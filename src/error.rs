use thiserror::Error;

/// Failure of an allocation-path operation.
///
/// Contract violations (freeing into the wrong class, a span lookup miss) are
/// not represented here: they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// The underlying allocator or page provider could not supply memory.
  #[error("underlying allocator could not supply {bytes} bytes")]
  Exhausted { bytes: usize },

  /// The request is larger than the largest size class of this tier.
  #[error("request of {size} bytes exceeds the largest size class ({max} bytes)")]
  Oversized { size: usize, max: usize },

  #[error("page provider refused to release {pages} pages at {addr:#x}")]
  ReleaseFailed { addr: usize, pages: usize },
}
