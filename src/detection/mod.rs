//! Stream detection: classification, canonicalization, per-tab context

pub mod classifier;
pub mod context;
pub mod normalizer;

pub use classifier::{classify, SegmentHints};
pub use context::DetectionContext;
pub use normalizer::{base_directory, canonicalize, canonicalize_with_mime};
