//! Segregated-fit heap with boundary tags
//!
//! The heap lives in a single growable [`BackingStore`]. All metadata, the
//! free-list heads included, is stored inside the heap as heap-relative
//! offsets.

mod backing;
mod boundary_tag;
mod checker;
pub mod free_list;
pub mod layout;
mod seg_heap;
mod size_class;

pub use backing::{BackingStore, OwnedRegion, RawRegion};
pub use boundary_tag::{BlockStatus, BoundaryTag};
pub use checker::{BlockInfo, HeapCheckError, HeapReport};
pub use layout::WordMemory;
pub use seg_heap::SegregatedHeap;
pub use size_class::SizeClass;
