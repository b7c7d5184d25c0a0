//! External sorting (i.e. on disk sorting) of iterators too large to fit in memory.
//!
//! The input is cut into parts of bounded size, each part is sorted in memory and
//! spilled to a temporary file, and the parts are merged back lazily.

mod merger;
mod part;
mod partition;
mod sort;

pub use merger::BinaryHeapMerger;
pub use part::{Part, PartError, PartReader};
pub use partition::{Partitioner, Partitioning, Runs};
pub use sort::{
    external_sort, ExternalSorter, ExternalSorterBuilder, NaturalOrder, SortError, SortedIter,
    DEFAULT_PART_SIZE,
};
