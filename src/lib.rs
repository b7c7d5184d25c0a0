//! External merge sort for iterators and text files that don't fit in memory.
//!
//! Items are cut into parts of at most `part_size` items, each part is sorted
//! and spilled to a temporary file, and the parts are merged back lazily with a
//! binary heap. Items are serialized with bincode, so they need to implement
//! [`bincode::Encode`] and [`bincode::Decode`].
//!
//! ```
//! use spill_sort::extsort::ExternalSorterBuilder;
//!
//! let sorter = ExternalSorterBuilder::new()
//!     .with_part_size(100)
//!     .build()
//!     .unwrap();
//! let sorted = sorter.sort((0..1000u32).rev()).unwrap();
//! let sorted: Vec<u32> = sorted.collect::<Result<_, _>>().unwrap();
//! assert_eq!(sorted, (0..1000).collect::<Vec<_>>());
//! ```

pub mod extsort;
pub mod io;

pub use extsort::{external_sort, ExternalSorter, ExternalSorterBuilder, SortError};
pub use io::{sort_file_in_place, sort_file_in_place_by};
