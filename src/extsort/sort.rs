use crate::extsort::merger::BinaryHeapMerger;
use crate::extsort::part::{Part, PartError, PartReader};
use crate::extsort::partition::{Partitioner, Partitioning, Runs};

use bincode::{self, Decode, Encode};
use itertools::Either;
use log::info;
use rayon::slice::ParallelSliceMut;
use std::{
    cmp::Ordering,
    convert::Infallible,
    error::Error,
    fmt::{self, Display},
    io,
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
};

/// Default number of items held in memory per part.
pub const DEFAULT_PART_SIZE: usize = 1024;

/// Comparator used by the `Ord`-based sorting methods.
pub type NaturalOrder<T> = fn(&T, &T) -> Ordering;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Invalid sorter settings, e.g. a zero part size.
    InvalidConfiguration(String),
    /// Temporary directory or file creation error.
    Resource(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Data serialization error.
    SerializationError(bincode::error::EncodeError),
    /// Data deserialization error.
    DeserializationError(bincode::error::DecodeError),
    /// A single-pass sequence was read again after completion.
    ExhaustedSequence,
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::InvalidConfiguration(_) => None,
            SortError::Resource(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::SerializationError(err) => Some(err),
            SortError::DeserializationError(err) => Some(err),
            SortError::ExhaustedSequence => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::InvalidConfiguration(msg) => write!(f, "invalid configuration: {}", msg),
            SortError::Resource(err) => {
                write!(f, "temporary directory or file not created: {}", err)
            }
            SortError::ThreadPoolBuildError(err) => {
                write!(f, "thread pool initialization failed: {}", err)
            }
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::SerializationError(err) => write!(f, "data serialization error: {}", err),
            SortError::DeserializationError(err) => {
                write!(f, "data deserialization error: {}", err)
            }
            SortError::ExhaustedSequence => write!(f, "sequence already consumed"),
        }
    }
}

impl From<PartError> for SortError {
    fn from(err: PartError) -> Self {
        match err {
            PartError::Resource(err) => SortError::Resource(err),
            PartError::IO(err) => SortError::IO(err),
            PartError::Encode(err) => SortError::SerializationError(err),
            PartError::Decode(err) => SortError::DeserializationError(err),
            PartError::ExhaustedSequence => SortError::ExhaustedSequence,
        }
    }
}

impl From<io::Error> for SortError {
    fn from(err: io::Error) -> Self {
        SortError::IO(err)
    }
}

impl From<Infallible> for SortError {
    fn from(err: Infallible) -> Self {
        match err {}
    }
}

/// Configures an [`ExternalSorter`].
pub struct ExternalSorterBuilder {
    part_size: usize,
    tmp_dir: Option<PathBuf>,
    num_threads: Option<usize>,
    partitioning: Partitioning,
}

impl Default for ExternalSorterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalSorterBuilder {
    pub fn new() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            tmp_dir: None,
            num_threads: None,
            partitioning: Partitioning::Fixed,
        }
    }

    /// Sets the maximum number of items in each part.
    ///
    /// This number of items needs to fit in memory. While sorting, a
    /// in-memory buffer is used to collect the items to be sorted. Once
    /// it reaches the maximum size, it is sorted and then written to disk.
    ///
    /// Using a higher part size makes sorting faster by leveraging
    /// faster in-memory operations, and lowers the merge fan-in.
    pub fn with_part_size(mut self, size: usize) -> Self {
        self.part_size = size;
        self
    }

    /// Sets the directory under which the sorter's temporary directory is created.
    pub fn with_tmp_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.tmp_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets how the input is cut into parts.
    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = partitioning;
        self
    }

    /// Sets the number of threads used to sort and spill parts.
    ///
    /// This may not be needed if the parts aren't big enough for parallelism
    /// to be gainful over the overhead of multithreading.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn build(self) -> Result<ExternalSorter, SortError> {
        if self.part_size == 0 {
            return Err(SortError::InvalidConfiguration(
                "part size must be at least 1".to_string(),
            ));
        }
        Ok(ExternalSorter {
            part_size: self.part_size,
            partitioning: self.partitioning,
            tmp_dir: Arc::new(_init_tmp_directory(self.tmp_dir.as_deref())?),
            thread_pool: _init_thread_pool(self.num_threads)?,
        })
    }
}

/// Exposes external sorting (i.e. on disk sorting) capability on arbitrarily
/// sized iterator, even if the generated content of the iterator doesn't fit in
/// memory.
pub struct ExternalSorter {
    part_size: usize,
    partitioning: Partitioning,
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory to be used to store temporary data. Shared with every
    /// [`SortedIter`] so it outlives the sorter while parts are still read.
    tmp_dir: Arc<tempfile::TempDir>,
}

/// Ordered items produced by [`ExternalSorter`].
///
/// Each part's file is removed once it has been fully merged. Dropping the
/// iterator early removes the remaining ones.
pub struct SortedIter<T, F> {
    merger: BinaryHeapMerger<PartReader<T>, T, PartError, F>,
    _tmp_dir: Arc<tempfile::TempDir>,
}

impl<T, F> SortedIter<T, F>
where
    T: Decode<()>,
    F: Fn(&T, &T) -> Ordering + Copy,
{
    /// Number of parts being merged.
    pub fn num_parts(&self) -> usize {
        self.merger.fan_in()
    }
}

impl<T, F> Iterator for SortedIter<T, F>
where
    T: Decode<()>,
    F: Fn(&T, &T) -> Ordering + Copy,
{
    type Item = Result<T, PartError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.merger.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.merger.size_hint()
    }
}

impl<T, F> ExactSizeIterator for SortedIter<T, F>
where
    T: Decode<()>,
    F: Fn(&T, &T) -> Ordering + Copy,
{
}

impl ExternalSorter {
    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Directory holding the spilled parts.
    pub fn tmp_dir(&self) -> &Path {
        self.tmp_dir.path()
    }

    /// Sorts data from the input.
    /// Returns an iterator that can be used to get sorted data stream.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    pub fn sort<I, T>(&self, input: I) -> Result<SortedIter<T, NaturalOrder<T>>, SortError>
    where
        T: Encode + Decode<()> + Send + Ord,
        I: IntoIterator<Item = T>,
    {
        self.sort_by(input, T::cmp as NaturalOrder<T>)
    }

    /// Sorts a given iterator with a comparator function, returning a new iterator with items
    pub fn sort_by<I, T, F>(&self, input: I, cmp: F) -> Result<SortedIter<T, F>, SortError>
    where
        T: Encode + Decode<()> + Send,
        I: IntoIterator<Item = T>,
        F: Fn(&T, &T) -> Ordering + Sync + Send + Copy,
    {
        self.try_sort_by(input.into_iter().map(Ok::<T, Infallible>), cmp)
    }

    /// Sorts a fallible input. The first input error aborts the sort and
    /// removes every part spilled so far.
    pub fn try_sort<I, T, E>(&self, input: I) -> Result<SortedIter<T, NaturalOrder<T>>, SortError>
    where
        T: Encode + Decode<()> + Send + Ord,
        I: IntoIterator<Item = Result<T, E>>,
        SortError: From<E>,
    {
        self.try_sort_by(input, T::cmp as NaturalOrder<T>)
    }

    pub fn try_sort_by<I, T, E, F>(&self, input: I, cmp: F) -> Result<SortedIter<T, F>, SortError>
    where
        T: Encode + Decode<()> + Send,
        I: IntoIterator<Item = Result<T, E>>,
        SortError: From<E>,
        F: Fn(&T, &T) -> Ordering + Sync + Send + Copy,
    {
        let parts = itertools::process_results(input, |items| -> Result<_, SortError> {
            match self.partitioning {
                Partitioning::Fixed => {
                    self.spill_all(Partitioner::new(items, self.part_size)?, cmp)
                }
                Partitioning::NaturalRuns => {
                    self.spill_all(Runs::new(items, self.part_size, cmp)?, cmp)
                }
            }
        })??;
        Ok(self.merge(parts, cmp))
    }

    /// Like [`ExternalSorter::sort`], but sorts and spills several parts at
    /// once on the thread pool.
    ///
    /// Up to one chunk per worker thread is held in memory in addition to the
    /// one being filled. The output is identical to the sequential sort.
    pub fn par_sort<I, T>(&self, input: I) -> Result<SortedIter<T, NaturalOrder<T>>, SortError>
    where
        T: Encode + Decode<()> + Send + Ord + 'static,
        I: IntoIterator<Item = T>,
    {
        self.par_sort_by(input, T::cmp as NaturalOrder<T>)
    }

    /// Sorts a given iterator with a comparator function, spilling parts concurrently.
    pub fn par_sort_by<I, T, F>(&self, input: I, cmp: F) -> Result<SortedIter<T, F>, SortError>
    where
        I: IntoIterator<Item = T>,
        T: Encode + Decode<()> + Send + 'static,
        F: Fn(&T, &T) -> Ordering + Sync + Send + Copy + 'static,
    {
        // We'll get created parts back through this channel, tagged with their chunk index.
        let (tx, rx) = mpsc::channel::<(usize, Result<Part<T>, PartError>)>();
        let tmp_dir_path: PathBuf = self.tmp_dir.path().to_path_buf();
        let max_in_flight = self.thread_pool.current_num_threads().max(1);

        let mut parts: Vec<(usize, Part<T>)> = Vec::new();
        let mut first_error: Option<PartError> = None;

        // PRODUCER: runs on the caller's thread -> iterator never crosses threads.
        let mut chunks = match self.partitioning {
            Partitioning::Fixed => {
                Either::Left(Partitioner::new(input.into_iter(), self.part_size)?)
            }
            Partitioning::NaturalRuns => {
                Either::Right(Runs::new(input.into_iter(), self.part_size, cmp)?)
            }
        }
        .enumerate();
        let mut in_flight = 0;
        loop {
            while let Ok(done) = rx.try_recv() {
                in_flight -= 1;
                collect_part(done, &mut parts, &mut first_error);
            }
            // Wait for a worker before reading more input, bounding buffered chunks.
            if in_flight >= max_in_flight {
                if let Ok(done) = rx.recv() {
                    in_flight -= 1;
                    collect_part(done, &mut parts, &mut first_error);
                }
            }
            // Stop reading input as soon as any part failed.
            if first_error.is_some() {
                break;
            }
            let Some((index, chunk)) = chunks.next() else {
                break;
            };

            let txc = tx.clone();
            let tmp = tmp_dir_path.clone();
            self.thread_pool.spawn(move || {
                let res = Part::spill(&tmp, chunk, cmp);
                let _ = txc.send((index, res));
            });
            in_flight += 1;
        }

        // Drop last sender so rx finishes once all tasks send their result.
        drop(tx);

        // CONSUMER: every task is awaited even after a failure so that no part
        // is left behind.
        for done in rx.iter() {
            collect_part(done, &mut parts, &mut first_error);
        }
        if let Some(err) = first_error {
            return Err(err.into());
        }

        parts.sort_unstable_by_key(|(index, _)| *index);
        let parts: Vec<Part<T>> = parts.into_iter().map(|(_, part)| part).collect();
        self.log_spilled(&parts);
        Ok(self.merge(parts, cmp))
    }

    fn spill_all<C, T, F>(&self, chunks: C, cmp: F) -> Result<Vec<Part<T>>, SortError>
    where
        C: Iterator<Item = Vec<T>>,
        T: Encode + Send,
        F: Fn(&T, &T) -> Ordering + Sync + Send + Copy,
    {
        let mut parts = Vec::new();
        for chunk in chunks {
            parts.push(self.create_part(chunk, cmp)?);
        }
        self.log_spilled(&parts);
        Ok(parts)
    }

    fn create_part<T, F>(&self, mut buffer: Vec<T>, compare: F) -> Result<Part<T>, SortError>
    where
        T: Encode + Send,
        F: Fn(&T, &T) -> Ordering + Sync + Send,
    {
        self.thread_pool.install(|| {
            buffer.par_sort_by(compare);
        });
        Part::from_sorted(self.tmp_dir.path(), buffer).map_err(SortError::from)
    }

    fn merge<T, F>(&self, parts: Vec<Part<T>>, cmp: F) -> SortedIter<T, F>
    where
        T: Decode<()>,
        F: Fn(&T, &T) -> Ordering + Copy,
    {
        SortedIter {
            merger: BinaryHeapMerger::new(parts.into_iter().map(Part::into_reader), cmp),
            _tmp_dir: Arc::clone(&self.tmp_dir),
        }
    }

    fn log_spilled<T>(&self, parts: &[Part<T>]) {
        let items: usize = parts.iter().map(Part::len).sum();
        let bytes: u64 = parts.iter().map(Part::bytes).sum();
        info!(
            "spilled {} items into {} parts ({} bytes) under {}",
            items,
            parts.len(),
            bytes,
            self.tmp_dir.path().display()
        );
    }
}

fn collect_part<T>(
    (index, res): (usize, Result<Part<T>, PartError>),
    parts: &mut Vec<(usize, Part<T>)>,
    first_error: &mut Option<PartError>,
) {
    match res {
        Ok(part) => parts.push((index, part)),
        Err(err) => {
            if first_error.is_none() {
                *first_error = Some(err);
            }
        }
    }
}

/// Sorts `input` with parts of at most `part_size` items, spilled to a fresh
/// temporary directory.
pub fn external_sort<I, T>(
    input: I,
    part_size: usize,
) -> Result<SortedIter<T, NaturalOrder<T>>, SortError>
where
    T: Encode + Decode<()> + Send + Ord,
    I: IntoIterator<Item = T>,
{
    ExternalSorterBuilder::new()
        .with_part_size(part_size)
        .num_threads(1)
        .build()?
        .sort(input)
}

fn _init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir, SortError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("spill-sort-");
    let tmp_dir = if let Some(tmp_path) = tmp_path {
        builder.tempdir_in(tmp_path)
    } else {
        builder.tempdir()
    };
    tmp_dir.map_err(SortError::Resource)
}

fn _init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
    let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();
    if let Some(threads_number) = threads_number {
        thread_pool_builder = thread_pool_builder.num_threads(threads_number);
    }
    thread_pool_builder
        .build()
        .map_err(SortError::ThreadPoolBuildError)
}
