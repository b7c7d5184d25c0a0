//! Lazy k-way merge of ordered sources.

use log::warn;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Head item of one source, ordered so that `BinaryHeap` pops the smallest
/// item first and, among equal items, the one from the lowest source index.
struct HeapEntry<T, F> {
    item: T,
    source: usize,
    cmp: F,
}

impl<T, F> Ord for HeapEntry<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cmp)(&other.item, &self.item).then_with(|| other.source.cmp(&self.source))
    }
}

impl<T, F> PartialOrd for HeapEntry<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, F> PartialEq for HeapEntry<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, F> Eq for HeapEntry<T, F> where F: Fn(&T, &T) -> Ordering {}

/// Merges ordered sources into a single ordered iterator.
///
/// At most one item per source is buffered. Equal items are emitted in source
/// order, so merging the parts of a stably sorted input keeps it stable.
///
/// If a source yields an error, the error is passed on and every remaining
/// source is dropped; the merger yields nothing afterwards.
pub struct BinaryHeapMerger<S, T, E, F> {
    sources: Vec<Option<S>>,
    heap: BinaryHeap<HeapEntry<T, F>>,
    cmp: F,
    initialized: bool,
    pending_error: Option<E>,
}

impl<S, T, E, F> BinaryHeapMerger<S, T, E, F>
where
    S: Iterator<Item = Result<T, E>>,
    F: Fn(&T, &T) -> Ordering + Copy,
{
    pub fn new<I>(sources: I, cmp: F) -> Self
    where
        I: IntoIterator<Item = S>,
    {
        let sources: Vec<_> = sources.into_iter().map(Some).collect();
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            cmp,
            initialized: false,
            pending_error: None,
        }
    }

    /// Number of sources being merged.
    pub fn fan_in(&self) -> usize {
        self.sources.len()
    }

    /// Pulls the next item of `source` into the heap, dropping the source once
    /// it is exhausted.
    fn advance(&mut self, source: usize) -> Result<(), E> {
        let next = match self.sources[source].as_mut() {
            Some(iter) => iter.next(),
            None => return Ok(()),
        };
        match next {
            Some(Ok(item)) => {
                self.heap.push(HeapEntry {
                    item,
                    source,
                    cmp: self.cmp,
                });
                Ok(())
            }
            Some(Err(err)) => Err(err),
            None => {
                self.sources[source] = None;
                Ok(())
            }
        }
    }

    fn abort(&mut self) {
        let pending = self.sources.iter().filter(|s| s.is_some()).count();
        warn!("merge aborted, dropping {} pending sources", pending);
        self.heap.clear();
        self.sources.clear();
    }
}

impl<S, T, E, F> Iterator for BinaryHeapMerger<S, T, E, F>
where
    S: Iterator<Item = Result<T, E>>,
    F: Fn(&T, &T) -> Ordering + Copy,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            self.abort();
            return Some(Err(err));
        }
        if !self.initialized {
            self.initialized = true;
            for source in 0..self.sources.len() {
                if let Err(err) = self.advance(source) {
                    self.abort();
                    return Some(Err(err));
                }
            }
        }

        let HeapEntry { item, source, .. } = self.heap.pop()?;
        if let Err(err) = self.advance(source) {
            // The popped item is still in order; report the failure on the next call.
            self.pending_error = Some(err);
        }
        Some(Ok(item))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.pending_error.is_some() {
            return (1, Some(1));
        }
        self.sources.iter().flatten().fold(
            (self.heap.len(), Some(self.heap.len())),
            |(lower, upper), source| {
                let (l, u) = source.size_hint();
                (
                    lower.saturating_add(l),
                    upper.and_then(|upper| u.and_then(|u| upper.checked_add(u))),
                )
            },
        )
    }
}

impl<S, T, E, F> ExactSizeIterator for BinaryHeapMerger<S, T, E, F>
where
    S: ExactSizeIterator<Item = Result<T, E>>,
    F: Fn(&T, &T) -> Ordering + Copy,
{
}
