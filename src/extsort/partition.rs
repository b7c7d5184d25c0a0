//! Splitting an input stream into bounded in-memory chunks.

use std::cmp::Ordering;

use crate::extsort::sort::SortError;

/// How the input stream is cut into chunks before spilling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Partitioning {
    /// Consecutive groups of exactly `part_size` items (the last may be shorter).
    #[default]
    Fixed,
    /// Maximal non-descending runs, each capped at `part_size` items.
    NaturalRuns,
}

fn check_part_size(part_size: usize) -> Result<(), SortError> {
    if part_size == 0 {
        Err(SortError::InvalidConfiguration(
            "part size must be at least 1".to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Groups items of the underlying iterator into chunks of up to `part_size` items.
///
/// This is pure grouping: items keep their input order and no chunk is ever empty.
pub struct Partitioner<I> {
    iter: I,
    part_size: usize,
}

impl<I: Iterator> Partitioner<I> {
    pub fn new(iter: I, part_size: usize) -> Result<Self, SortError> {
        check_part_size(part_size)?;
        Ok(Self { iter, part_size })
    }
}

impl<I: Iterator> Iterator for Partitioner<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk: Vec<_> = self.iter.by_ref().take(self.part_size).collect();
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    }
}

/// Groups items into maximal runs that are already in order under `cmp`.
///
/// A run ends when the next item compares strictly less than the previous one,
/// or when it reaches `part_size` items.
pub struct Runs<I: Iterator, F> {
    iter: I,
    part_size: usize,
    cmp: F,
    pending: Option<I::Item>,
}

impl<I, F> Runs<I, F>
where
    I: Iterator,
    F: Fn(&I::Item, &I::Item) -> Ordering,
{
    pub fn new(iter: I, part_size: usize, cmp: F) -> Result<Self, SortError> {
        check_part_size(part_size)?;
        Ok(Self { iter, part_size, cmp, pending: None })
    }
}

impl<I, F> Iterator for Runs<I, F>
where
    I: Iterator,
    F: Fn(&I::Item, &I::Item) -> Ordering,
{
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.pending.take().or_else(|| self.iter.next())?;
        let mut run = vec![first];
        while run.len() < self.part_size {
            match self.iter.next() {
                None => break,
                Some(item) => {
                    let descends = run
                        .last()
                        .map_or(false, |last| (self.cmp)(&item, last) == Ordering::Less);
                    if descends {
                        self.pending = Some(item);
                        break;
                    }
                    run.push(item);
                }
            }
        }
        Some(run)
    }
}
