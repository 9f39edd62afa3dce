//! Endless batch streams over finite sources

use crate::data::{Batch, DataLoader, LoaderIter};
use crate::Result;
use tracing::debug;

/// Something that can start a fresh pass over its batches
pub trait BatchSource {
    type Item;
    type Iter: Iterator<Item = Self::Item>;

    fn fresh_iter(&mut self) -> Result<Self::Iter>;
}

impl BatchSource for DataLoader {
    type Item = Result<Batch>;
    type Iter = LoaderIter;

    fn fresh_iter(&mut self) -> Result<LoaderIter> {
        self.iter()
    }
}

/// Restarts its source whenever a pass runs out
///
/// Callers never observe the boundary between passes. `next` returns `None`
/// only when a freshly started pass is itself empty.
pub struct InfiniteStream<S: BatchSource> {
    source: S,
    iter: Option<S::Iter>,
    passes: usize,
}

impl<S: BatchSource> InfiniteStream<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            iter: None,
            passes: 0,
        }
    }

    /// Completed wraparounds so far
    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn next(&mut self) -> Result<Option<S::Item>> {
        if let Some(iter) = self.iter.as_mut() {
            if let Some(item) = iter.next() {
                return Ok(Some(item));
            }
            self.passes += 1;
            debug!("Stream exhausted after pass {}, restarting", self.passes);
        }
        // Drop the finished pass before starting the next one
        self.iter = None;
        let mut iter = self.source.fresh_iter()?;
        let item = iter.next();
        self.iter = Some(iter);
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Counting {
        len: usize,
        fresh: usize,
    }

    impl BatchSource for Counting {
        type Item = usize;
        type Iter = std::ops::Range<usize>;

        fn fresh_iter(&mut self) -> Result<Self::Iter> {
            self.fresh += 1;
            Ok(0..self.len)
        }
    }

    #[test]
    fn test_wraps_without_signal() {
        let mut stream = InfiniteStream::new(Counting { len: 3, fresh: 0 });
        let got: Vec<usize> = (0..7).map(|_| stream.next().unwrap().unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(stream.passes(), 2);
        assert_eq!(stream.source().fresh, 3);
    }

    #[test]
    fn test_empty_source() {
        let mut stream = InfiniteStream::new(Counting { len: 0, fresh: 0 });
        assert!(stream.next().unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_never_exhausts(len in 1usize..20, factor in 10usize..15) {
            let mut stream = InfiniteStream::new(Counting { len, fresh: 0 });
            for call in 0..len * factor {
                let item = stream.next().unwrap();
                prop_assert_eq!(item, Some(call % len));
            }
            prop_assert_eq!(stream.passes(), factor - 1);
        }
    }
}
