//! Merge-based set difference over key-sorted streams.
//!
//! Both inputs must be ascending by key. Disorder is detected in O(1) per
//! item and surfaces as a [`SortOrderViolation`] instead of a wrong result.

use std::cmp::Ordering;
use std::fmt;
use std::iter::Peekable;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSide {
    /// The stream items are taken from.
    Left,
    /// The stream whose keys are subtracted.
    Right,
}

impl fmt::Display for StreamSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSide::Left => f.write_str("left"),
            StreamSide::Right => f.write_str("right"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{side} stream is not sorted by key: {current} follows {previous}")]
pub struct SortOrderViolation {
    pub side: StreamSide,
    pub previous: String,
    pub current: String,
}

fn violation<K: fmt::Debug>(side: StreamSide, previous: &K, current: &K) -> SortOrderViolation {
    SortOrderViolation {
        side,
        previous: format!("{previous:?}"),
        current: format!("{current:?}"),
    }
}

/// Lazy iterator returned by [`streaming_set_difference`].
pub struct SetDifference<A, B, F, K>
where
    B: Iterator,
{
    left: A,
    right: Peekable<B>,
    key: F,
    last_left: Option<K>,
    last_right: Option<K>,
    finished: bool,
}

/// Yields every item of `left` whose key does not occur in `right`.
///
/// Single forward pass with two cursors: O(n + m) time and no buffering
/// beyond one peeked item of `right`. Equal keys on the same side are
/// allowed. Once `left` is exhausted the rest of `right` is still read so
/// that its ordering is validated as well.
pub fn streaming_set_difference<T, E, K, A, B, F>(
    left: A,
    right: B,
    key: F,
) -> SetDifference<A::IntoIter, B::IntoIter, F, K>
where
    A: IntoIterator<Item = Result<T, E>>,
    B: IntoIterator<Item = Result<T, E>>,
    F: FnMut(&T) -> K,
    K: Ord + fmt::Debug,
    E: From<SortOrderViolation>,
{
    SetDifference {
        left: left.into_iter(),
        right: right.into_iter().peekable(),
        key,
        last_left: None,
        last_right: None,
        finished: false,
    }
}

impl<T, E, K, A, B, F> SetDifference<A, B, F, K>
where
    A: Iterator<Item = Result<T, E>>,
    B: Iterator<Item = Result<T, E>>,
    F: FnMut(&T) -> K,
    K: Ord + fmt::Debug,
    E: From<SortOrderViolation>,
{
    fn drain_right(&mut self) -> Option<E> {
        for next in self.right.by_ref() {
            let item = match next {
                Ok(item) => item,
                Err(err) => return Some(err),
            };
            let key = (self.key)(&item);
            if let Some(previous) = &self.last_right {
                if key < *previous {
                    return Some(violation(StreamSide::Right, previous, &key).into());
                }
            }
            self.last_right = Some(key);
        }
        None
    }
}

impl<T, E, K, A, B, F> Iterator for SetDifference<A, B, F, K>
where
    A: Iterator<Item = Result<T, E>>,
    B: Iterator<Item = Result<T, E>>,
    F: FnMut(&T) -> K,
    K: Ord + fmt::Debug,
    E: From<SortOrderViolation>,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let item = match self.left.next() {
                Some(Ok(item)) => item,
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(Err(err));
                }
                None => {
                    self.finished = true;
                    return self.drain_right().map(Err);
                }
            };

            let key = (self.key)(&item);
            if let Some(previous) = &self.last_left {
                if key < *previous {
                    self.finished = true;
                    return Some(Err(violation(StreamSide::Left, previous, &key).into()));
                }
            }

            let present_in_right = loop {
                let right_key = match self.right.peek() {
                    None => break false,
                    Some(Ok(peeked)) => Some((self.key)(peeked)),
                    Some(Err(_)) => None,
                };
                let Some(right_key) = right_key else {
                    self.finished = true;
                    return self.right.next();
                };
                if let Some(previous) = &self.last_right {
                    if right_key < *previous {
                        self.finished = true;
                        return Some(Err(
                            violation(StreamSide::Right, previous, &right_key).into()
                        ));
                    }
                }
                match right_key.cmp(&key) {
                    Ordering::Less => {
                        self.right.next();
                        self.last_right = Some(right_key);
                    }
                    Ordering::Equal => break true,
                    Ordering::Greater => break false,
                }
            };

            self.last_left = Some(key);
            if !present_in_right {
                return Some(Ok(item));
            }
        }
    }
}
