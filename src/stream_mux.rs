//! Fan-in of independently paced streams.
//!
//! Every active source has exactly one pull in flight. Whichever pull
//! resolves first is emitted with its source tag and that source is
//! re-armed straight away; a source that ends leaves the race for good.
//! The merged stream ends once every source has ended.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, FuturesUnordered, Stream, StreamExt};
use futures_util::FutureExt;

/// One value out of the merged stream, tagged with the source it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent<K, T> {
    pub source: K,
    pub payload: T,
}

type Pull<K, T> = BoxFuture<'static, (K, Option<T>, BoxStream<'static, T>)>;

pub struct StreamMux<K, T> {
    pulls: FuturesUnordered<Pull<K, T>>,
}

impl<K, T> StreamMux<K, T>
where
    K: Clone + Send + 'static,
    T: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            pulls: FuturesUnordered::new(),
        }
    }

    /// Add a source to the race.
    pub fn push(&mut self, source: K, stream: BoxStream<'static, T>) {
        self.pulls.push(Self::pull(source, stream));
    }

    pub fn with(mut self, source: K, stream: BoxStream<'static, T>) -> Self {
        self.push(source, stream);
        self
    }

    /// Number of sources that have not ended yet.
    pub fn len(&self) -> usize {
        self.pulls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pulls.is_empty()
    }

    fn pull(source: K, stream: BoxStream<'static, T>) -> Pull<K, T> {
        stream
            .into_future()
            .map(move |(item, rest)| (source, item, rest))
            .boxed()
    }
}

impl<K, T> Default for StreamMux<K, T>
where
    K: Clone + Send + 'static,
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> FromIterator<(K, BoxStream<'static, T>)> for StreamMux<K, T>
where
    K: Clone + Send + 'static,
    T: Send + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, BoxStream<'static, T>)>>(iter: I) -> Self {
        let mut mux = Self::new();
        for (source, stream) in iter {
            mux.push(source, stream);
        }
        mux
    }
}

impl<K, T> Stream for StreamMux<K, T>
where
    K: Clone + Send + 'static,
    T: Send + 'static,
{
    type Item = StreamEvent<K, T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.pulls.poll_next_unpin(cx) {
                Poll::Ready(Some((source, Some(payload), rest))) => {
                    // re-arm before handing the value out
                    let next = Self::pull(source.clone(), rest);
                    self.pulls.push(next);
                    return Poll::Ready(Some(StreamEvent { source, payload }));
                }
                // source exhausted, drop it from the race
                Poll::Ready(Some((_, None, _))) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
