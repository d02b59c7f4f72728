//! Byte-counting stream decorator.

use bytes::Bytes;
use futures::{ready, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::provider::{ByteStream, ProgressFn, UploadOptions};
use stowage_common::Result;

/// Read-through stream that reports cumulative bytes to a callback.
///
/// The callback fires once per non-empty chunk with
/// `(bytes_so_far, declared_total)`. Errors and end of stream pass through
/// untouched.
pub struct ProgressStream<S> {
    inner: S,
    total: u64,
    transferred: u64,
    callback: ProgressFn,
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, total: u64, callback: ProgressFn) -> Self {
        Self {
            inner,
            total,
            transferred: 0,
            callback,
        }
    }

    /// Bytes seen so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let item = ready!(this.inner.poll_next_unpin(cx));
        if let Some(Ok(chunk)) = &item {
            if !chunk.is_empty() {
                this.transferred += chunk.len() as u64;
                (this.callback)(this.transferred, this.total);
            }
        }
        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Wrap `stream` with the progress callback from `options`, if any.
pub fn track_upload(stream: ByteStream, options: &UploadOptions) -> ByteStream {
    match &options.progress {
        Some(callback) => Box::pin(ProgressStream::new(
            stream,
            options.content_length.unwrap_or(0),
            callback.clone(),
        )),
        None => stream,
    }
}
