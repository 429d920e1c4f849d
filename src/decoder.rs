//! Classifies a completion stream by its first fragment.
//!
//! A completion either streams reply text or streams tool calls.  The first
//! fragment decides which: a fragment with tool-call deltas opens a tool-call
//! stream whatever its text says (Ollama sends `"content": ""` alongside the
//! first call), a fragment with only text (even the empty string) opens a
//! content stream, and anything else opens a tool-call stream.  The fragment
//! that was inspected is not lost; it is handed back at the front of a
//! [`Replay`] stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};

use crate::error::Result;
use crate::types::ChatCompletionChunk;

/// A stream that yields one buffered item before continuing with its source.
pub struct Replay<S> {
    first: Option<Result<ChatCompletionChunk>>,
    inner: S,
}

impl<S> Replay<S> {
    /// Wrap `inner`, yielding `first` (if any) before anything from `inner`.
    pub fn new(first: Option<Result<ChatCompletionChunk>>, inner: S) -> Self {
        Self { first, inner }
    }

    /// Returns the buffered item without consuming it.
    pub fn peek(&self) -> Option<&Result<ChatCompletionChunk>> {
        self.first.as_ref()
    }
}

impl<S> Stream for Replay<S>
where
    S: Stream<Item = Result<ChatCompletionChunk>> + Unpin,
{
    type Item = Result<ChatCompletionChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(first) = self.first.take() {
            return Poll::Ready(Some(first));
        }
        self.inner.poll_next_unpin(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let extra = usize::from(self.first.is_some());
        let (lower, upper) = self.inner.size_hint();
        (
            lower.saturating_add(extra),
            upper.and_then(|upper| upper.checked_add(extra)),
        )
    }
}

/// The two shapes a completion stream can take.
pub enum DecodedStream<S> {
    /// Reply text; every fragment goes to the caller.
    Content(Replay<S>),
    /// Tool calls; every fragment goes to the tool invoker.
    ToolCalls(Replay<S>),
}

impl<S> DecodedStream<S> {
    /// Returns true for a content stream.
    pub fn is_content(&self) -> bool {
        matches!(self, DecodedStream::Content(_))
    }

    /// Returns the underlying replay stream regardless of classification.
    pub fn into_inner(self) -> Replay<S> {
        match self {
            DecodedStream::Content(replay) | DecodedStream::ToolCalls(replay) => replay,
        }
    }
}

/// Read one fragment from `stream` and classify the stream.
///
/// Tool-call deltas in the first fragment win over any text it carries.  An
/// error in the first position is returned directly.  An empty stream is
/// treated as a content stream with nothing in it.
///
/// ```
/// # tokio_test::block_on(async {
/// use eddie::{ChatCompletionChunk, decode};
/// use futures::stream;
///
/// let fragments = stream::iter(vec![Ok(ChatCompletionChunk::content("Hi"))]);
/// let decoded = decode(fragments).await.unwrap();
/// assert!(decoded.is_content());
/// # });
/// ```
pub async fn decode<S>(mut stream: S) -> Result<DecodedStream<S>>
where
    S: Stream<Item = Result<ChatCompletionChunk>> + Unpin,
{
    match stream.next().await {
        None => Ok(DecodedStream::Content(Replay::new(None, stream))),
        Some(Err(err)) => Err(err),
        Some(Ok(first)) => {
            let is_content = first.text().is_some() && first.tool_call_deltas().is_empty();
            let replay = Replay::new(Some(Ok(first)), stream);
            if is_content {
                Ok(DecodedStream::Content(replay))
            } else {
                Ok(DecodedStream::ToolCalls(replay))
            }
        }
    }
}
