//! Server-Sent Events (SSE) processing for streaming chat completions.
//!
//! This module converts the raw byte stream of a chat completions response
//! into a stream of [`ChatCompletionChunk`] fragments.  Each event carries a
//! single `data:` line holding one JSON fragment; the literal `data: [DONE]`
//! ends the stream.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::observability::{STREAM_BYTES, STREAM_ERRORS, STREAM_EVENTS};
use crate::{ChatCompletionChunk, Error, Result};

const DONE_MARKER: &str = "[DONE]";

/// What one complete SSE event turned out to hold.
#[derive(Debug)]
enum Event {
    Chunk(Result<ChatCompletionChunk>),
    Done,
    Skip,
}

/// Process a stream of bytes into a stream of completion fragments.
///
/// Events split across network reads are reassembled.  Comment lines and
/// events without a `data:` field are skipped.  Nothing is yielded after the
/// `[DONE]` marker.
pub fn process_sse<S, E>(byte_stream: S) -> impl Stream<Item = Result<ChatCompletionChunk>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let stream = byte_stream.map(|result| {
        result
            .map_err(|e| Error::streaming(format!("Error in HTTP stream: {e}"), Some(Box::new(e))))
    });

    // Bytes that do not yet form valid UTF-8 wait in `pending` until the rest
    // of the code point arrives.
    let buffer = String::new();
    let pending: Vec<u8> = Vec::new();
    let done = false;

    stream::unfold(
        (stream, buffer, pending, done),
        move |(mut stream, mut buffer, mut pending, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some((event, remaining)) = extract_event(&buffer) {
                    buffer = remaining;
                    match event {
                        Event::Chunk(chunk) => {
                            if chunk.is_err() {
                                STREAM_ERRORS.click();
                            } else {
                                STREAM_EVENTS.click();
                            }
                            return Some((chunk, (stream, buffer, pending, false)));
                        }
                        Event::Done => return None,
                        Event::Skip => continue,
                    }
                }

                match stream.next().await {
                    Some(Ok(bytes)) => {
                        STREAM_BYTES.count(bytes.len() as u64);
                        pending.extend_from_slice(&bytes);
                        match std::str::from_utf8(&pending) {
                            Ok(text) => {
                                buffer.push_str(text);
                                pending.clear();
                            }
                            Err(e) if e.error_len().is_none() => {
                                // Incomplete trailing code point.
                                let valid = e.valid_up_to();
                                let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
                                buffer.push_str(&text);
                                pending.drain(..valid);
                            }
                            Err(e) => {
                                STREAM_ERRORS.click();
                                return Some((
                                    Err(Error::encoding(
                                        format!("Invalid UTF-8 in stream: {e}"),
                                        Some(Box::new(e)),
                                    )),
                                    (stream, buffer, pending, true),
                                ));
                            }
                        }
                    }
                    Some(Err(e)) => {
                        STREAM_ERRORS.click();
                        return Some((Err(e), (stream, buffer, pending, true)));
                    }
                    None => {
                        // End of stream; a final event may lack its blank line.
                        let tail = std::mem::take(&mut buffer);
                        if tail.trim().is_empty() {
                            return None;
                        }
                        let terminated = format!("{tail}\n\n");
                        return match extract_event(&terminated) {
                            Some((Event::Chunk(chunk), _)) => {
                                Some((chunk, (stream, buffer, pending, true)))
                            }
                            _ => None,
                        };
                    }
                }
            }
        },
    )
}

/// Extract a complete SSE event from a buffer string.
///
/// Events are delimited by a blank line.  `\r\n` line endings are accepted.
fn extract_event(buffer: &str) -> Option<(Event, String)> {
    let (event_text, rest) = split_event(buffer)?;

    let mut data: Option<String> = None;
    for line in event_text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        }
    }

    let event = match data.as_deref().map(str::trim) {
        Some(DONE_MARKER) => Event::Done,
        Some("") | None => Event::Skip,
        Some(json_str) => match serde_json::from_str::<ChatCompletionChunk>(json_str) {
            Ok(chunk) => Event::Chunk(Ok(chunk)),
            Err(e) => Event::Chunk(Err(Error::serialization(
                format!("Failed to parse event JSON: {e}"),
                Some(Box::new(e)),
            ))),
        },
    };
    Some((event, rest))
}

fn split_event(buffer: &str) -> Option<(&str, String)> {
    let lf = buffer.find("\n\n").map(|idx| (idx, 2));
    let crlf = buffer.find("\r\n\r\n").map(|idx| (idx, 4));
    let (idx, len) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&buffer[..idx], buffer[idx + len..].to_string()))
}
