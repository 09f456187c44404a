//! Split an HTTP body stream into text lines (SSE and NDJSON bodies).

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::error::{Error, Result};

/// Longest line accepted from a remote body.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Yields each non-empty line without its terminator. A transport failure is yielded once
/// and ends the stream.
pub fn lines<S, E>(body: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    lines_with_limit(body, MAX_LINE_BYTES)
}

/// [`lines`] with an explicit cap. A line longer than `max_line` ends the stream with a
/// transport error.
pub fn lines_with_limit<S, E>(body: S, max_line: usize) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    stream! {
        let mut buffer: Vec<u8> = Vec::new();
        // Bytes of `buffer` already known to hold no newline.
        let mut scanned = 0;
        let mut body = Box::pin(body);

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(offset) = buffer[scanned..].iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=scanned + offset).collect();
                        scanned = 0;
                        if line.len() > max_line + 2 {
                            yield Err(line_too_long(max_line));
                            return;
                        }
                        let text = String::from_utf8_lossy(&line).trim_end().to_string();
                        if !text.is_empty() {
                            yield Ok(text);
                        }
                    }
                    scanned = buffer.len();
                    if buffer.len() > max_line {
                        yield Err(line_too_long(max_line));
                        return;
                    }
                }
                Err(e) => {
                    yield Err(Error::Transport(format!("Stream interrupted: {}", e)));
                    return;
                }
            }
        }

        let rest = String::from_utf8_lossy(&buffer).trim_end().to_string();
        if !rest.is_empty() {
            yield Ok(rest);
        }
    }
}

fn line_too_long(max_line: usize) -> Error {
    Error::Transport(format!("Line exceeds {} bytes", max_line))
}

/// Payload of an SSE `data:` line. `None` for comments, other fields and blank data.
pub fn sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim_start();
    (!data.is_empty()).then_some(data)
}
