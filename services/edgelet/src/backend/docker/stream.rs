//! Decoding of streamed engine responses.

use futures_core::Stream;
use hyper::body::HttpBody;
use hyper::Body;
use serde::de::DeserializeOwned;

use super::models::Event;
use crate::backend::{BackendError, EngineEvent, EventStream, LogStream};

struct LineReader {
    body: Body,
    buffer: Vec<u8>,
    done: bool,
}

impl LineReader {
    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
        line.pop();
        Some(line)
    }
}

/// Newline-delimited JSON values. A trailing value without newline is still
/// decoded when the body ends.
pub fn json_lines<T>(body: Body) -> impl Stream<Item = Result<T, BackendError>> + Send
where
    T: DeserializeOwned + Send + 'static,
{
    let reader = LineReader {
        body,
        buffer: Vec::new(),
        done: false,
    };

    futures_util::stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(line) = reader.next_line() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let item = serde_json::from_slice(&line).map_err(BackendError::from);
                return Some((item, reader));
            }
            if reader.done {
                return None;
            }
            match reader.body.data().await {
                Some(Ok(chunk)) => reader.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    reader.done = true;
                    reader.buffer.clear();
                    return Some((Err(BackendError::from(e)), reader));
                }
                None => {
                    reader.done = true;
                    if !reader.buffer.is_empty() {
                        reader.buffer.push(b'\n');
                    }
                }
            }
        }
    })
}

/// The `/events` stream.
pub fn events(body: Body) -> EventStream {
    use futures_util::StreamExt;

    Box::pin(json_lines::<Event>(body).map(|item| item.map(EngineEvent::from)))
}

/// Raw body chunks.
pub fn bytes(body: Body) -> LogStream {
    Box::pin(futures_util::stream::unfold(Some(body), |body| async move {
        let mut body = body?;
        match body.data().await {
            Some(Ok(chunk)) => Some((Ok(chunk), Some(body))),
            Some(Err(e)) => Some((Err(BackendError::from(e)), None)),
            None => None,
        }
    }))
}
