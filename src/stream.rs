//! Pull-based decoder that turns an SSE-style response body into completion chunks.
//!
//! The decoder reads the body line by line. Only lines starting with `data: ` carry
//! payloads; `data: [DONE]` ends the stream and every other payload is handed to a
//! [`ChunkMapper`], which converts the provider's JSON into a [`CompletionChunk`].
//!
//! A decoder reaches exactly one terminal state (end of stream, cancellation, close,
//! or an error) and replays it on every later [`StreamDecoder::recv`] call.

use std::pin::Pin;

use futures_core::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::types::CompletionChunk;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// Stream of chunks produced by [`StreamDecoder::into_stream`].
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk, LLMError>> + Send>>;

/// Converts one raw `data:` payload into the normalized chunk shape.
///
/// Providers whose streaming format differs from [`CompletionChunk`] supply their own
/// mapper; the decoder itself never inspects provider-specific fields.
pub trait ChunkMapper: Send {
    /// Parses a payload. Failures should be reported as [`LLMError::Decode`].
    fn map_chunk(&mut self, payload: &str) -> Result<CompletionChunk, LLMError>;

    /// Interprets an `{"error": ...}` document sent inside the stream.
    ///
    /// Returns `None` when the text is not a recognizable error body.
    fn map_error(&self, _body: &str) -> Option<LLMError> {
        None
    }
}

/// Tunables for [`StreamDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Maximum number of consecutive non-`data:` lines tolerated between two chunks.
    pub empty_messages_limit: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            empty_messages_limit: 300,
        }
    }
}

/// Cloneable handle that closes a [`StreamDecoder`] from any task.
///
/// Closing wakes a `recv` blocked on the body; the decoder then drops the body and
/// settles in the [`LLMError::StreamClosed`] terminal state.
#[derive(Debug, Clone, Default)]
pub struct StreamCloser {
    token: CancellationToken,
}

impl StreamCloser {
    /// Idempotent.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
enum Terminal {
    EndOfStream,
    Failed(LLMError),
}

impl Terminal {
    fn replay(&self) -> Result<Option<CompletionChunk>, LLMError> {
        match self {
            Self::EndOfStream => Ok(None),
            Self::Failed(err) => Err(err.clone()),
        }
    }
}

/// Single-use, forward-only reader over one streaming response body.
///
/// # Examples
///
/// ```
/// # use futures_util::stream;
/// # use llmux::context::RequestContext;
/// # use llmux::error::LLMError;
/// # use llmux::http::HttpBodyStream;
/// # use llmux::stream::{ChunkMapper, StreamDecoder};
/// # use llmux::types::CompletionChunk;
/// struct Plain;
///
/// impl ChunkMapper for Plain {
///     fn map_chunk(&mut self, payload: &str) -> Result<CompletionChunk, LLMError> {
///         serde_json::from_str(payload).map_err(|err| LLMError::decode("doc", err.to_string()))
///     }
/// }
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let body: HttpBodyStream = Box::pin(stream::iter(vec![Ok(
///     b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n".to_vec(),
/// )]));
/// let mut decoder = StreamDecoder::new(RequestContext::background(), body, "doc", Box::new(Plain));
/// assert_eq!(decoder.recv().await.unwrap().unwrap().text(), "Hi");
/// assert!(decoder.recv().await.unwrap().is_none());
/// # });
/// ```
pub struct StreamDecoder {
    ctx: RequestContext,
    body: Option<HttpBodyStream>,
    buffer: Vec<u8>,
    eof: bool,
    mapper: Box<dyn ChunkMapper>,
    options: StreamOptions,
    provider: &'static str,
    closer: StreamCloser,
    terminal: Option<Terminal>,
}

impl StreamDecoder {
    /// Wraps a body that the caller has already checked for a 2xx status.
    pub fn new(
        ctx: RequestContext,
        body: HttpBodyStream,
        provider: &'static str,
        mapper: Box<dyn ChunkMapper>,
    ) -> Self {
        Self {
            ctx,
            body: Some(body),
            buffer: Vec::new(),
            eof: false,
            mapper,
            options: StreamOptions::default(),
            provider,
            closer: StreamCloser::default(),
            terminal: None,
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Returns a handle that can close this decoder from another task.
    pub fn closer(&self) -> StreamCloser {
        self.closer.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminal.is_some()
    }

    /// Returns the next chunk, `Ok(None)` at end of stream, or the terminal error.
    ///
    /// Once a terminal result has been returned, every later call returns it again.
    ///
    /// # Errors
    ///
    /// * [`LLMError::Cancelled`] when the context fires before or after a line read;
    /// * [`LLMError::Decode`] for malformed payloads or invalid UTF-8;
    /// * [`LLMError::StreamClosed`] after [`StreamDecoder::close`] or [`StreamCloser::close`];
    /// * transport errors from the body and errors the provider embedded in the stream.
    pub async fn recv(&mut self) -> Result<Option<CompletionChunk>, LLMError> {
        if let Some(terminal) = &self.terminal {
            return terminal.replay();
        }
        let result = self.next_chunk().await;
        match &result {
            Ok(Some(_)) => {}
            Ok(None) => self.finish(Terminal::EndOfStream),
            Err(err) => self.finish(Terminal::Failed(err.clone())),
        }
        result
    }

    /// Releases the body. Idempotent; a decoder closed before its natural end
    /// replays [`LLMError::StreamClosed`].
    pub fn close(&mut self) -> Result<(), LLMError> {
        self.closer.close();
        if self.terminal.is_none() {
            self.finish(Terminal::Failed(closed_error()));
        }
        Ok(())
    }

    /// Adapts the decoder into a `Stream` that yields at most one terminal error.
    pub fn into_stream(self) -> ChunkStream {
        Box::pin(futures_util::stream::unfold(
            Some(self),
            |state| async move {
                let mut decoder = state?;
                match decoder.recv().await {
                    Ok(Some(chunk)) => Some((Ok(chunk), Some(decoder))),
                    Ok(None) => None,
                    Err(err) => Some((Err(err), None)),
                }
            },
        ))
    }

    fn finish(&mut self, terminal: Terminal) {
        match &terminal {
            Terminal::EndOfStream => debug!(provider = self.provider, "stream finished"),
            Terminal::Failed(LLMError::Decode { message, .. }) => {
                warn!(provider = self.provider, %message, "stream payload could not be decoded")
            }
            Terminal::Failed(err) => debug!(provider = self.provider, error = %err, "stream terminated"),
        }
        self.body = None;
        self.buffer.clear();
        self.terminal = Some(terminal);
    }

    async fn next_chunk(&mut self) -> Result<Option<CompletionChunk>, LLMError> {
        let mut empty_messages = 0usize;
        let mut stray_lines = String::new();

        loop {
            self.ctx.check()?;
            let line = self.read_line().await;
            self.ctx.check()?;

            let Some(line) = line? else {
                if let Some(err) = self.mapper.map_error(&stray_lines) {
                    return Err(err);
                }
                return Ok(None);
            };
            let line = String::from_utf8(line).map_err(|err| {
                LLMError::decode(self.provider, format!("invalid UTF-8 in stream line: {err}"))
            })?;

            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                stray_lines.push_str(line.trim());
                empty_messages += 1;
                if empty_messages > self.options.empty_messages_limit {
                    return Err(LLMError::provider(
                        self.provider,
                        "too many empty stream messages",
                    ));
                }
                continue;
            };

            let payload = payload.trim_end();
            if payload == DONE_SENTINEL {
                return Ok(None);
            }
            if payload.trim_start().starts_with("{\"error\"") {
                if let Some(err) = self.mapper.map_error(payload) {
                    return Err(err);
                }
            }
            return self.mapper.map_chunk(payload).map(Some);
        }
    }

    /// Reads one line without its terminator, `Ok(None)` once the body is exhausted.
    async fn read_line(&mut self) -> Result<Option<Vec<u8>>, LLMError> {
        loop {
            if let Some(line) = take_line(&mut self.buffer) {
                return Ok(Some(line));
            }
            if self.eof {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let mut tail = std::mem::take(&mut self.buffer);
                if tail.last() == Some(&b'\r') {
                    tail.pop();
                }
                return Ok(Some(tail));
            }
            if self.closer.is_closed() {
                return Err(closed_error());
            }
            let Some(body) = self.body.as_mut() else {
                return Err(closed_error());
            };

            let next = tokio::select! {
                biased;
                reason = self.ctx.done() => return Err(LLMError::Cancelled(reason)),
                _ = self.closer.token.cancelled() => return Err(closed_error()),
                next = body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(err)) => return Err(err),
                None => self.eof = true,
            }
        }
    }
}

fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buffer.iter().position(|b| *b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(line)
}

fn closed_error() -> LLMError {
    LLMError::stream_closed("stream was closed by the caller")
}
