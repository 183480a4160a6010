use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Future, Stream, StreamExt};
use vsm_core::ProviderError;

/// Default time without bytes before a stream is declared dead.
pub const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// One server-sent event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Parse a single blank-line-terminated SSE block. Comment-only and empty
/// blocks yield `None`.
pub fn parse_sse_block(block: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut has_data = false;
    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => frame.event = Some(value.to_string()),
            "data" => {
                if has_data {
                    frame.data.push('\n');
                }
                frame.data.push_str(value);
                has_data = true;
            }
            _ => {}
        }
    }
    (has_data || frame.event.is_some()).then_some(frame)
}

/// Incremental parser turning vendor frames into normalized events.
pub trait StreamParser {
    fn feed(&mut self, frame: &SseFrame) -> Vec<vsm_core::ProviderEvent>;

    /// Called once the transport closes. Flushes anything still open.
    fn finish(&mut self) -> Vec<vsm_core::ProviderEvent>;
}

/// Wraps a byte stream and yields SSE frames, with an idle timeout that
/// resets whenever bytes arrive.
pub struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, String>> + Send>>,
    buffer: Vec<u8>,
    pending: VecDeque<SseFrame>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    done: bool,
}

impl SseStream {
    pub fn new<S, E>(byte_stream: S) -> Self
    where
        S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
        E: Display,
    {
        Self::with_idle_timeout(byte_stream, SSE_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout<S, E>(byte_stream: S, idle_timeout: Duration) -> Self
    where
        S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
        E: Display,
    {
        Self {
            inner: Box::pin(byte_stream.map(|r| r.map_err(|e| e.to_string()))),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            done: false,
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(frame) = parse_sse_block(&String::from_utf8_lossy(&block)) {
                self.pending.push_back(frame);
            }
        }
    }

    fn flush_remaining(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let rest = std::mem::take(&mut self.buffer);
        if let Some(frame) = parse_sse_block(&String::from_utf8_lossy(&rest)) {
            self.pending.push_back(frame);
        }
    }
}

impl Stream for SseStream {
    type Item = Result<SseFrame, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(frame) = self.pending.pop_front() {
            return Poll::Ready(Some(Ok(frame)));
        }
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);
                    self.push_bytes(&bytes);
                    if let Some(frame) = self.pending.pop_front() {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(ProviderError::StreamInterrupted(e))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    self.flush_remaining();
                    return Poll::Ready(self.pending.pop_front().map(Ok));
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.done = true;
                        return Poll::Ready(Some(Err(ProviderError::StreamInterrupted(format!(
                            "idle timeout after {}s",
                            self.idle_duration.as_secs()
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
