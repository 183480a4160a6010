use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, warn};
use vsm_core::{EventSink, ProviderError};

use crate::sse::{SseStream, StreamParser};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Send the request and classify non-2xx statuses.
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::Network(e.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status.as_u16(), body))
}

/// Feed every SSE frame through `parser`, then flush it on close.
pub(crate) async fn drive_sse<P: StreamParser>(
    response: reqwest::Response,
    parser: &mut P,
    sink: &mut EventSink<'_>,
    idle_timeout: Duration,
) -> Result<(), ProviderError> {
    let mut frames = SseStream::with_idle_timeout(response.bytes_stream(), idle_timeout);
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        for event in parser.feed(&frame) {
            sink.emit(event);
        }
        if sink.is_terminated() {
            debug!("terminal event received, closing stream");
            return Ok(());
        }
    }
    for event in parser.finish() {
        sink.emit(event);
    }
    Ok(())
}

/// Convert an adapter failure into the turn's terminal diagnostic.
pub(crate) fn conclude(
    provider: &str,
    outcome: Result<(), ProviderError>,
    sink: &mut EventSink<'_>,
) {
    if let Err(e) = outcome {
        warn!(provider, kind = e.error_kind(), error = %e, "provider call failed");
        sink.final_text(e.diagnostic());
    }
    sink.finish();
}
