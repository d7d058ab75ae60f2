use reqwest::header::{HeaderValue, ACCEPT, CACHE_CONTROL};

use crate::decoder::{decode_lines, lines_from_bytes, EventDecoder, IncompleteToolPolicy};
use crate::error::InferenceError;
use crate::events::EventStream;
use crate::inference::wire::parse_response;
use crate::types::CompletionResponse;

/// Headers every streaming request carries.
pub(crate) fn mark_streaming(request: &mut reqwest::Request) {
    let headers = request.headers_mut();
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
}

/// Send one request; any non-2xx status becomes [`InferenceError::Api`].
pub(crate) async fn send(
    client: &reqwest::Client,
    request: reqwest::Request,
) -> Result<reqwest::Response, InferenceError> {
    let resp = client
        .execute(request)
        .await
        .map_err(|e| InferenceError::Request(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), "upstream returned error");
        return Err(InferenceError::from_response_body(status.as_u16(), &body));
    }
    Ok(resp)
}

pub(crate) async fn read_completion(
    resp: reqwest::Response,
) -> Result<CompletionResponse, InferenceError> {
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| InferenceError::Request(e.to_string()))?;
    parse_response(&bytes)
}

/// Decode a streaming body, applying `policy` to tool calls cut off at the end.
pub(crate) fn event_stream(
    resp: reqwest::Response,
    policy: IncompleteToolPolicy,
) -> EventStream {
    decode_lines(
        lines_from_bytes(resp.bytes_stream()),
        EventDecoder::new().with_policy(policy),
    )
}
