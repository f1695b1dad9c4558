//! Live-reload script injection for HTML responses

use crate::pool::{full, BoxError, ProxyBody};
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use hyper::Response;

/// Script injected in front of the closing body tag of every HTML page
pub const RELOAD_SNIPPET: &str = concat!(
    "<script>",
    "new WebSocket((location.protocol === 'https:' ? 'wss://' : 'ws://') + location.host + '/internal/reload')",
    ".addEventListener('message', () => location.reload())",
    "</script>"
);

const BODY_CLOSE: &[u8] = b"</body>";

/// Whether a response carries HTML and should receive the snippet
pub fn is_html<B>(response: &Response<B>) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/html"))
        .unwrap_or(false)
}

/// Insert the snippet before the first `</body>`; unchanged if there is none.
pub fn inject_snippet(html: &[u8]) -> Vec<u8> {
    let Some(pos) = html.windows(BODY_CLOSE.len()).position(|w| w == BODY_CLOSE) else {
        return html.to_vec();
    };

    let mut out = Vec::with_capacity(html.len() + RELOAD_SNIPPET.len());
    out.extend_from_slice(&html[..pos]);
    out.extend_from_slice(RELOAD_SNIPPET.as_bytes());
    out.extend_from_slice(&html[pos..]);
    out
}

/// Rewrite a backend response for the client.
///
/// HTML bodies are buffered, injected and given a fresh Content-Length. Any
/// other body is passed through as a stream. On a read error nothing has been
/// written yet, so the caller can still answer with an error status.
pub async fn rewrite_response(response: Response<ProxyBody>) -> Result<Response<ProxyBody>, BoxError> {
    if !is_html(&response) {
        return Ok(response);
    }

    let (mut parts, body) = response.into_parts();
    let html: Bytes = body.collect().await?.to_bytes();
    let rewritten = inject_snippet(&html);

    parts.headers.remove(TRANSFER_ENCODING);
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));

    Ok(Response::from_parts(parts, full(rewritten)))
}
