//! HTML body injection: decompress, splice user markup before the last
//! `</body>`, and re-frame the response around the new bytes.

use std::io::Read;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http::header;

use crate::error::{Error, Result};
use crate::h1::Response;
use crate::proxy::hooks::HtmlProducer;

const BODY_CLOSE: &[u8] = b"</body>";

/// Mutate `resp` in place. Non-HTML responses pass through untouched;
/// HTML responses come out uncompressed with an accurate `Content-Length`
/// whether or not the closing tag was found.
pub fn inject_into_body(resp: &mut Response, producer: &HtmlProducer) -> Result<()> {
    let is_html = resp
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("text/html"));
    if !is_html {
        return Ok(());
    }

    resp.headers.remove(header::CONTENT_SECURITY_POLICY);

    let encoding = resp
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let mut body = match encoding.as_str() {
        "gzip" => gunzip(&resp.body)?,
        "deflate" => inflate(&resp.body)?,
        _ => resp.body.to_vec(),
    };
    resp.headers.remove(header::CONTENT_ENCODING);

    if let Some(pos) = find_last(&body, BODY_CLOSE) {
        let snippet = producer(resp);
        let mut spliced = Vec::with_capacity(body.len() + snippet.len());
        spliced.extend_from_slice(&body[..pos]);
        spliced.extend_from_slice(snippet.as_bytes());
        spliced.extend_from_slice(&body[pos..]);
        body = spliced;
    }
    resp.set_body(Bytes::from(body));
    Ok(())
}

fn find_last(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4);
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::Parse(format!("gzip body decode failed: {e}")))?;
    Ok(out)
}

/// User agents send both zlib-wrapped and raw deflate under the `deflate`
/// token; try the zlib container first.
fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4);
    if ZlibDecoder::new(data).read_to_end(&mut out).is_ok() {
        return Ok(out);
    }
    out.clear();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::Parse(format!("deflate body decode failed: {e}")))?;
    Ok(out)
}
