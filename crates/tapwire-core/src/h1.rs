//! HTTP/1.1 message model: parsing off buffered readers, wire emission,
//! and the header predicates the proxy dispatches on.

use std::io;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

/// A parsed downstream request plus the fields hooks are allowed to rewrite.
/// `scheme` is `None` for origin-form targets (requests arriving over an
/// interposed TLS session); `host` carries the `Host[:port]` authority.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub scheme: Option<String>,
    pub host: String,
    pub path: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    /// URL rendering used by the forwarded-request log line.
    pub fn url_display(&self) -> String {
        match &self.scheme {
            Some(scheme) => format!("{}://{}{}", scheme, self.host, self.path),
            None => format!("{}{}", self.host, self.path),
        }
    }
}

/// How the response body was framed on the wire; re-emission preserves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    None,
    ContentLength(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub framing: Framing,
    pub content_length: Option<u64>,
}

impl Response {
    /// Replace the body, keeping the `Content-Length` header, the
    /// content-length field, and the framing in sync with the new bytes.
    pub fn set_body(&mut self, body: Bytes) {
        let len = body.len() as u64;
        self.headers.remove(header::TRANSFER_ENCODING);
        self.headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&len.to_string()).unwrap_or(HeaderValue::from_static("0")),
        );
        self.content_length = Some(len);
        self.framing = Framing::ContentLength(len);
        self.body = body;
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Accumulate bytes off the reader until the blank line ending the head.
/// Only the head bytes are consumed; the body stays in the reader.
async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut head: Vec<u8> = Vec::with_capacity(512);
    loop {
        let (found, take) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                if head.is_empty() {
                    return Err(Error::Network(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    )));
                }
                return Err(Error::Parse("eof inside message head".into()));
            }
            // re-scan a 3-byte overlap so a terminator split across reads is seen
            let prev = head.len();
            let start = prev.saturating_sub(3);
            head.extend_from_slice(buf);
            match find_subsequence(&head[start..], b"\r\n\r\n") {
                Some(pos) => {
                    let end = start + pos + 4;
                    let take = end - prev;
                    head.truncate(end);
                    (true, take)
                }
                None => (false, buf.len()),
            }
        };
        reader.consume(take);
        if found {
            return Ok(head);
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(Error::Parse("message head too large".into()));
        }
    }
}

fn header_map_from(raw: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| Error::Parse(format!("bad header name: {e}")))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| Error::Parse(format!("bad header value: {e}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn version_from(minor: u8) -> Version {
    if minor == 0 {
        Version::HTTP_10
    } else {
        Version::HTTP_11
    }
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

fn content_length_of(headers: &HeaderMap) -> Result<Option<u64>> {
    match headers.get(header::CONTENT_LENGTH) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| Error::Parse("invalid content-length".into())),
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    header_has_token(headers, header::TRANSFER_ENCODING, "chunked")
}

/// Case-insensitive "header value contains token" test.
pub fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains(token))
}

async fn read_chunked<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        reader.read_line(&mut line).await?;
        let size_str = line.trim_end().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| Error::Parse(format!("bad chunk size {size_str:?}")))?;
        if size == 0 {
            // trailer section: lines until the terminating blank line
            loop {
                line.clear();
                reader.read_line(&mut line).await?;
                if line == "\r\n" || line == "\n" || line.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(Error::Parse("chunk not terminated by crlf".into()));
        }
    }
}

async fn read_body<R: AsyncBufRead + Unpin>(reader: &mut R, framing: Framing) -> Result<Bytes> {
    match framing {
        Framing::None => Ok(Bytes::new()),
        Framing::ContentLength(0) => Ok(Bytes::new()),
        Framing::ContentLength(n) => {
            let mut buf = vec![0u8; n as usize];
            reader.read_exact(&mut buf).await?;
            Ok(Bytes::from(buf))
        }
        Framing::Chunked => Ok(Bytes::from(read_chunked(reader).await?)),
        Framing::UntilClose => {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            Ok(Bytes::from(buf))
        }
    }
}

/// Parse one request (head and body) off the buffered reader.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Request> {
    let head = read_head(reader).await?;

    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut storage);
    let status = parsed
        .parse(&head)
        .map_err(|e| Error::Parse(e.to_string()))?;
    if status.is_partial() {
        return Err(Error::Parse("truncated request head".into()));
    }

    let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
        .map_err(|e| Error::Parse(format!("bad method: {e}")))?;
    let target = parsed.path.unwrap_or("");
    let version = version_from(parsed.version.unwrap_or(1));
    let headers = header_map_from(parsed.headers)?;

    let host_header = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let (scheme, host, path) = if method == Method::CONNECT {
        // authority-form: the target names the tunnel destination
        (None, target.to_string(), String::new())
    } else if target.starts_with('/') || target == "*" {
        (None, host_header, target.to_string())
    } else {
        let uri: Uri = target
            .parse()
            .map_err(|e| Error::Parse(format!("bad request target {target:?}: {e}")))?;
        let scheme = uri.scheme_str().map(|s| s.to_string());
        let host = uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or(host_header);
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        (scheme, host, path)
    };

    let framing = if is_chunked(&headers) {
        Framing::Chunked
    } else {
        match content_length_of(&headers)? {
            Some(n) => Framing::ContentLength(n),
            None => Framing::None,
        }
    };
    let body = read_body(reader, framing).await?;

    Ok(Request {
        method,
        scheme,
        host,
        path,
        version,
        headers,
        body,
    })
}

/// Parse one response off the buffered reader, bound to the request method
/// for HEAD/1xx/CONNECT body rules.
pub async fn read_response<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    req_method: &Method,
) -> Result<Response> {
    let head = read_head(reader).await?;

    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut storage);
    let status = parsed
        .parse(&head)
        .map_err(|e| Error::Parse(e.to_string()))?;
    if status.is_partial() {
        return Err(Error::Parse("truncated response head".into()));
    }

    let code = parsed.code.unwrap_or(0);
    let status = StatusCode::from_u16(code)
        .map_err(|_| Error::Parse(format!("bad status code {code}")))?;
    let reason = parsed
        .reason
        .map(|r| r.to_string())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
    let version = version_from(parsed.version.unwrap_or(1));
    let headers = header_map_from(parsed.headers)?;

    let content_length = content_length_of(&headers)?;
    let bodyless = *req_method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || (*req_method == Method::CONNECT && status.is_success());

    let framing = if bodyless {
        Framing::None
    } else if is_chunked(&headers) {
        Framing::Chunked
    } else {
        match content_length {
            Some(n) => Framing::ContentLength(n),
            None => Framing::UntilClose,
        }
    };
    let body = read_body(reader, framing).await?;

    Ok(Response {
        status,
        reason,
        version,
        headers,
        body,
        framing,
        content_length,
    })
}

/// Serialize a request for the upstream side: origin-form request line,
/// `Host` first, then the remaining headers and the body in its original
/// framing (chunked bodies are re-emitted as a single chunk). The parsed
/// `Content-Length` is never forwarded verbatim: hooks may have swapped the
/// body out, so the header is rewritten against the buffered bytes.
pub fn encode_request(req: &Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + req.body.len());
    let path = if req.path.is_empty() { "/" } else { &req.path };
    out.extend_from_slice(
        format!("{} {} {}\r\n", req.method, path, version_str(req.version)).as_bytes(),
    );
    out.extend_from_slice(format!("Host: {}\r\n", req.host).as_bytes());

    let chunked = is_chunked(&req.headers);
    let had_content_length = req.headers.contains_key(header::CONTENT_LENGTH);
    for (name, value) in req.headers.iter() {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !chunked && (!req.body.is_empty() || had_content_length) {
        out.extend_from_slice(format!("Content-Length: {}\r\n", req.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");

    if chunked {
        if !req.body.is_empty() {
            out.extend_from_slice(format!("{:x}\r\n", req.body.len()).as_bytes());
            out.extend_from_slice(&req.body);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
    } else {
        out.extend_from_slice(&req.body);
    }
    out
}

/// Serialize a response toward the client, preserving its wire framing.
pub fn encode_response(resp: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + resp.body.len());
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            version_str(resp.version),
            resp.status.as_u16(),
            resp.reason
        )
        .as_bytes(),
    );
    for (name, value) in resp.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");

    match resp.framing {
        Framing::None => {}
        Framing::Chunked => {
            if !resp.body.is_empty() {
                out.extend_from_slice(format!("{:x}\r\n", resp.body.len()).as_bytes());
                out.extend_from_slice(&resp.body);
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"0\r\n\r\n");
        }
        Framing::ContentLength(_) | Framing::UntilClose => {
            out.extend_from_slice(&resp.body);
        }
    }
    out
}

/// All four upgrade signals must be present for the splice path.
pub fn is_websocket_upgrade(req: &Request) -> bool {
    header_has_token(&req.headers, header::CONNECTION, "upgrade")
        && req
            .headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
        && req.headers.contains_key(header::SEC_WEBSOCKET_KEY)
        && req.headers.contains_key(header::SEC_WEBSOCKET_VERSION)
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals.
pub fn split_host_port(host: &str) -> (&str, Option<&str>) {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((h, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').filter(|p| !p.is_empty());
            return (h, port);
        }
        return (host, None);
    }
    match host.rsplit_once(':') {
        Some((h, p)) if !h.contains(':') && p.bytes().all(|b| b.is_ascii_digit()) => {
            (h, Some(p))
        }
        _ => (host, None),
    }
}

/// Hostname without the port.
pub fn hostname_of(host: &str) -> &str {
    split_host_port(host).0
}

/// Append the scheme-default port when the authority carries none.
pub fn with_default_port(host: &str, is_tls: bool) -> String {
    match split_host_port(host).1 {
        Some(_) => host.to_string(),
        None => {
            if is_tls {
                format!("{host}:443")
            } else {
                format!("{host}:80")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    async fn parse_request(raw: &[u8]) -> Result<Request> {
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        read_request(&mut reader).await
    }

    async fn parse_response(raw: &[u8], method: Method) -> Result<Response> {
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        read_response(&mut reader, &method).await
    }

    #[tokio::test]
    async fn absolute_form_request() {
        let req = parse_request(
            b"GET http://origin.test/path?x=1 HTTP/1.1\r\nHost: origin.test\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.scheme.as_deref(), Some("http"));
        assert_eq!(req.host, "origin.test");
        assert_eq!(req.path, "/path?x=1");
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn origin_form_request_uses_host_header() {
        let req = parse_request(b"GET /a HTTP/1.1\r\nHost: sec.test:8443\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.scheme, None);
        assert_eq!(req.host, "sec.test:8443");
        assert_eq!(req.path, "/a");
    }

    #[tokio::test]
    async fn connect_request_is_authority_form() {
        let req = parse_request(b"CONNECT origin.test:443 HTTP/1.1\r\nHost: origin.test:443\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.method, Method::CONNECT);
        assert_eq!(req.host, "origin.test:443");
    }

    #[tokio::test]
    async fn request_body_by_content_length() {
        let req = parse_request(
            b"POST /p HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await
        .unwrap();
        assert_eq!(&req.body[..], b"hello");
    }

    #[tokio::test]
    async fn chunked_response_round_trip() {
        let resp = parse_response(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
            Method::GET,
        )
        .await
        .unwrap();
        assert_eq!(resp.framing, Framing::Chunked);
        assert_eq!(&resp.body[..], b"wikipedia");
        let encoded = encode_response(&resp);
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.ends_with("9\r\nwikipedia\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let resp = parse_response(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n",
            Method::HEAD,
        )
        .await
        .unwrap();
        assert_eq!(resp.framing, Framing::None);
        assert!(resp.body.is_empty());
        assert_eq!(resp.content_length, Some(1234));
    }

    #[tokio::test]
    async fn response_until_close() {
        let resp = parse_response(b"HTTP/1.1 200 OK\r\n\r\npartial", Method::GET)
            .await
            .unwrap();
        assert_eq!(resp.framing, Framing::UntilClose);
        assert_eq!(&resp.body[..], b"partial");
    }

    #[tokio::test]
    async fn pipelined_heads_leave_next_request_in_reader() {
        let raw = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        let first = read_request(&mut reader).await.unwrap();
        let second = read_request(&mut reader).await.unwrap();
        assert_eq!(first.path, "/a");
        assert_eq!(second.path, "/b");
    }

    #[test]
    fn encode_request_is_origin_form() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("ignored"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        let req = Request {
            method: Method::GET,
            scheme: Some("http".into()),
            host: "origin.test".into(),
            path: "/path".into(),
            version: Version::HTTP_11,
            headers,
            body: Bytes::new(),
        };
        let text = String::from_utf8(encode_request(&req)).unwrap();
        assert!(text.starts_with("GET /path HTTP/1.1\r\nHost: origin.test\r\n"));
        assert_eq!(text.matches("Host:").count(), 1);
    }

    #[test]
    fn encode_request_sets_content_length_for_buffered_body() {
        let req = Request {
            method: Method::POST,
            scheme: None,
            host: "h".into(),
            path: "/".into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"abc"),
        };
        let text = String::from_utf8(encode_request(&req)).unwrap();
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn encode_request_resyncs_content_length_for_emptied_body() {
        // a hook truncated the body after parsing; the client's header is stale
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("5"));
        let req = Request {
            method: Method::POST,
            scheme: None,
            host: "h".into(),
            path: "/".into(),
            version: Version::HTTP_11,
            headers,
            body: Bytes::new(),
        };
        let text = String::from_utf8(encode_request(&req)).unwrap();
        assert!(text.contains("Content-Length: 0\r\n"));
        assert_eq!(text.to_ascii_lowercase().matches("content-length").count(), 1);
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn encode_request_drops_content_length_alongside_chunked() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        let req = Request {
            method: Method::POST,
            scheme: None,
            host: "h".into(),
            path: "/".into(),
            version: Version::HTTP_11,
            headers,
            body: Bytes::from_static(b"abc"),
        };
        let text = String::from_utf8(encode_request(&req)).unwrap();
        assert!(!text.to_ascii_lowercase().contains("content-length"));
        assert!(text.ends_with("\r\n\r\n3\r\nabc\r\n0\r\n\r\n"));
    }

    #[test]
    fn websocket_needs_all_four_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        headers.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("k"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        let mut req = Request {
            method: Method::GET,
            scheme: None,
            host: "h".into(),
            path: "/ws".into(),
            version: Version::HTTP_11,
            headers,
            body: Bytes::new(),
        };
        assert!(is_websocket_upgrade(&req));
        req.headers.remove(header::SEC_WEBSOCKET_VERSION);
        assert!(!is_websocket_upgrade(&req));
    }

    #[test]
    fn host_port_helpers() {
        assert_eq!(split_host_port("a.test:8080"), ("a.test", Some("8080")));
        assert_eq!(split_host_port("a.test"), ("a.test", None));
        assert_eq!(split_host_port("[::1]:443"), ("::1", Some("443")));
        assert_eq!(with_default_port("a.test", true), "a.test:443");
        assert_eq!(with_default_port("a.test", false), "a.test:80");
        assert_eq!(with_default_port("a.test:8443", true), "a.test:8443");
    }

    #[test]
    fn set_body_resyncs_length_and_framing() {
        let mut resp = Response {
            status: StatusCode::OK,
            reason: "OK".into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            framing: Framing::Chunked,
            content_length: None,
        };
        resp.headers
            .insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        resp.set_body(Bytes::from_static(b"hello"));
        assert_eq!(resp.framing, Framing::ContentLength(5));
        assert_eq!(resp.content_length, Some(5));
        assert_eq!(resp.headers.get(header::CONTENT_LENGTH).unwrap(), "5");
        assert!(resp.headers.get(header::TRANSFER_ENCODING).is_none());
    }
}
