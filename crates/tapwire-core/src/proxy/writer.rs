//! Single-shot raw HTTP/1.1 response writer handed to hooks and
//! management handlers.

use std::io::{self, Write};

use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;

/// Closure rendered through a [`ResponseWriter`]; what the request and
/// response hooks return to short-circuit a request.
pub type WriteFn = Box<dyn FnOnce(&mut ResponseWriter<'_>) -> io::Result<()> + Send>;

/// Threshold below which a body is framed with `Content-Length` instead of
/// chunked transfer encoding.
const INLINE_BODY_LIMIT: usize = 1024;

pub struct ResponseWriter<'a> {
    sink: &'a mut dyn Write,
    headers: HeaderMap,
    status: Option<StatusCode>,
    done: bool,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(sink: &'a mut dyn Write) -> Self {
        Self {
            sink,
            headers: HeaderMap::new(),
            status: None,
            done: false,
        }
    }

    pub fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Emit the full response: status line, headers, and `data` as the body.
    /// The writer is single-shot; a second call is an error.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.done {
            return Err(io::Error::other("response already written"));
        }
        self.done = true;

        let status = self.status.unwrap_or(StatusCode::OK);
        let reason = status.canonical_reason().unwrap_or("");
        write!(self.sink, "HTTP/1.1 {} {}\r\n", status.as_u16(), reason)?;

        if !data.is_empty() && !self.headers.contains_key(header::CONTENT_TYPE) {
            self.headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        }

        let chunked_preset = self
            .headers
            .get(header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
        if !self.headers.contains_key(header::CONTENT_LENGTH) && !chunked_preset {
            if data.len() < INLINE_BODY_LIMIT {
                let len = HeaderValue::from_str(&data.len().to_string())
                    .unwrap_or(HeaderValue::from_static("0"));
                self.headers.insert(header::CONTENT_LENGTH, len);
            } else {
                self.headers.insert(
                    header::TRANSFER_ENCODING,
                    HeaderValue::from_static("chunked"),
                );
            }
        }

        for (name, value) in self.headers.iter() {
            self.sink.write_all(name.as_str().as_bytes())?;
            self.sink.write_all(b": ")?;
            self.sink.write_all(value.as_bytes())?;
            self.sink.write_all(b"\r\n")?;
        }
        self.sink.write_all(b"\r\n")?;

        let chunked = chunked_preset
            || self
                .headers
                .get(header::TRANSFER_ENCODING)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            write!(self.sink, "{:x}\r\n", data.len())?;
            self.sink.write_all(data)?;
            self.sink.write_all(b"\r\n0\r\n\r\n")?;
        } else {
            self.sink.write_all(data)?;
        }
        Ok(data.len())
    }
}
