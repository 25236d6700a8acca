// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Minimal HTTP/1.1 request/response framing for the peer protocol (§6),
//! built on `httparse` for header parsing over a blocking `TcpStream`.
//!
//! §4.12 describes the reference protocol as non-blocking sockets driven by
//! a select loop; this crate instead uses one thread per connection over
//! `std::net::TcpStream`, matching the segment engine's general preference
//! for `std::thread` + `std::sync` over a hand-rolled reactor (see §5A).
//! `httparse` supplies only the request/status-line and header tokenizer;
//! everything else (query-string splitting, body framing, writing
//! responses) is this module's own small layer on top.

use crate::{Error, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;

/// Largest header block this server will buffer before giving up.
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// A parsed HTTP/1.1 request: method, path, query parameters, headers
/// (lower-cased keys) and a fully-read body.
#[derive(Debug, Clone)]
pub struct Request {
    /// `GET`, `PUT`, ...
    pub method: String,
    /// Path component only, with no leading `?query`.
    pub path: String,
    /// Parsed `?key=value&...` query parameters, for routes that use that
    /// convention.
    pub query: HashMap<String, String>,
    /// The raw text between `?` and the end of the request target, unparsed.
    ///
    /// §6's routes mostly pack positional, unnamed tokens into the query
    /// string (`/log?<diskHex>&<parentIdHex>`, `/stream?<diskHex>&<lsn>`)
    /// rather than `key=value` pairs, so [`Request::query`] (which treats a
    /// bare token as a key mapped to an empty value) cannot recover them in
    /// order. Route handlers that need positional tokens split this field
    /// themselves instead.
    pub raw_query: String,
    /// Header names, lower-cased.
    pub headers: HashMap<String, String>,
    /// Request body. Empty until filled in by [`read_body`]; routes that
    /// never expect a body (or that do not use `Expect: 100-continue`) can
    /// rely on [`read_request`] to have filled it in already.
    pub body: Vec<u8>,
}

impl Request {
    /// Splits [`Request::raw_query`] on `&`, for routes whose query string
    /// is a sequence of positional tokens rather than `key=value` pairs.
    #[must_use]
    pub fn query_tokens(&self) -> Vec<&str> {
        if self.raw_query.is_empty() {
            Vec::new()
        } else {
            self.raw_query.split('&').collect()
        }
    }

    /// `Content-Length`, or 0 if absent.
    #[must_use]
    pub fn content_length(&self) -> usize {
        self.header("content-length").and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// `true` iff the client sent `Expect: 100-continue`.
    #[must_use]
    pub fn expects_continue(&self) -> bool {
        self.header("expect").is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    }
}

impl Request {
    /// Looks up a header case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Looks up a query parameter.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => {
                out.insert(k.to_string(), v.to_string());
            }
            None => {
                out.insert(pair.to_string(), String::new());
            }
        }
    }
    out
}

fn split_target(target: &str) -> (String, HashMap<String, String>, String) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query), query.to_string()),
        None => (target.to_string(), HashMap::new(), String::new()),
    }
}

/// Reads and parses one request's header block off `stream`, growing the
/// read buffer until `httparse` reports a complete request line plus
/// headers. Returns the parsed [`Request`] (with an empty `body`) together
/// with whatever body bytes were already read past the header block in the
/// same chunked read.
///
/// Splitting header parsing from body reading lets a route validate the
/// request line, headers and (for routes that pack them into the query
/// string) identifying fields *before* committing to read a body — needed
/// for `Expect: 100-continue` (§4.12/§4.13), where the client will not send
/// the body until the server has written an interim `100 Continue`.
pub fn read_request_head(stream: &mut TcpStream) -> Result<(Request, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];

    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::ProtocolViolation("connection closed before headers completed"));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut header_storage = [httparse::EMPTY_HEADER; 32];
        let mut parsed = httparse::Request::new(&mut header_storage);
        let status = parsed
            .parse(&buf)
            .map_err(|_| Error::ProtocolViolation("malformed HTTP request"))?;

        match status {
            httparse::Status::Complete(consumed) => {
                let method = parsed.method.unwrap_or("").to_string();
                let target = parsed.path.unwrap_or("").to_string();
                let (path, query, raw_query) = split_target(&target);

                let mut headers = HashMap::new();
                for header in parsed.headers.iter() {
                    headers.insert(
                        header.name.to_ascii_lowercase(),
                        String::from_utf8_lossy(header.value).trim().to_string(),
                    );
                }

                let request = Request {
                    method,
                    path,
                    query,
                    raw_query,
                    headers,
                    body: Vec::new(),
                };
                return Ok((request, buf[consumed..].to_vec()));
            }
            httparse::Status::Partial => {
                if buf.len() > MAX_HEADER_BYTES {
                    return Err(Error::ProtocolViolation("request headers too large"));
                }
            }
        }
    }
}

/// Reads `content_length` body bytes, consuming `leftover` (bytes already
/// read past the header block by [`read_request_head`]) before reading
/// further off `stream`.
pub fn read_body(stream: &mut TcpStream, leftover: Vec<u8>, content_length: usize) -> Result<Vec<u8>> {
    let mut body = leftover;
    let mut chunk = [0u8; 512];

    while body.len() < content_length {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::ProtocolViolation("connection closed before body completed"));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok(body)
}

/// Reads a whole request, head and body together. For routes that never use
/// `Expect: 100-continue` and so have no reason to defer the body read.
pub fn read_request(stream: &mut TcpStream) -> Result<Request> {
    let (mut request, leftover) = read_request_head(stream)?;
    let content_length = request.content_length();
    request.body = read_body(stream, leftover, content_length)?;
    Ok(request)
}

/// Writes a status line, headers and body to `stream`.
pub fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    headers: &[(&str, String)],
    body: &[u8],
) -> Result<()> {
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    stream.write_all(out.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

/// Writes a status-line-only interim response (`100 Continue`), no headers
/// or body, per RFC 7231 §5.1.1.
pub fn write_continue(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
    stream.flush()?;
    Ok(())
}

/// Writes just a status line for an open-ended streaming response (`GET
/// /stream`), whose body is written incrementally and has no known length.
pub fn write_stream_header(stream: &mut TcpStream, status: u16, reason: &str) -> Result<()> {
    stream.write_all(format!("HTTP/1.1 {status} {reason}\r\nConnection: close\r\n\r\n").as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Client-side counterpart of [`read_request_head`]: reads a status line (and,
/// for a final response, its headers) off `stream`. Used by the quorum
/// client (§4.12), which only ever needs the status code.
///
/// Reads byte-at-a-time past the status line's headers so a subsequent
/// `100 Continue` interim response followed by a final response on the same
/// connection can each be parsed independently without over-consuming the
/// socket.
pub fn read_status_line(stream: &mut TcpStream) -> Result<u16> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    loop {
        let n = stream.read(&mut byte)?;
        if n == 0 {
            return Err(Error::ProtocolViolation("connection closed before status line completed"));
        }
        buf.push(byte[0]);

        let mut header_storage = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut header_storage);
        match response
            .parse(&buf)
            .map_err(|_| Error::ProtocolViolation("malformed HTTP response"))?
        {
            httparse::Status::Complete(_) => {
                return response.code.ok_or(Error::ProtocolViolation("response missing status code"));
            }
            httparse::Status::Partial => {
                if buf.len() > MAX_HEADER_BYTES {
                    return Err(Error::ProtocolViolation("response headers too large"));
                }
            }
        }
    }
}

/// Writes a request line plus headers (no body), for the quorum client's
/// state-1 `PUT /log` request.
pub fn write_request_head(
    stream: &mut TcpStream,
    method: &str,
    target: &str,
    headers: &[(&str, String)],
) -> Result<()> {
    let mut out = format!("{method} {target} HTTP/1.1\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    stream.write_all(out.as_bytes())?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_path_and_query() {
        let (path, query, raw) = split_target("/blocks?disk=abc&from=10");
        assert_eq!(path, "/blocks");
        assert_eq!(query.get("disk").map(String::as_str), Some("abc"));
        assert_eq!(query.get("from").map(String::as_str), Some("10"));
        assert_eq!(raw, "disk=abc&from=10");
    }

    #[test]
    fn query_tokens_splits_positional_query_string() {
        let request = Request {
            method: "PUT".to_string(),
            path: "/log".to_string(),
            query: HashMap::new(),
            raw_query: "abcd1234&ef567890".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        };
        assert_eq!(request.query_tokens(), vec!["abcd1234", "ef567890"]);
    }

    #[test]
    fn parses_query_without_value() {
        let query = parse_query("flag");
        assert_eq!(query.get("flag").map(String::as_str), Some(""));
    }
}
