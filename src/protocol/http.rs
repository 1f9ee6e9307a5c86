//! HTTP proxy handshakes
//!
//! Server side handles `CONNECT host:port` and absolute-form plain requests
//! (`GET http://host/path`); client side issues `CONNECT`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use super::Credentials;
use crate::common::{Address, IntoStream, PrefixedStream, Stream};
use crate::error::{Error, Result};

/// Upper bound on request line plus headers
const MAX_HEADER_BYTES: usize = 64 * 1024;

struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

async fn read_line_limited(
    reader: &mut BufReader<Stream>,
    line: &mut String,
    consumed: &mut usize,
) -> Result<()> {
    line.clear();
    let remaining = MAX_HEADER_BYTES.saturating_sub(*consumed);
    let n = (&mut *reader).take(remaining as u64).read_line(line).await?;
    *consumed += n;
    if !line.ends_with('\n') {
        if n == remaining {
            return Err(Error::Protocol("HTTP header too large".into()));
        }
        return Err(Error::Closed);
    }
    Ok(())
}

async fn read_request_head(reader: &mut BufReader<Stream>) -> Result<RequestHead> {
    let mut consumed = 0;
    let mut line = String::new();
    read_line_limited(reader, &mut line, &mut consumed).await?;

    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::Protocol("Invalid HTTP request line".into()));
    }
    let (method, target, version) = (parts[0].to_string(), parts[1].to_string(), parts[2].to_string());

    let mut headers = Vec::new();
    loop {
        read_line_limited(reader, &mut line, &mut consumed).await?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

fn basic_auth(creds: &Credentials) -> String {
    format!(
        "Basic {}",
        BASE64.encode(format!("{}:{}", creds.username, creds.password))
    )
}

/// Parse `host:port`, falling back to `default_port` when none is given
pub(crate) fn parse_host_port(s: &str, default_port: u16) -> Result<Address> {
    if let Ok(addr) = s.parse() {
        return Ok(Address::Socket(addr));
    }

    let (host, port) = match s.rsplit_once(':') {
        Some((h, p)) if !h.ends_with(':') && !p.contains(']') => {
            let port: u16 = p
                .parse()
                .map_err(|_| Error::Protocol(format!("Invalid port: {}", p)))?;
            (h, port)
        }
        _ => (s, default_port),
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::Protocol(format!("Invalid target: {}", s)));
    }
    match host.parse() {
        Ok(ip) => Ok(Address::Socket(std::net::SocketAddr::new(ip, port))),
        Err(_) => Ok(Address::Domain(host.to_string(), port)),
    }
}

/// Server side. Returns the destination and a stream positioned at the first
/// payload byte; for plain requests the rewritten request head is replayed
/// in front of the payload.
pub async fn server_handshake(stream: Stream, users: &[Credentials]) -> Result<(Address, Stream)> {
    let mut reader = BufReader::new(stream);
    let head = read_request_head(&mut reader).await?;

    if !users.is_empty() {
        let provided = head
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("proxy-authorization"))
            .map(|(_, v)| v.as_str());
        let ok = provided.is_some_and(|p| users.iter().any(|u| basic_auth(u) == p));
        if !ok {
            let mut stream = reader.into_inner();
            stream
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"Proxy\"\r\n\
                      \r\n",
                )
                .await?;
            return Err(Error::Protocol("Authentication required".into()));
        }
    }

    if head.method.eq_ignore_ascii_case("CONNECT") {
        let address = parse_host_port(&head.target, 443)?;
        let leftover = reader.buffer().to_vec();
        let mut stream = reader.into_inner();
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        stream.flush().await?;
        return Ok((address, PrefixedStream::new(leftover, stream).into_stream()));
    }

    let url = head
        .target
        .strip_prefix("http://")
        .ok_or_else(|| Error::Protocol(format!("Invalid target: {}", head.target)))?;
    let (authority, path) = match url.find('/') {
        Some(i) => (&url[..i], &url[i..]),
        None => (url, "/"),
    };
    let address = parse_host_port(authority, 80)?;

    let mut request = format!("{} {} {}\r\n", head.method, path, head.version);
    for (key, value) in &head.headers {
        if key.to_ascii_lowercase().starts_with("proxy-") {
            continue;
        }
        request.push_str(&format!("{}: {}\r\n", key, value));
    }
    request.push_str("\r\n");

    let mut prefix = request.into_bytes();
    prefix.extend_from_slice(reader.buffer());
    let stream = reader.into_inner();
    Ok((address, PrefixedStream::new(prefix, stream).into_stream()))
}

/// Client side: `CONNECT` to `destination` through an HTTP proxy
pub async fn client_handshake(
    mut stream: Stream,
    destination: &Address,
    credentials: Option<&Credentials>,
) -> Result<Stream> {
    let target = destination.to_string();
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(creds) = credentials {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", basic_auth(creds)));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut consumed = 0;
    let mut line = String::new();
    read_line_limited(&mut reader, &mut line, &mut consumed).await?;

    let status_code: u16 = line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::Protocol("Invalid HTTP response".into()))?;
    if status_code != 200 {
        return Err(Error::Protocol(format!("HTTP CONNECT failed: {}", line.trim())));
    }

    loop {
        read_line_limited(&mut reader, &mut line, &mut consumed).await?;
        if line.trim().is_empty() {
            break;
        }
    }

    let leftover = reader.buffer().to_vec();
    Ok(PrefixedStream::new(leftover, reader.into_inner()).into_stream())
}
