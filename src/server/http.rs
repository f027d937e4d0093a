//! Minimal HTTP/1.1 framing over a TCP stream, just enough to carry
//! JSON-RPC request bodies in POSTs and JSON responses back.

use anyhow::{anyhow, bail, Context};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;

/// A single parsed HTTP request.
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
    pub keep_alive: bool,
}

pub struct HttpIo {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl HttpIo {
    pub fn new(stream: TcpStream) -> anyhow::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    /// Read one request. `Ok(None)` means the peer closed the connection.
    pub fn read_request(&mut self) -> anyhow::Result<Option<HttpRequest>> {
        let mut request_line = String::new();
        if self.reader.read_line(&mut request_line)? == 0 {
            return Ok(None);
        }
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| anyhow!("malformed request line"))?
            .to_string();
        let path = parts
            .next()
            .ok_or_else(|| anyhow!("malformed request line"))?
            .to_string();

        let mut content_length: usize = 0;
        let mut keep_alive = true;
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                bail!("connection closed inside headers");
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().context("parse Content-Length")?;
            } else if name.eq_ignore_ascii_case("connection") {
                keep_alive = !value.eq_ignore_ascii_case("close");
            }
        }

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body)?;

        Ok(Some(HttpRequest {
            method,
            path,
            body,
            keep_alive,
        }))
    }

    pub fn write_json(&mut self, status: u16, body: &[u8]) -> anyhow::Result<()> {
        let reason = match status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            _ => "Internal Server Error",
        };
        write!(
            self.stream,
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )?;
        self.stream.write_all(body)?;
        self.stream.flush()?;
        Ok(())
    }
}
