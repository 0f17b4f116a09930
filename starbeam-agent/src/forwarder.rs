//! Marshals ingress requests from the control channel into real HTTP/1.1
//! and RTSP/1.0 transactions against the local streaming host on loopback,
//! one connection per request.

use std::collections::BTreeMap;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use starbeam_proto::relay::{
    HttpRequestMessage, HttpResponseMessage, RtspRequestMessage, RtspResponseMessage,
};

/// RTSP control port offset from the streaming host's base port.
pub const RTSP_PORT_OFFSET: u16 = 21;

/// Forwards ingress requests to the local streaming host.
pub struct LoopbackForwarder {
    http_port: u16,
    https_port: u16,
    rtsp_port: u16,
}

impl LoopbackForwarder {
    /// Derive destination ports from the streaming host's base port.
    pub fn new(base_port: u16) -> Self {
        Self {
            http_port: base_port,
            https_port: base_port + 1,
            rtsp_port: base_port + RTSP_PORT_OFFSET,
        }
    }

    /// Explicit destination ports, for hosts with a custom port map.
    pub fn with_ports(http_port: u16, https_port: u16, rtsp_port: u16) -> Self {
        Self {
            http_port,
            https_port,
            rtsp_port,
        }
    }

    /// Issue the request against the local HTTP(S) listener. Transport and
    /// parse failures map to a plain 500 so the relay always gets an answer.
    pub async fn forward_http(&self, req: &HttpRequestMessage) -> HttpResponseMessage {
        let mut resp = HttpResponseMessage {
            id: req.id,
            status: 500,
            headers: BTreeMap::new(),
            body: None,
        };

        match self.http_transaction(req).await {
            Ok((status, content_type, body)) => {
                resp.status = status;
                if let Some(content_type) = content_type {
                    resp.headers
                        .insert("Content-Type".to_string(), content_type);
                }
                if !body.is_empty() {
                    resp.body = Some(body);
                }
                log::debug!("HTTP {} {} -> {}", req.method, req.path, status);
            }
            Err(err) => {
                log::error!("HTTP {} {} failed: {err:#}", req.method, req.path);
                resp.headers
                    .insert("Content-Type".to_string(), "text/plain".to_string());
                resp.body = Some("Internal Server Error".to_string());
            }
        }

        resp
    }

    /// Issue the request against the local RTSP listener. Failures map to a
    /// 500 with empty headers and body.
    pub async fn forward_rtsp(&self, req: &RtspRequestMessage) -> RtspResponseMessage {
        match self.rtsp_transaction(req).await {
            Ok((status, reason, headers, body)) => {
                log::debug!("RTSP {} {} -> {}", req.method, req.uri, status);
                RtspResponseMessage {
                    id: req.id,
                    status,
                    reason,
                    headers,
                    body: if body.is_empty() { None } else { Some(body) },
                }
            }
            Err(err) => {
                log::error!("RTSP {} {} failed: {err:#}", req.method, req.uri);
                RtspResponseMessage {
                    id: req.id,
                    status: 500,
                    reason: "Internal Server Error".to_string(),
                    headers: BTreeMap::new(),
                    body: None,
                }
            }
        }
    }

    async fn http_transaction(
        &self,
        req: &HttpRequestMessage,
    ) -> anyhow::Result<(u16, Option<String>, String)> {
        let port = if req.is_https {
            self.https_port
        } else {
            self.http_port
        };

        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .with_context(|| format!("connecting to local server at 127.0.0.1:{port}"))?;

        let full_path = match req.query.as_deref() {
            Some(query) if !query.is_empty() => format!("{}?{}", req.path, query),
            _ => req.path.clone(),
        };

        let mut head = format!("{} {} HTTP/1.1\r\n", req.method, full_path);
        head.push_str(&format!("Host: 127.0.0.1:{port}\r\n"));

        // Forward headers, minus the ones this hop owns.
        for (key, value) in &req.headers {
            let lower = key.to_ascii_lowercase();
            if matches!(lower.as_str(), "host" | "connection" | "transfer-encoding") {
                continue;
            }
            head.push_str(&format!("{key}: {value}\r\n"));
        }

        head.push_str(&format!("X-Forwarded-For: {}\r\n", req.client_addr));
        head.push_str(&format!("X-Starbeam-Client: {}\r\n", req.client_addr));

        let body = req.body.as_deref().unwrap_or("");
        if !body.is_empty() {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        head.push_str("Connection: close\r\n\r\n");

        stream.write_all(head.as_bytes()).await?;
        if !body.is_empty() {
            stream.write_all(body.as_bytes()).await?;
        }

        let mut reader = BufReader::new(stream);
        let (status, _reason) = read_status_line(&mut reader).await?;

        let mut content_type = None;
        let mut content_length = None;
        read_headers(&mut reader, |key, value| {
            match key.to_ascii_lowercase().as_str() {
                "content-type" => content_type = Some(value.to_string()),
                "content-length" => content_length = value.parse::<usize>().ok(),
                _ => {}
            }
        })
        .await?;

        let body = read_body(&mut reader, content_length).await;
        Ok((status, content_type, body))
    }

    async fn rtsp_transaction(
        &self,
        req: &RtspRequestMessage,
    ) -> anyhow::Result<(u16, String, BTreeMap<String, String>, String)> {
        let port = self.rtsp_port;
        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .with_context(|| format!("connecting to local RTSP server at 127.0.0.1:{port}"))?;

        let mut head = format!("{} {} RTSP/1.0\r\n", req.method, req.uri);
        for (key, value) in &req.headers {
            head.push_str(&format!("{key}: {value}\r\n"));
        }
        head.push_str(&format!("X-Starbeam-Client: {}\r\n", req.client_addr));

        let body = req.body.as_deref().unwrap_or("");
        if !body.is_empty() {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        head.push_str("\r\n");

        stream.write_all(head.as_bytes()).await?;
        if !body.is_empty() {
            stream.write_all(body.as_bytes()).await?;
        }

        let mut reader = BufReader::new(stream);
        let (status, reason) = read_status_line(&mut reader).await?;

        let mut headers = BTreeMap::new();
        let mut content_length = None;
        read_headers(&mut reader, |key, value| {
            if key.eq_ignore_ascii_case("content-length") {
                content_length = value.parse::<usize>().ok();
            }
            headers.insert(key.to_string(), value.to_string());
        })
        .await?;

        // RTSP replies carry a body only when Content-Length says so.
        let body = match content_length {
            Some(_) => read_body(&mut reader, content_length).await,
            None => String::new(),
        };

        Ok((status, reason, headers, body))
    }
}

async fn read_status_line(
    reader: &mut BufReader<TcpStream>,
) -> anyhow::Result<(u16, String)> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        anyhow::bail!("local server closed before sending a status line");
    }

    let mut parts = line.split_whitespace();
    let _version = parts.next().context("empty status line")?;
    let status: u16 = parts
        .next()
        .context("status line has no status code")?
        .parse()
        .context("invalid status code")?;
    let reason = parts.collect::<Vec<_>>().join(" ");

    Ok((status, reason))
}

async fn read_headers(
    reader: &mut BufReader<TcpStream>,
    mut each: impl FnMut(&str, &str),
) -> anyhow::Result<()> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            each(key, value.trim_start());
        }
    }
    Ok(())
}

/// Read exactly `content_length` bytes, or to EOF when the server didn't
/// declare a length. Short reads return what arrived.
async fn read_body(reader: &mut BufReader<TcpStream>, content_length: Option<usize>) -> String {
    let mut body = Vec::new();
    match content_length {
        Some(len) => {
            body.resize(len, 0);
            let mut read = 0;
            while read < len {
                match reader.read(&mut body[read..]).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => read += n,
                }
            }
            body.truncate(read);
        }
        None => {
            let _ = reader.read_to_end(&mut body).await;
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}
