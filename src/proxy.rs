//! Egress proxy: a forward HTTP/1.1 proxy that authorizes every request
//! against the session token carried in `Proxy-Authorization` and the host
//! allowlist embedded in it.
//!
//! HTTPS is tunneled via CONNECT after authorization; TLS is never
//! terminated here. Plain HTTP uses absolute-URI request lines. Nothing is
//! cached, rewritten, or inspected beyond the request head.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::token::{SessionClaims, TokenService};

/// Request heads larger than this are rejected outright.
const MAX_HEAD_BYTES: usize = 16 * 1024;

pub async fn run_server(addr: &str, tokens: Arc<TokenService>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("egress proxy listening on {addr}");

    loop {
        let (stream, peer) = listener.accept().await?;
        let tokens = tokens.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, tokens).await {
                warn!(%peer, "proxy connection error: {e}");
            }
        });
    }
}

async fn handle_connection(
    mut client: TcpStream,
    tokens: Arc<TokenService>,
) -> anyhow::Result<()> {
    let (head, body_start) = match read_head(&mut client).await {
        Ok(parts) => parts,
        Err(_) => {
            respond(&mut client, "400 Bad Request").await;
            return Ok(());
        }
    };
    let Some(req) = RequestHead::parse(&head) else {
        respond(&mut client, "400 Bad Request").await;
        return Ok(());
    };

    if req.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(client, req, &tokens).await
    } else {
        handle_http(client, req, body_start, &tokens).await
    }
}

async fn handle_connect(
    mut client: TcpStream,
    req: RequestHead,
    tokens: &TokenService,
) -> anyhow::Result<()> {
    let (host, port) = split_host_port(&req.target, 443);

    let claims = match authorize(&req, &host, tokens) {
        Ok(claims) => claims,
        Err(reason) => {
            warn!(host, %reason, "CONNECT denied");
            respond(&mut client, "403 Forbidden").await;
            return Ok(());
        }
    };
    info!(session = %claims.sub, host, port, "CONNECT tunnel opened");

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(host, port, "CONNECT upstream failed: {e}");
            respond(&mut client, "502 Bad Gateway").await;
            return Ok(());
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    // Raw splice until either side hangs up; no TLS termination.
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

async fn handle_http(
    mut client: TcpStream,
    req: RequestHead,
    body_start: Vec<u8>,
    tokens: &TokenService,
) -> anyhow::Result<()> {
    let Some((host, port, origin_form)) = parse_absolute_uri(&req.target) else {
        respond(&mut client, "400 Bad Request").await;
        return Ok(());
    };

    let claims = match authorize(&req, &host, tokens) {
        Ok(claims) => claims,
        Err(reason) => {
            warn!(host, %reason, "request denied");
            respond(&mut client, "407 Proxy Authentication Required").await;
            return Ok(());
        }
    };
    info!(session = %claims.sub, method = %req.method, host, "proxying request");

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(host, port, "upstream connect failed: {e}");
            respond(&mut client, "502 Bad Gateway").await;
            return Ok(());
        }
    };

    let forwarded = req.forward_head(&origin_form);
    upstream.write_all(forwarded.as_bytes()).await?;
    upstream.write_all(&body_start).await?;

    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

/// Token present, signature valid, not expired, host in its allowlist.
/// No DNS resolution happens before this passes.
fn authorize(
    req: &RequestHead,
    host: &str,
    tokens: &TokenService,
) -> Result<SessionClaims, &'static str> {
    let token = req.proxy_token().ok_or("missing proxy credentials")?;
    let claims = tokens.verify(&token).map_err(|_| "invalid token")?;
    if !host_allowed(host, &claims.hosts) {
        return Err("host not in allowlist");
    }
    Ok(claims)
}

/// Exact DNS-name equality, case-insensitive, explicit port stripped.
/// Deliberately no wildcard or suffix matching.
pub fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let (host, _) = split_host_port(host, 0);
    let host = host.to_ascii_lowercase();
    allowed.iter().any(|a| a.to_ascii_lowercase() == host)
}

fn split_host_port(target: &str, default_port: u16) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (target.to_string(), default_port),
        },
        None => (target.to_string(), default_port),
    }
}

/// `http://host[:port]/path` -> (host, port, origin-form target).
fn parse_absolute_uri(target: &str) -> Option<(String, u16, String)> {
    let rest = target.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return None;
    }
    let (host, port) = split_host_port(authority, 80);
    Some((host, port, path.to_string()))
}

struct RequestHead {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn parse(head: &str) -> Option<Self> {
        let mut lines = head.split("\r\n");
        let request_line = lines.next()?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let target = parts.next()?.to_string();
        parts.next()?; // version

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':')?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        Some(Self {
            method,
            target,
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The session token from `Proxy-Authorization`. Accepts the Bearer
    /// scheme, and Basic where the password carries the token so clients
    /// driven purely by a proxy URL (curl, pip) work unmodified.
    fn proxy_token(&self) -> Option<String> {
        let value = self.header("proxy-authorization")?;
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
        if let Some(encoded) = value.strip_prefix("Basic ") {
            let decoded = BASE64.decode(encoded.trim()).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (_user, password) = decoded.split_once(':')?;
            return Some(password.to_string());
        }
        None
    }

    /// Rebuild the head for the upstream: origin-form request line, proxy
    /// hop headers dropped, connection forced closed so the relay ends.
    fn forward_head(&self, origin_form: &str) -> String {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, origin_form);
        for (name, value) in &self.headers {
            let lower = name.to_ascii_lowercase();
            if matches!(
                lower.as_str(),
                "proxy-authorization" | "proxy-connection" | "connection"
            ) {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("Connection: close\r\n\r\n");
        out
    }
}

/// Read until the blank line ending the head. Returns the head text and
/// any body bytes that arrived with it.
async fn read_head(stream: &mut TcpStream) -> anyhow::Result<(String, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed before head completed");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let head = String::from_utf8_lossy(&buf[..end]).into_owned();
            let rest = buf[end + 4..].to_vec();
            return Ok((head, rest));
        }
        if buf.len() > MAX_HEAD_BYTES {
            anyhow::bail!("request head too large");
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn respond(client: &mut TcpStream, status: &str) {
    let extra = if status.starts_with("407") {
        "Proxy-Authenticate: Bearer\r\n"
    } else {
        ""
    };
    let body = format!("HTTP/1.1 {status}\r\n{extra}Content-Length: 0\r\nConnection: close\r\n\r\n");
    let _ = client.write_all(body.as_bytes()).await;
}
