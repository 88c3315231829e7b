//! A minimal single-origin HTTP/1.1 client.
//!
//! This is deliberately hand-rolled rather than built on a general-purpose
//! HTTP library: the control plane talks to exactly one origin, never
//! pipelines, and the agent needs direct control over the connection state
//! machine (so a broken socket can be detected and replaced without
//! tearing down the whole client) and over chunked-body decoding.
//!
//! State machine of the connection:
//!
//! ```text
//! Idle -> Connecting -> [Handshaking ->] Ready -> Sending -> Reading -> Ready
//!                                                                \-> Broken
//! ```
//!
//! On `Broken`, the next `send` transitions back to `Connecting`.

pub mod chunked;
pub mod uri;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{AgentError, AgentResult};
use uri::Origin;

/// An HTTP request ready to be sent on a connection.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: &'static str,
    /// Path and query, e.g. `/v1/uploads/abcd`. Relative to the origin.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: &'static str, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

/// A parsed HTTP response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Idle,
    Ready,
    Broken,
}

enum Conn {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A reusable single-origin HTTP/1.1 connection.
pub struct HttpClient {
    origin: Origin,
    verify_tls: bool,
    timeout: Duration,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    conn: Option<BufReader<Conn>>,
    state: ConnState,
    http_logging: bool,
}

impl HttpClient {
    pub fn new(origin_uri: &str) -> AgentResult<Self> {
        let origin = Origin::parse(origin_uri)?;
        Ok(Self {
            origin,
            verify_tls: true,
            timeout: Duration::from_secs(30),
            tls_config: None,
            conn: None,
            state: ConnState::Idle,
            http_logging: false,
        })
    }

    pub fn set_timeout(&mut self, duration: Duration) {
        self.timeout = duration;
    }

    /// Enables verbose request/response line logging at `debug` level, per
    /// the `http_logging` setting. Off by default: request lines may carry
    /// sensitive path segments, so this is opt-in.
    pub fn set_http_logging(&mut self, enabled: bool) {
        self.http_logging = enabled;
    }

    /// Enables or disables TLS certificate verification. Disabling this is
    /// only ever appropriate for local development against a self-signed
    /// control plane.
    pub fn set_verify_tls(&mut self, verify: bool) {
        if verify != self.verify_tls {
            self.verify_tls = verify;
            self.tls_config = None;
            self.conn = None;
            self.state = ConnState::Idle;
        }
    }

    /// Overrides whether the connection uses TLS, independent of what the
    /// origin's scheme would otherwise select. Resets any open connection
    /// so the next `send` reconnects under the new choice.
    pub fn set_ssl(&mut self, enabled: bool) {
        if enabled != self.origin.https {
            self.origin.https = enabled;
            self.tls_config = None;
            self.conn = None;
            self.state = ConnState::Idle;
        }
    }

    fn build_tls_config(&self) -> AgentResult<Arc<rustls::ClientConfig>> {
        if !self.verify_tls {
            let mut config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerify))
                .with_no_client_auth();
            config.enable_sni = true;
            return Ok(Arc::new(config));
        }

        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            warn!(%err, "failed to load a native certificate");
        }
        for cert in native.certs {
            // Malformed individual certificates are skipped rather than
            // failing the whole client.
            let _ = roots.add(cert);
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }

    async fn connect(&mut self) -> AgentResult<()> {
        trace!(host = %self.origin.host, port = self.origin.port, "connecting");
        let tcp = timeout(
            self.timeout,
            TcpStream::connect((self.origin.host.as_str(), self.origin.port)),
        )
        .await
        .map_err(|_| AgentError::Timeout(self.timeout))??;
        tcp.set_nodelay(true).ok();

        let conn = if self.origin.https {
            let config = match &self.tls_config {
                Some(config) => config.clone(),
                None => {
                    let config = self.build_tls_config()?;
                    self.tls_config = Some(config.clone());
                    config
                }
            };
            let connector = tokio_rustls::TlsConnector::from(config);
            let server_name = ServerName::try_from(self.origin.host.clone())
                .map_err(|_| AgentError::Tls(format!("invalid DNS name: {}", self.origin.host)))?;
            let tls = timeout(self.timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| AgentError::Timeout(self.timeout))?
                .map_err(|e| AgentError::Tls(e.to_string()))?;
            Conn::Tls(Box::new(tls))
        } else {
            Conn::Plain(tcp)
        };

        self.conn = Some(BufReader::new(conn));
        self.state = ConnState::Ready;
        Ok(())
    }

    /// Sends a request and returns the parsed response, transparently
    /// (re)connecting as needed.
    pub async fn send(&mut self, request: &Request) -> AgentResult<Response> {
        if self.state != ConnState::Ready || self.conn.is_none() {
            self.connect().await?;
        }

        match self.send_on_current_conn(request).await {
            Ok(response) => {
                if response
                    .header("connection")
                    .map(|v| v.eq_ignore_ascii_case("close"))
                    .unwrap_or(false)
                {
                    trace!("peer requested Connection: close, dropping socket");
                    self.conn = None;
                    self.state = ConnState::Idle;
                } else {
                    self.state = ConnState::Ready;
                }
                Ok(response)
            }
            Err(err) => {
                // The connection may have been closed by the peer (idle
                // timeout, load balancer reset). Retry exactly once on a
                // fresh connection before surfacing the error.
                self.state = ConnState::Broken;
                self.conn = None;
                debug!(%err, "connection broken, reconnecting once");
                self.connect().await?;
                let response = self.send_on_current_conn(request).await?;
                self.state = ConnState::Ready;
                Ok(response)
            }
        }
    }

    async fn send_on_current_conn(&mut self, request: &Request) -> AgentResult<Response> {
        let full_path = format!("{}{}", self.origin.base_path, request.path);
        if self.http_logging {
            debug!(method = request.method, path = %full_path, body_len = request.body.len(), "sending request");
        }
        let mut head = format!("{} {} HTTP/1.1\r\n", request.method, full_path);
        head.push_str(&format!("Host: {}\r\n", self.origin.host));
        head.push_str(&format!("Content-Length: {}\r\n", request.body.len()));
        head.push_str("Connection: keep-alive\r\n");

        let mut has_content_type = false;
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        if !has_content_type && !request.body.is_empty() {
            head.push_str("Content-Type: application/octet-stream\r\n");
        }
        head.push_str("\r\n");

        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| AgentError::Protocol("no active connection".into()))?;

        timeout(self.timeout, async {
            conn.get_mut().write_all(head.as_bytes()).await?;
            conn.get_mut().write_all(&request.body).await?;
            conn.get_mut().flush().await
        })
        .await
        .map_err(|_| AgentError::Timeout(self.timeout))??;

        let response = timeout(self.timeout, read_response(conn))
            .await
            .map_err(|_| AgentError::Timeout(self.timeout))??;

        if self.http_logging {
            debug!(status = response.status, body_len = response.body.len(), "received response");
        }
        Ok(response)
    }
}

async fn read_response<R>(reader: &mut BufReader<R>) -> AgentResult<Response>
where
    R: AsyncRead + AsyncWrite + Unpin,
    BufReader<R>: AsyncBufRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    if status_line.is_empty() {
        return Err(AgentError::Protocol("connection closed before response".into()));
    }
    let status = parse_status_line(&status_line)?;

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line == "\r\n" || line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| AgentError::Protocol(format!("malformed header line: {line:?}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let header = |name: &str| -> Option<&str> {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let body = if header("transfer-encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
    {
        chunked::read_chunked_body(reader).await?
    } else if let Some(len) = header("content-length") {
        let len: usize = len
            .parse()
            .map_err(|_| AgentError::Protocol(format!("invalid Content-Length: {len}")))?;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        body
    } else {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;
        body
    };

    Ok(Response {
        status,
        headers,
        body,
    })
}

fn parse_status_line(line: &str) -> AgentResult<u16> {
    let mut parts = line.trim_end().splitn(3, ' ');
    let _version = parts
        .next()
        .ok_or_else(|| AgentError::Protocol("empty status line".into()))?;
    let status = parts
        .next()
        .ok_or_else(|| AgentError::Protocol(format!("missing status code: {line:?}")))?;
    status
        .parse()
        .map_err(|_| AgentError::Protocol(format!("invalid status code: {status:?}")))
}

/// A certificate verifier that accepts anything. Used only when TLS
/// verification has been explicitly disabled by configuration.
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_line_ok() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK\r\n").unwrap(), 200);
    }

    #[test]
    fn test_set_ssl_overrides_scheme_derived_choice() {
        let mut client = HttpClient::new("http://example.com").unwrap();
        assert!(!client.origin.https);

        client.set_ssl(true);
        assert!(client.origin.https);

        // Flipping back to the same value must not disturb an (absent)
        // connection or force an unnecessary reconnect.
        client.set_ssl(true);
        assert!(client.origin.https);

        client.set_ssl(false);
        assert!(!client.origin.https);
    }

    #[test]
    fn test_parse_status_line_no_reason_phrase() {
        assert_eq!(parse_status_line("HTTP/1.1 204\r\n").unwrap(), 204);
    }

    #[test]
    fn test_parse_status_line_rejects_garbage() {
        assert!(parse_status_line("garbage\r\n").is_err());
    }

    #[tokio::test]
    async fn test_read_response_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = BufReader::new(std::io::Cursor::new(raw.to_vec()));
        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
    }

    #[tokio::test]
    async fn test_read_response_chunked() {
        let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        raw.extend_from_slice(&chunked::encode_for_test(b"streamed body", 4));
        let mut reader = BufReader::new(std::io::Cursor::new(raw));
        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.body, b"streamed body");
    }

    #[tokio::test]
    async fn test_read_response_no_framing_reads_to_eof() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\nrest-of-stream";
        let mut reader = BufReader::new(std::io::Cursor::new(raw.to_vec()));
        let response = read_response(&mut reader).await.unwrap();
        assert_eq!(response.body, b"rest-of-stream");
    }

    #[test]
    fn test_response_header_lookup_case_insensitive() {
        let response = Response {
            status: 200,
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: Vec::new(),
        };
        assert_eq!(response.header("content-type"), Some("text/plain"));
    }

    /// Drives `HttpClient::send` end-to-end over a real loopback socket: two
    /// requests on the same client, verifying the connection is reused
    /// (only one `TcpStream` accepted) and the response body round-trips.
    #[tokio::test]
    async fn test_send_over_loopback_reuses_connection() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for body in ["first", "second"] {
                let mut buf = [0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap();
                let request = String::from_utf8_lossy(&buf[..n]);
                assert!(request.starts_with("POST /echo HTTP/1.1\r\n"));

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });

        let mut client = HttpClient::new(&format!("http://{addr}")).unwrap();
        for expected in ["first", "second"] {
            let request = Request::new("POST", "/echo").body(b"ping".to_vec());
            let response = client.send(&request).await.unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(response.body, expected.as_bytes());
        }

        server.await.unwrap();
    }
}
