//! Latency Probe
//!
//! Sends one HEAD request through the local SOCKS5 listener of a test
//! session and times it.
//!
//! # Flow
//!
//! ```text
//! probe → SOCKS5 (127.0.0.1:<port>) → engine → probe URL
//! ```
//!
//! The connect timeout covers the TCP connect, the SOCKS5 handshake and TLS;
//! the read timeout covers the HTTP exchange.

use crate::config::TestSettings;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;

/// Probe errors
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connect timeout")]
    ConnectTimeout,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("SOCKS5 handshake failed: {0}")]
    Socks(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unexpected status {0}")]
    Status(StatusCode),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Probe target and timeouts
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl From<&TestSettings> for ProbeConfig {
    fn from(settings: &TestSettings) -> Self {
        Self {
            url: settings.probe_url.clone(),
            connect_timeout: settings.connect_timeout(),
            read_timeout: settings.read_timeout(),
        }
    }
}

/// Outcome of a successful probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub status: StatusCode,
    pub elapsed: Duration,
}

impl ProbeResult {
    /// Round trip in whole milliseconds
    pub fn millis(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

/// Parsed probe target
struct Target {
    host: String,
    port: u16,
    https: bool,
    authority: String,
    path: String,
}

impl Target {
    fn parse(url: &str) -> Result<Self, ProbeError> {
        let uri: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ProbeError::InvalidUrl(e.to_string()))?;

        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(ProbeError::InvalidUrl(format!("unsupported scheme in {}", url))),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| ProbeError::InvalidUrl("No host in URL".to_string()))?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = authority.port_u16().unwrap_or(if https { 443 } else { 80 });
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            host,
            port,
            https,
            authority: authority.as_str().to_string(),
            path,
        })
    }
}

/// HEAD-through-SOCKS latency probe
#[derive(Debug, Clone)]
pub struct SocksProbe {
    config: ProbeConfig,
    /// Shared by every HTTPS request
    tls: Arc<ClientConfig>,
}

impl SocksProbe {
    pub fn new(config: ProbeConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            config,
            tls: Arc::new(tls),
        }
    }

    /// Probe through the SOCKS listener on `127.0.0.1:<socks_port>`
    ///
    /// Succeeds on any 2xx status, 204 included.
    pub async fn head(&self, socks_port: u16) -> Result<ProbeResult, ProbeError> {
        let target = Target::parse(&self.config.url)?;
        let start = Instant::now();

        let stream = timeout(self.config.connect_timeout, connect(socks_port, &target))
            .await
            .map_err(|_| ProbeError::ConnectTimeout)??;

        let status = if target.https {
            let handshake = tls_handshake(&self.tls, stream, &target.host);
            let tls = timeout(self.config.connect_timeout, handshake)
                .await
                .map_err(|_| ProbeError::ConnectTimeout)??;
            timeout(self.config.read_timeout, send_head(tls, &target))
                .await
                .map_err(|_| ProbeError::ReadTimeout)??
        } else {
            timeout(self.config.read_timeout, send_head(stream, &target))
                .await
                .map_err(|_| ProbeError::ReadTimeout)??
        };
        let elapsed = start.elapsed();

        debug!("Probe {} -> {} in {:?}", self.config.url, status, elapsed);

        if !status.is_success() {
            return Err(ProbeError::Status(status));
        }
        Ok(ProbeResult { status, elapsed })
    }
}

/// Open a CONNECT tunnel to the target through the local SOCKS5 listener
async fn connect(socks_port: u16, target: &Target) -> Result<TcpStream, ProbeError> {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, socks_port)).await?;

    // ===== Method negotiation =====
    stream.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(ProbeError::Socks(format!("invalid version {}", choice[0])));
    }
    if choice[1] != AUTH_NO_AUTH {
        return Err(ProbeError::Socks("no-auth method rejected".to_string()));
    }

    // ===== Connection request =====
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ADDR_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ADDR_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(target.host.len())
                .map_err(|_| ProbeError::InvalidUrl("host name too long".to_string()))?;
            request.push(ADDR_DOMAIN);
            request.push(len);
            request.extend_from_slice(target.host.as_bytes());
        }
    }
    request.extend_from_slice(&target.port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != REPLY_SUCCESS {
        return Err(ProbeError::Socks(format!("connect rejected (reply {})", header[1])));
    }

    // Skip the bound address
    let skip = match header[3] {
        ADDR_IPV4 => 4 + 2,
        ADDR_IPV6 => 16 + 2,
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => return Err(ProbeError::Socks(format!("invalid address type {}", other))),
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}

async fn tls_handshake(
    tls: &Arc<ClientConfig>,
    stream: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ProbeError> {
    let connector = TlsConnector::from(tls.clone());
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| ProbeError::Tls("Invalid server name".to_string()))?;

    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ProbeError::Tls(e.to_string()))
}

async fn send_head<S>(io: S, target: &Target) -> Result<StatusCode, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Probe connection closed: {}", e);
        }
    });

    let request = Request::builder()
        .method(Method::HEAD)
        .uri(target.path.as_str())
        .header(HOST, target.authority.as_str())
        .header(USER_AGENT, "ivpn-probe/0.1")
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProbeError::Http(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?;

    Ok(response.status())
}

#[cfg(test)]
pub(crate) mod testing {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Loopback SOCKS5 server that answers every CONNECT with a canned HTTP
    /// response instead of dialing out
    pub async fn spawn_fake_socks(reply: u8, http_response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, reply, http_response));
            }
        });
        port
    }

    async fn serve(mut stream: TcpStream, reply: u8, http_response: &'static str) {
        let mut greeting = [0u8; 2];
        if stream.read_exact(&mut greeting).await.is_err() {
            return;
        }
        let mut methods = vec![0u8; greeting[1] as usize];
        let _ = stream.read_exact(&mut methods).await;
        let _ = stream.write_all(&[0x05, 0x00]).await;

        let mut header = [0u8; 4];
        let _ = stream.read_exact(&mut header).await;
        let addr_len = match header[3] {
            0x01 => 4,
            0x04 => 16,
            _ => {
                let mut len = [0u8; 1];
                let _ = stream.read_exact(&mut len).await;
                len[0] as usize
            }
        };
        let mut rest = vec![0u8; addr_len + 2];
        let _ = stream.read_exact(&mut rest).await;
        let _ = stream
            .write_all(&[0x05, reply, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await;
        if reply != 0x00 {
            return;
        }

        // Read the request head, then answer
        let mut request = Vec::new();
        let mut buf = [0u8; 512];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        let _ = stream.write_all(http_response.as_bytes()).await;
    }
}
