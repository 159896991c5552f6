use std::fmt::{Debug, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, ServerName};
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::channel::config::ChannelConfig;
use crate::channel::link_url::LinkUrl;
use crate::channel::wire::FrameWriter;
use crate::error::{TgError, TgResult};

pub trait ChannelStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl <T: AsyncRead + AsyncWrite + Unpin + Send> ChannelStream for T {}

pub type BoxedStream = Box<dyn ChannelStream>;

pub fn boxed(stream: impl ChannelStream + 'static) -> BoxedStream {
    Box::new(stream)
}

/// The capability that distinguishes plain TCP channels from TLS channels: how a connected byte
///  stream is created, and how it is closed.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// the 'ssl mode' flag the handshake announces to the server
    fn ssl_mode(&self) -> bool;

    /// Connect to the URL's endpoint, returning the stream and the inbox address to use for
    ///  authentication
    async fn create_stream(&self, url: &LinkUrl) -> TgResult<(BoxedStream, String)>;

    async fn close_stream(&self, writer: &mut FrameWriter) -> TgResult<()> {
        writer.shutdown().await
    }
}

#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    send_buffer_size: u32,
    recv_buffer_size: u32,
}

impl TcpTransport {
    pub fn new(config: &ChannelConfig) -> TgResult<TcpTransport> {
        Ok(TcpTransport {
            connect_timeout: config.connect_timeout,
            send_buffer_size: config.send_buffer_size().map_err(|e| TgError::General(e.to_string()))?,
            recv_buffer_size: config.recv_buffer_size().map_err(|e| TgError::General(e.to_string()))?,
        })
    }

    async fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        }
        else {
            TcpSocket::new_v6()?
        };
        socket.set_nodelay(true)?;
        socket.set_keepalive(true)?;
        SockRef::from(&socket).set_linger(Some(Duration::ZERO))?;
        socket.set_send_buffer_size(self.send_buffer_size)?;
        socket.set_recv_buffer_size(self.recv_buffer_size)?;

        match tokio::time::timeout(self.connect_timeout, socket.connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("connecting to {} timed out after {:?}", addr, self.connect_timeout))),
        }
    }

    /// Try all addresses the URL's host resolves to, returning the first successful connection
    pub async fn connect(&self, url: &LinkUrl) -> TgResult<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host(url.socket_addr_string()).await? {
            match self.connect_addr(addr).await {
                Ok(stream) => {
                    debug!("connected to {} at {}", url, addr);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("connecting to {} at {} failed: {}", url, addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} does not resolve to any address", url.host())))
            .into())
    }
}

fn inbox_addr(stream: &TcpStream) -> TgResult<String> {
    Ok(stream.peer_addr()?.ip().to_string())
}

#[async_trait]
impl Transport for TcpTransport {
    fn ssl_mode(&self) -> bool {
        false
    }

    async fn create_stream(&self, url: &LinkUrl) -> TgResult<(BoxedStream, String)> {
        let stream = self.connect(url).await?;
        let inbox = inbox_addr(&stream)?;
        Ok((boxed(stream), inbox))
    }
}

/// TLS on top of [TcpTransport]. Server certificates are verified against the configured trust
///  roots, using the URL's host (or an explicitly configured name) as the server name.
pub struct TlsTransport {
    tcp: TcpTransport,
    connector: TlsConnector,
    expected_host_name: Option<String>,
}

impl Debug for TlsTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlsTransport{{tcp:{:?},expected_host_name:{:?}}}", self.tcp, self.expected_host_name)
    }
}

impl TlsTransport {
    /// Trusts the PEM certificates listed in the configuration plus `additional_roots`
    pub fn new(config: &ChannelConfig, additional_roots: Vec<CertificateDer<'static>>) -> TgResult<TlsTransport> {
        let mut roots = RootCertStore::empty();
        for path in &config.trusted_certificates {
            let certs = CertificateDer::pem_file_iter(path)
                .map_err(|e| TgError::General(format!("error reading trusted certificates from {:?}: {}", path, e)))?;
            for cert in certs {
                let cert = cert.map_err(|e| TgError::General(format!("invalid certificate in {:?}: {}", path, e)))?;
                roots.add(cert)
                    .map_err(|e| TgError::General(format!("unusable certificate in {:?}: {}", path, e)))?;
            }
        }
        for cert in additional_roots {
            roots.add(cert)
                .map_err(|e| TgError::General(format!("unusable trusted certificate: {}", e)))?;
        }
        if roots.is_empty() {
            warn!("TLS transport without any trusted certificates - no server will be accepted");
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(TlsTransport {
            tcp: TcpTransport::new(config)?,
            connector: TlsConnector::from(Arc::new(tls_config)),
            expected_host_name: config.expected_host_name.clone(),
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    fn ssl_mode(&self) -> bool {
        true
    }

    async fn create_stream(&self, url: &LinkUrl) -> TgResult<(BoxedStream, String)> {
        let server_name = self.expected_host_name.as_deref().unwrap_or(url.host()).to_string();
        let server_name = ServerName::try_from(server_name)
            .map_err(|e| TgError::General(format!("invalid TLS server name for {}: {}", url, e)))?;

        let stream = self.tcp.connect(url).await?;
        let inbox = inbox_addr(&stream)?;

        let tls_stream = self.connector.connect(server_name, stream).await?;
        debug!("TLS session established with {}", url);
        Ok((boxed(tls_stream), inbox))
    }
}
