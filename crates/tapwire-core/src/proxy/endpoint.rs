//! Peer endpoints: a uniform read/write handle over either a raw TCP socket
//! or a TLS session layered over it, with a buffered reader for HTTP
//! message parsing.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::{Method, StatusCode};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};
use crate::h1::{self, Request, Response};
use crate::proxy::hooks::ProxyHint;
use crate::tls::{self, signer::SignedCert};

macro_rules! delegate_io {
    ($name:ident) => {
        impl AsyncRead for $name {
            fn poll_read(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                match self.get_mut() {
                    $name::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
                    $name::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
                }
            }
        }

        impl AsyncWrite for $name {
            fn poll_write(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                data: &[u8],
            ) -> Poll<io::Result<usize>> {
                match self.get_mut() {
                    $name::Plain(stream) => Pin::new(stream).poll_write(cx, data),
                    $name::Tls(stream) => Pin::new(stream).poll_write(cx, data),
                }
            }

            fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                match self.get_mut() {
                    $name::Plain(stream) => Pin::new(stream).poll_flush(cx),
                    $name::Tls(stream) => Pin::new(stream).poll_flush(cx),
                }
            }

            fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                match self.get_mut() {
                    $name::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
                    $name::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
                }
            }
        }
    };
}

/// Downstream stream: plain on accept, TLS after a CONNECT interposition.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
}

/// Upstream stream: plain after dial, TLS after `upgrade_to_tls_client`.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

delegate_io!(ClientStream);
delegate_io!(UpstreamStream);

/// Read side of the downstream connection. The write half lives with the
/// serializer task; the two are reunited only for TLS upgrades and splices.
pub struct ClientEndpoint {
    reader: BufReader<ReadHalf<ClientStream>>,
    is_tls: bool,
}

impl ClientEndpoint {
    pub fn split(stream: ClientStream, is_tls: bool) -> (Self, WriteHalf<ClientStream>) {
        let (rd, wr) = tokio::io::split(stream);
        (
            Self {
                reader: BufReader::new(rd),
                is_tls,
            },
            wr,
        )
    }

    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    pub async fn read_request(&mut self) -> Result<Request> {
        h1::read_request(&mut self.reader).await
    }

    /// Reunite with the write half, surrendering the stream and whatever
    /// the reader had buffered beyond the last parsed message.
    pub fn into_stream(self, wr: WriteHalf<ClientStream>) -> (ClientStream, Vec<u8>) {
        let pending = self.reader.buffer().to_vec();
        (self.reader.into_inner().unsplit(wr), pending)
    }
}

/// Wrap the (plain) downstream stream in a TLS server session presenting the
/// minted leaf. Bytes buffered from the plain phase are gone by construction:
/// the caller rebuilt the endpoint from the raw stream.
pub async fn accept_tls(stream: ClientStream, cert: &SignedCert) -> Result<ClientStream> {
    let tcp = match stream {
        ClientStream::Plain(tcp) => tcp,
        ClientStream::Tls(_) => return Err(Error::Tls("client session is already tls".into())),
    };
    let acceptor = TlsAcceptor::from(tls::server_config(cert)?);
    let session = acceptor
        .accept(tcp)
        .await
        .map_err(|e| Error::Tls(format!("client handshake failed: {e}")))?;
    Ok(ClientStream::Tls(session))
}

/// One upstream connection, owned exclusively by its connector and cached in
/// the connector's server map under the original request host.
pub struct ServerEndpoint {
    reader: BufReader<UpstreamStream>,
    is_tls: bool,
}

impl ServerEndpoint {
    pub async fn dial(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            reader: BufReader::new(UpstreamStream::Plain(stream)),
            is_tls: false,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    pub async fn write_request(&mut self, req: &Request) -> Result<()> {
        let raw = h1::encode_request(req);
        let stream = self.reader.get_mut();
        stream.write_all(&raw).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn read_response(&mut self, req_method: &Method) -> Result<Response> {
        h1::read_response(&mut self.reader, req_method).await
    }

    /// Upgrade the upstream side to TLS. When an upstream HTTP proxy is in
    /// play, a CONNECT tunnel is negotiated first (Basic credentials from the
    /// hint); the CONNECT response is consumed through the buffered reader
    /// before the plain-side buffer is discarded for the handshake.
    pub async fn upgrade_to_tls_client(mut self, target: &str, hint: &ProxyHint) -> Result<Self> {
        if self.is_tls {
            return Ok(self);
        }
        if !hint.address.is_empty() {
            let auth = BASE64.encode(format!("{}:{}", hint.username, hint.password));
            let connect = format!(
                "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Authorization: Basic {auth}\r\n\r\n"
            );
            let stream = self.reader.get_mut();
            stream.write_all(connect.as_bytes()).await?;
            stream.flush().await?;
            let resp = h1::read_response(&mut self.reader, &Method::CONNECT).await?;
            if resp.status != StatusCode::OK {
                return Err(Error::UpstreamProxy(format!(
                    "proxy returned non-200 status: {} {}",
                    resp.status.as_u16(),
                    resp.reason
                )));
            }
        }

        let host = h1::hostname_of(target).to_string();
        let server_name = ServerName::try_from(host)
            .map_err(|e| Error::Tls(format!("bad server name {target:?}: {e}")))?;
        let tcp = match self.reader.into_inner() {
            UpstreamStream::Plain(tcp) => tcp,
            UpstreamStream::Tls(_) => {
                return Err(Error::Tls("upstream session is already tls".into()))
            }
        };
        let session = tls::insecure_connector()
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Tls(format!("upstream handshake failed: {e}")))?;
        Ok(Self {
            reader: BufReader::new(UpstreamStream::Tls(session)),
            is_tls: true,
        })
    }

    /// Surrender the stream for a splice, along with any bytes the reader
    /// had buffered past the 101 response.
    pub fn into_stream(self) -> (UpstreamStream, Vec<u8>) {
        let pending = self.reader.buffer().to_vec();
        (self.reader.into_inner(), pending)
    }
}
