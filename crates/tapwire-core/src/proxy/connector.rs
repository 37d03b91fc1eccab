//! The per-downstream-connection state machine: request loop, TLS
//! interposition bootstrap, upstream forwarding with retry-once, hook
//! pipeline, and the WebSocket splice.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::h1::{self, Framing, Request, Response};
use crate::proxy::endpoint::{self, ClientEndpoint, ClientStream, ServerEndpoint};
use crate::proxy::hooks::ProxyHint;
use crate::proxy::serializer::{self, WriteJob};
use crate::proxy::server::Shared;
use crate::proxy::writer::WriteFn;
use crate::proxy::{inject, mgmt};

const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const SPLICE_MAX: Duration = Duration::from_secs(24 * 60 * 60);
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

enum Outcome {
    Continue,
    /// A 101 was relayed; take the named upstream endpoint and go raw.
    Splice(String),
}

/// Drive one downstream connection to completion. Every upstream endpoint
/// opened on its behalf is closed when this returns.
pub(crate) async fn run(shared: Arc<Shared>, uid: u64, stream: TcpStream, peer: SocketAddr) {
    let (mut client, wr) = ClientEndpoint::split(ClientStream::Plain(stream), false);
    let write_tx = serializer::spawn(uid, wr);
    let mut servers: HashMap<String, ServerEndpoint> = HashMap::new();

    loop {
        let req = match timeout(CLIENT_IDLE_TIMEOUT, client.read_request()).await {
            Ok(Ok(req)) => req,
            Ok(Err(Error::Network(e))) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Ok(Err(e)) => {
                debug!(uid, "client read failed: {e}");
                break;
            }
            Err(_) => {
                debug!(uid, "client idle timeout");
                break;
            }
        };

        if mgmt::is_management_request(&req, &shared.local_ips, &shared.port) {
            let job = mgmt::management_job(shared.clone(), req, peer);
            if write_tx.send(WriteJob::Response(job)).await.is_err() {
                break;
            }
            continue;
        }

        if req.method == Method::CONNECT {
            match upgrade_client(&shared, client, &write_tx, &req).await {
                Ok(upgraded) => {
                    client = upgraded;
                    continue;
                }
                Err(e) => {
                    warn!(uid, "tls interposition failed for {}: {e}", req.host);
                    break;
                }
            }
        }

        let handled = AssertUnwindSafe(proxied(
            &shared,
            uid,
            &mut servers,
            client.is_tls(),
            &write_tx,
            peer,
            req,
        ))
        .catch_unwind()
        .await;
        match handled {
            Err(_) => {
                error!(uid, "request handler panicked; continuing");
                continue;
            }
            Ok(Outcome::Continue) => continue,
            Ok(Outcome::Splice(host)) => {
                if let Some(server) = servers.remove(&host) {
                    splice(uid, client, &write_tx, server).await;
                }
                break;
            }
        }
    }
}

/// `CONNECT` bootstrap: acknowledge on the plain socket, reclaim the write
/// half, handshake with a leaf minted for the tunnel host, and hand a fresh
/// write half back to the serializer. Buffered plain-side bytes are dropped
/// at the upgrade point.
async fn upgrade_client(
    shared: &Shared,
    client: ClientEndpoint,
    write_tx: &mpsc::Sender<WriteJob>,
    req: &Request,
) -> Result<ClientEndpoint> {
    let hostname = h1::hostname_of(&req.host);
    let cert = shared.signer.sign_host(&[hostname])?;

    send(write_tx, WriteJob::Raw(Bytes::from_static(CONNECT_ESTABLISHED))).await?;
    let (give_tx, give_rx) = oneshot::channel();
    let (back_tx, back_rx) = oneshot::channel();
    send(write_tx, WriteJob::Handoff(give_tx, back_rx)).await?;
    let wr = give_rx
        .await
        .map_err(|_| Error::Network(channel_closed()))?;

    let (stream, _discarded) = client.into_stream(wr);
    let session = endpoint::accept_tls(stream, &cert).await?;
    let (client, wr) = ClientEndpoint::split(session, true);
    let _ = back_tx.send(Some(wr));
    Ok(client)
}

/// The hook pipeline plus forwarding for one ordinary request.
async fn proxied(
    shared: &Shared,
    uid: u64,
    servers: &mut HashMap<String, ServerEndpoint>,
    client_is_tls: bool,
    write_tx: &mpsc::Sender<WriteJob>,
    peer: SocketAddr,
    mut req: Request,
) -> Outcome {
    let is_websocket = h1::is_websocket_upgrade(&req);

    // guarantee a decodable body for the injector downstream
    if shared.hooks.html_producer.is_some() {
        req.headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );
    }

    if let Some(hook) = &shared.hooks.request_hook {
        if let Some(writer) = hook(&mut req) {
            let _ = write_tx.send(WriteJob::Response(writer)).await;
            return Outcome::Continue;
        }
    }

    let hint = shared
        .hooks
        .proxy_selector
        .as_ref()
        .map(|select| select(&req))
        .unwrap_or_default();

    let mut resp = match forward(servers, client_is_tls, &hint, &req).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(uid, "forwarding {} failed: {e}", req.host);
            let _ = write_tx
                .send(WriteJob::Response(bad_gateway(e.to_string())))
                .await;
            return Outcome::Continue;
        }
    };

    if let Some(producer) = &shared.hooks.html_producer {
        if let Err(e) = inject::inject_into_body(&mut resp, producer) {
            warn!(uid, "html injection failed: {e}");
        }
    }

    if let Some(hook) = &shared.hooks.response_hook {
        if let Some(writer) = hook(&mut resp) {
            let _ = write_tx.send(WriteJob::Response(writer)).await;
            return Outcome::Continue;
        }
    }

    let raw = h1::encode_response(&resp);
    let _ = write_tx.send(WriteJob::Raw(raw.into())).await;
    info!("{} {} {}", peer, req.url_display(), resp.status);

    if is_websocket {
        let scheme = if servers.get(&req.host).is_some_and(|s| s.is_tls()) {
            "wss"
        } else {
            "ws"
        };
        if resp.status == StatusCode::SWITCHING_PROTOCOLS {
            info!("websocket connected: {scheme}://{}", req.host);
            return Outcome::Splice(req.host.clone());
        }
        warn!("websocket connect error: {scheme}://{}", req.host);
    }
    Outcome::Continue
}

/// Dial/reuse the upstream endpoint and run one exchange, re-dialing once
/// on a retryable failure. A second failure surfaces to the caller (502).
async fn forward(
    servers: &mut HashMap<String, ServerEndpoint>,
    client_is_tls: bool,
    hint: &ProxyHint,
    req: &Request,
) -> Result<Response> {
    let is_tls = match req.scheme.as_deref() {
        Some("https") => true,
        Some(_) => false,
        None => client_is_tls,
    };
    // the map stays keyed by the original host, proxy or not
    let key = req.host.clone();
    let origin_target = h1::with_default_port(&req.host, is_tls);
    let dial_addr = if hint.is_direct() {
        origin_target.clone()
    } else {
        hint.address.clone()
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        match exchange(servers, &key, &dial_addr, &origin_target, is_tls, hint, req).await {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                servers.remove(&key);
                if attempt >= 2 || !e.is_retryable() {
                    return Err(e);
                }
                debug!("retrying {key} after upstream failure: {e}");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn exchange(
    servers: &mut HashMap<String, ServerEndpoint>,
    key: &str,
    dial_addr: &str,
    origin_target: &str,
    is_tls: bool,
    hint: &ProxyHint,
    req: &Request,
) -> Result<Response> {
    let mut server = match servers.remove(key) {
        Some(server) => server,
        None => ServerEndpoint::dial(dial_addr).await?,
    };
    if is_tls && !server.is_tls() {
        server = server.upgrade_to_tls_client(origin_target, hint).await?;
    }
    server.write_request(req).await?;
    let resp = server.read_response(&req.method).await?;
    // a read-to-EOF body exhausts the connection; don't cache it
    if resp.framing != Framing::UntilClose {
        servers.insert(key.to_string(), server);
    }
    Ok(resp)
}

/// Verbatim bidirectional copy after a forwarded 101, bypassing the queue
/// once the acknowledged response has drained through it.
async fn splice(
    uid: u64,
    client: ClientEndpoint,
    write_tx: &mpsc::Sender<WriteJob>,
    server: ServerEndpoint,
) {
    let (give_tx, give_rx) = oneshot::channel();
    let (back_tx, back_rx) = oneshot::channel();
    if write_tx
        .send(WriteJob::Handoff(give_tx, back_rx))
        .await
        .is_err()
    {
        return;
    }
    let Ok(wr) = give_rx.await else { return };
    let _ = back_tx.send(None); // the splice owns the stream from here

    let (mut client_stream, client_pending) = client.into_stream(wr);
    let (mut server_stream, server_pending) = server.into_stream();
    if !server_pending.is_empty() && client_stream.write_all(&server_pending).await.is_err() {
        return;
    }
    if !client_pending.is_empty() && server_stream.write_all(&client_pending).await.is_err() {
        return;
    }

    match timeout(
        SPLICE_MAX,
        copy_bidirectional(&mut client_stream, &mut server_stream),
    )
    .await
    {
        Ok(Ok((up, down))) => debug!(uid, "websocket closed ({up} bytes up, {down} bytes down)"),
        Ok(Err(e)) => debug!(uid, "websocket ended: {e}"),
        Err(_) => debug!(uid, "websocket splice deadline reached"),
    }
}

fn bad_gateway(message: String) -> WriteFn {
    Box::new(move |w| {
        w.set_status(StatusCode::BAD_GATEWAY);
        w.header_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        w.write(message.as_bytes()).map(|_| ())
    })
}

async fn send(tx: &mpsc::Sender<WriteJob>, job: WriteJob) -> Result<()> {
    tx.send(job)
        .await
        .map_err(|_| Error::Network(channel_closed()))
}

fn channel_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client write channel closed")
}
