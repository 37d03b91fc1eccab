//! Local-address discovery and the loopback-only management surface mounted
//! on the proxy's own listen port.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http::header::HeaderValue;
use http::{Method, StatusCode};

use crate::error::{Error, Result};
use crate::h1::{self, Request};
use crate::proxy::server::Shared;
use crate::proxy::writer::{ResponseWriter, WriteFn};

/// Addresses that mean "this machine": every up, non-loopback IPv4 plus the
/// loopback literals. Empty means the proxy cannot recognize itself and
/// startup fails.
pub fn discover_local_ips() -> Result<HashSet<String>> {
    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|e| Error::Config(format!("failed to enumerate network interfaces: {e}")))?;
    let mut ips: HashSet<String> = HashSet::new();
    for (_name, ip) in interfaces {
        if let IpAddr::V4(v4) = ip {
            if !v4.is_loopback() {
                ips.insert(v4.to_string());
            }
        }
    }
    ips.insert("localhost".to_string());
    ips.insert("127.0.0.1".to_string());
    if ips.is_empty() {
        return Err(Error::Config("no usable local addresses".into()));
    }
    Ok(ips)
}

/// A request is for the management surface when its `Host` names this
/// machine on the proxy's own listen port.
pub fn is_management_request(req: &Request, local_ips: &HashSet<String>, listen_port: &str) -> bool {
    let (host, port) = h1::split_host_port(&req.host);
    let port = port.unwrap_or("80");
    local_ips.contains(host) && port == listen_port
}

fn set_cors(w: &mut ResponseWriter<'_>) {
    let headers = w.header_mut();
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert("access-control-allow-headers", HeaderValue::from_static("*"));
}

/// Build the write job answering one management request. Only loopback
/// peers get routed; everyone else sees a 404.
pub fn management_job(shared: Arc<Shared>, req: Request, peer: SocketAddr) -> WriteFn {
    Box::new(move |w| {
        set_cors(w);
        if !peer.ip().is_loopback() {
            w.set_status(StatusCode::NOT_FOUND);
            w.write(b"not found")?;
            return Ok(());
        }
        if req.method == Method::OPTIONS {
            w.set_status(StatusCode::NO_CONTENT);
            w.write(b"")?;
            return Ok(());
        }
        let path = req.path.split('?').next().unwrap_or("");
        match shared.routes.get(path) {
            Some(handler) => handler(w, &req),
            None => {
                w.set_status(StatusCode::NO_CONTENT);
                w.write(b"")?;
                Ok(())
            }
        }
    })
}
