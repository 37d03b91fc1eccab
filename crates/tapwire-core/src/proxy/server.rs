//! The top-level proxy container: accepts downstream connections, spawns a
//! connector per connection, and owns the hooks, management routes, and the
//! active-connector registry.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::h1::{Request, Response};
use crate::proxy::hooks::{Hooks, MgmtHandler, ProxyHint};
use crate::proxy::writer::{ResponseWriter, WriteFn};
use crate::proxy::{connector, mgmt};
use crate::tls::signer::HostSigner;

#[derive(Default)]
struct Registry {
    count: usize,
    uid: u64,
    conns: HashMap<u64, SocketAddr>,
}

/// State shared by every connector task. Hooks and routes are frozen once
/// serving starts; only the registry mutates, under its mutex.
pub struct Shared {
    pub(crate) signer: HostSigner,
    pub(crate) hooks: Hooks,
    pub(crate) routes: HashMap<String, MgmtHandler>,
    pub(crate) local_ips: HashSet<String>,
    pub(crate) port: String,
    active: Mutex<Registry>,
}

impl Shared {
    fn register(&self, peer: SocketAddr) -> u64 {
        let mut reg = self.active.lock();
        reg.uid += 1;
        reg.count += 1;
        let uid = reg.uid;
        reg.conns.insert(uid, peer);
        info!("conn++: {}", reg.count);
        uid
    }

    fn deregister(&self, uid: u64) {
        let mut reg = self.active.lock();
        if reg.conns.remove(&uid).is_some() {
            reg.count -= 1;
        }
        info!("conn--: {}", reg.count);
    }

    pub fn active_connections(&self) -> usize {
        self.active.lock().count
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        signer: HostSigner,
        routes: HashMap<String, MgmtHandler>,
        local_ips: HashSet<String>,
        port: &str,
    ) -> Self {
        Self {
            signer,
            hooks: Hooks::default(),
            routes,
            local_ips,
            port: port.to_string(),
            active: Mutex::new(Registry::default()),
        }
    }
}

/// The proxy container. Configure hooks and management routes, then
/// [`start`](Proxy::start) it.
pub struct Proxy {
    signer: HostSigner,
    hooks: Hooks,
    routes: HashMap<String, MgmtHandler>,
}

impl Proxy {
    pub fn new(signer: HostSigner) -> Self {
        Self {
            signer,
            hooks: Hooks::default(),
            routes: HashMap::new(),
        }
    }

    /// Pick an upstream HTTP proxy per request.
    pub fn set_proxy(
        &mut self,
        select: impl Fn(&Request) -> ProxyHint + Send + Sync + 'static,
    ) -> &mut Self {
        self.hooks.proxy_selector = Some(Box::new(select));
        self
    }

    /// Inspect/rewrite each request; returning a writer short-circuits the
    /// upstream entirely.
    pub fn process_request(
        &mut self,
        hook: impl Fn(&mut Request) -> Option<WriteFn> + Send + Sync + 'static,
    ) -> &mut Self {
        self.hooks.request_hook = Some(Box::new(hook));
        self
    }

    /// Inspect/rewrite each response; returning a writer replaces it.
    pub fn process_response(
        &mut self,
        hook: impl Fn(&mut Response) -> Option<WriteFn> + Send + Sync + 'static,
    ) -> &mut Self {
        self.hooks.response_hook = Some(Box::new(hook));
        self
    }

    /// Splice the produced markup into every HTML response body.
    pub fn insert_into_html_body(
        &mut self,
        producer: impl Fn(&Response) -> String + Send + Sync + 'static,
    ) -> &mut Self {
        self.hooks.html_producer = Some(Box::new(producer));
        self
    }

    /// Mount a management handler on the loopback surface.
    pub fn handle_func(
        &mut self,
        path: &str,
        handler: impl Fn(&mut ResponseWriter<'_>, &Request) -> io::Result<()> + Send + Sync + 'static,
    ) -> &mut Self {
        self.routes.insert(path.to_string(), Box::new(handler));
        self
    }

    /// Bind and serve. Returns once listening; connections are handled on
    /// spawned tasks until [`ProxyHandle::stop`].
    pub async fn start(self, addr: &str) -> Result<ProxyHandle> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::Config(format!("no local address: {e}")))?;
        let local_ips = mgmt::discover_local_ips()?;

        let shared = Arc::new(Shared {
            signer: self.signer,
            hooks: self.hooks,
            routes: self.routes,
            local_ips,
            port: local.port().to_string(),
            active: Mutex::new(Registry::default()),
        });
        let shutdown = Arc::new(Notify::new());

        info!("proxy listening on http://{local}");

        let accept_shared = shared.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!("accept failed: {e}");
                                continue;
                            }
                        };
                        let shared = accept_shared.clone();
                        tokio::spawn(async move {
                            let uid = shared.register(peer);
                            connector::run(shared.clone(), uid, stream, peer).await;
                            shared.deregister(uid);
                        });
                    }
                    _ = accept_shutdown.notified() => {
                        info!("proxy shutting down");
                        break;
                    }
                }
            }
        });

        Ok(ProxyHandle {
            port: local.port(),
            shared,
            shutdown,
        })
    }
}

pub struct ProxyHandle {
    port: u16,
    shared: Arc<Shared>,
    shutdown: Arc<Notify>,
}

impl ProxyHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn active_connections(&self) -> usize {
        self.shared.active_connections()
    }

    /// Stop accepting. Existing connectors run to completion.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}
