//! The contract with user code: four optional capabilities invoked from
//! every connector task. All are read-only after start and must be safe to
//! call concurrently.

use std::io;

use crate::h1::{Request, Response};
use crate::proxy::writer::{ResponseWriter, WriteFn};

/// Upstream proxy selection for one request. An empty `address` means
/// "dial the origin directly".
#[derive(Debug, Clone, Default)]
pub struct ProxyHint {
    pub scheme: String,
    pub address: String,
    pub username: String,
    pub password: String,
}

impl ProxyHint {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn is_direct(&self) -> bool {
        self.address.is_empty()
    }
}

pub type ProxySelector = Box<dyn Fn(&Request) -> ProxyHint + Send + Sync>;
pub type RequestHook = Box<dyn Fn(&mut Request) -> Option<WriteFn> + Send + Sync>;
pub type ResponseHook = Box<dyn Fn(&mut Response) -> Option<WriteFn> + Send + Sync>;
pub type HtmlProducer = Box<dyn Fn(&Response) -> String + Send + Sync>;
pub type MgmtHandler =
    Box<dyn Fn(&mut ResponseWriter<'_>, &Request) -> io::Result<()> + Send + Sync>;

/// A null hook is absence; a registered hook is the capability instance.
#[derive(Default)]
pub struct Hooks {
    pub proxy_selector: Option<ProxySelector>,
    pub request_hook: Option<RequestHook>,
    pub response_hook: Option<ResponseHook>,
    pub html_producer: Option<HtmlProducer>,
}
