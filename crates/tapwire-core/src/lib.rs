//! Intercepting HTTP(S) proxy engine.
//!
//! Point a user agent at [`Proxy`]'s listen address: plain requests arrive
//! in absolute form and are forwarded; `CONNECT` requests are answered with
//! a dynamically minted leaf certificate so the TLS session can be
//! terminated, observed, and re-established toward the origin. Four
//! optional hooks (proxy selection, request, response, HTML injection) see
//! every exchange.

pub mod error;
pub mod h1;
pub mod proxy;
pub mod tls;

pub use error::{Error, Result};
pub use h1::{Request, Response};
pub use proxy::hooks::ProxyHint;
pub use proxy::server::{Proxy, ProxyHandle};
pub use proxy::writer::{ResponseWriter, WriteFn};
pub use tls::signer::HostSigner;
