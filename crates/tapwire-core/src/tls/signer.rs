//! Leaf certificate minting for interposed hosts, signed by the local CA.
//!
//! The CA key may arrive PEM-encoded as PKCS#8, SEC1 EC, or PKCS#1 RSA;
//! the latter two are re-wrapped into PKCS#8 so rcgen can consume them.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::Mutex;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{Error, Result};

/// Entries kept before the least-recently-signed host is evicted.
const CERT_CACHE_CAP: usize = 1024;

const LEAF_SUBJECT: &str = "PYJ";

/// A minted leaf plus its private key, shared as-is between lookups so the
/// same first-host key always yields byte-identical material.
#[derive(Debug)]
pub struct SignedCert {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

pub struct HostSigner {
    ca_cert: Certificate,
    ca_key: KeyPair,
    cache: Mutex<LruCache<String, Arc<SignedCert>>>,
}

impl std::fmt::Debug for HostSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSigner").finish_non_exhaustive()
    }
}

impl HostSigner {
    /// Load the CA certificate and private key from PEM files. Any failure
    /// here is a startup-fatal `Config` error.
    pub fn load(ca_cert_path: &Path, ca_key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(ca_cert_path).map_err(|e| {
            Error::Config(format!(
                "failed to read CA cert {}: {e}",
                ca_cert_path.display()
            ))
        })?;
        let key_pem = fs::read_to_string(ca_key_path).map_err(|e| {
            Error::Config(format!(
                "failed to read CA key {}: {e}",
                ca_key_path.display()
            ))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let ca_key = key_pair_from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| Error::Config(format!("failed to parse CA certificate: {e}")))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| Error::Config(format!("CA key does not match certificate: {e}")))?;
        let cap = NonZeroUsize::new(CERT_CACHE_CAP).expect("nonzero cache capacity");
        Ok(Self {
            ca_cert,
            ca_key,
            cache: Mutex::new(LruCache::new(cap)),
        })
    }

    /// Mint (or fetch from cache, keyed by the first host) a leaf covering
    /// `hosts`, each as an IP or DNS SAN.
    pub fn sign_host(&self, hosts: &[&str]) -> Result<Arc<SignedCert>> {
        let cache_key = *hosts
            .first()
            .ok_or_else(|| Error::Tls("empty host list in signing request".into()))?;
        if let Some(hit) = self.cache.lock().get(cache_key) {
            return Ok(hit.clone());
        }

        let leaf_key =
            KeyPair::generate().map_err(|e| Error::Tls(format!("key generation failed: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, LEAF_SUBJECT);
        dn.push(DnType::OrganizationName, LEAF_SUBJECT);
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from(unix_nanos()));
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(365);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.is_ca = IsCa::ExplicitNoCa;
        for host in hosts {
            match host.parse::<IpAddr>() {
                Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
                Err(_) => params.subject_alt_names.push(SanType::DnsName(
                    (*host)
                        .try_into()
                        .map_err(|e| Error::Tls(format!("bad SAN host {host:?}: {e}")))?,
                )),
            }
        }

        let cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| Error::Tls(format!("leaf signing failed: {e}")))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(leaf_key.serialize_der())
            .map_err(|e| Error::Tls(format!("leaf key conversion failed: {e}")))?;
        let signed = Arc::new(SignedCert {
            cert: cert_der,
            key: key_der,
        });
        self.cache
            .lock()
            .put(cache_key.to_string(), signed.clone());
        Ok(signed)
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

fn key_pair_from_pem(pem: &str) -> Result<KeyPair> {
    let mut cursor = io::Cursor::new(pem.as_bytes());
    let item = rustls_pemfile::read_one(&mut cursor)
        .map_err(|e| Error::Config(format!("failed to parse CA key PEM: {e}")))?;
    let pkcs8 = match item {
        Some(rustls_pemfile::Item::Pkcs8Key(der)) => der.secret_pkcs8_der().to_vec(),
        Some(rustls_pemfile::Item::Sec1Key(der)) => sec1_to_pkcs8(der.secret_sec1_der())?,
        Some(rustls_pemfile::Item::Pkcs1Key(der)) => pkcs1_to_pkcs8(der.secret_pkcs1_der()),
        _ => return Err(Error::Config("no private key found in CA key PEM".into())),
    };
    KeyPair::try_from(pkcs8.as_slice())
        .map_err(|e| Error::Config(format!("unusable CA private key: {e}")))
}

// id-ecPublicKey, prime256v1, and rsaEncryption as complete OID TLVs
const OID_EC_PUBLIC_KEY: &[u8] = &[0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
const OID_SECP256R1: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
const OID_RSA_ENCRYPTION: &[u8] = &[
    0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01,
];
const DER_NULL: &[u8] = &[0x05, 0x00];

fn der_len(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else if len <= 0xff {
        vec![0x81, len as u8]
    } else {
        vec![0x82, (len >> 8) as u8, len as u8]
    }
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&der_len(content.len()));
    out.extend_from_slice(content);
    out
}

/// PrivateKeyInfo ::= SEQUENCE { version 0, algorithm, privateKey OCTET STRING }
fn pkcs8_wrap(algorithm_tlv: &[u8], key_der: &[u8]) -> Vec<u8> {
    let mut content = vec![0x02, 0x01, 0x00];
    content.extend_from_slice(algorithm_tlv);
    content.extend_from_slice(&der_tlv(0x04, key_der));
    der_tlv(0x30, &content)
}

struct DerReader<'a> {
    buf: &'a [u8],
}

impl<'a> DerReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn read_tlv(&mut self) -> Option<(u8, &'a [u8])> {
        if self.buf.len() < 2 {
            return None;
        }
        let tag = self.buf[0];
        let (len, header): (usize, usize) = match self.buf[1] {
            n if n < 0x80 => (n as usize, 2),
            0x81 => (*self.buf.get(2)? as usize, 3),
            0x82 => {
                let hi = *self.buf.get(2)? as usize;
                let lo = *self.buf.get(3)? as usize;
                ((hi << 8) | lo, 4)
            }
            _ => return None,
        };
        let end = header.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        let content = &self.buf[header..end];
        self.buf = &self.buf[end..];
        Some((tag, content))
    }
}

/// Re-wrap a SEC1 `ECPrivateKey` as PKCS#8: the named curve moves into the
/// algorithm identifier and the inner `[0]` parameters are dropped, the
/// layout the ring/aws-lc PKCS#8 parsers accept.
fn sec1_to_pkcs8(sec1: &[u8]) -> Result<Vec<u8>> {
    let bad = || Error::Config("malformed SEC1 EC private key".into());
    let mut outer = DerReader::new(sec1);
    let (tag, seq) = outer.read_tlv().ok_or_else(bad)?;
    if tag != 0x30 {
        return Err(bad());
    }
    let mut fields = DerReader::new(seq);
    let (vtag, _version) = fields.read_tlv().ok_or_else(bad)?;
    let (ktag, private) = fields.read_tlv().ok_or_else(bad)?;
    if vtag != 0x02 || ktag != 0x04 {
        return Err(bad());
    }
    let mut curve: Option<Vec<u8>> = None;
    let mut public: Option<Vec<u8>> = None;
    while let Some((tag, content)) = fields.read_tlv() {
        match tag {
            0xa0 => curve = Some(content.to_vec()),
            0xa1 => public = Some(content.to_vec()),
            _ => {}
        }
    }
    let curve = curve.unwrap_or_else(|| OID_SECP256R1.to_vec());

    let mut inner = vec![0x02, 0x01, 0x01];
    inner.extend_from_slice(&der_tlv(0x04, private));
    if let Some(public) = public {
        inner.extend_from_slice(&der_tlv(0xa1, &public));
    }
    let ec_private_key = der_tlv(0x30, &inner);

    let mut alg = OID_EC_PUBLIC_KEY.to_vec();
    alg.extend_from_slice(&curve);
    Ok(pkcs8_wrap(&der_tlv(0x30, &alg), &ec_private_key))
}

/// Re-wrap a PKCS#1 `RSAPrivateKey` as PKCS#8.
fn pkcs1_to_pkcs8(pkcs1: &[u8]) -> Vec<u8> {
    let mut alg = OID_RSA_ENCRYPTION.to_vec();
    alg.extend_from_slice(DER_NULL);
    pkcs8_wrap(&der_tlv(0x30, &alg), pkcs1)
}

/// Self-signed CA material for tests.
#[cfg(test)]
pub(crate) fn test_ca_pem() -> (String, String) {
    let ca_key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Tapwire Test CA");
    dn.push(DnType::OrganizationName, "Tapwire");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let ca_cert = params.self_signed(&ca_key).unwrap();
    (ca_cert.pem(), ca_key.serialize_pem())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_ca_from_files() {
        let (cert_pem, key_pem) = test_ca_pem();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert_pem).unwrap();
        std::fs::write(&key_path, key_pem).unwrap();
        assert!(HostSigner::load(&cert_path, &key_path).is_ok());
    }

    #[test]
    fn missing_ca_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = HostSigner::load(&dir.path().join("nope.pem"), &dir.path().join("nokey.pem"))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn cache_returns_identical_material() {
        let (cert_pem, key_pem) = test_ca_pem();
        let signer = HostSigner::from_pem(&cert_pem, &key_pem).unwrap();
        let first = signer.sign_host(&["example.com"]).unwrap();
        let second = signer.sign_host(&["example.com"]).unwrap();
        assert_eq!(first.cert.as_ref(), second.cert.as_ref());
        let other = signer.sign_host(&["other.example"]).unwrap();
        assert_ne!(first.cert.as_ref(), other.cert.as_ref());
    }

    #[test]
    fn hosts_become_dns_and_ip_sans() {
        use x509_parser::prelude::*;

        let (cert_pem, key_pem) = test_ca_pem();
        let signer = HostSigner::from_pem(&cert_pem, &key_pem).unwrap();
        let signed = signer.sign_host(&["origin.test", "10.1.2.3"]).unwrap();
        let (_, cert) = X509Certificate::from_der(signed.cert.as_ref()).unwrap();
        let san = cert
            .subject_alternative_name()
            .unwrap()
            .expect("leaf carries a SAN extension");
        let mut has_dns = false;
        let mut has_ip = false;
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(d) => has_dns |= *d == "origin.test",
                GeneralName::IPAddress(b) => has_ip |= *b == [10, 1, 2, 3],
                _ => {}
            }
        }
        assert!(has_dns);
        assert!(has_ip);
        assert_eq!(
            cert.subject().iter_common_name().count(),
            1,
            "single CN expected"
        );
    }

    #[test]
    fn pkcs8_ca_key_round_trips() {
        let key = KeyPair::generate().unwrap();
        let pem = key.serialize_pem();
        assert!(key_pair_from_pem(&pem).is_ok());
    }

    #[test]
    fn der_length_encodings() {
        assert_eq!(der_len(0x7f), vec![0x7f]);
        assert_eq!(der_len(0x80), vec![0x81, 0x80]);
        assert_eq!(der_len(0x1234), vec![0x82, 0x12, 0x34]);
    }

    #[test]
    fn sec1_wrap_produces_pkcs8_layout() {
        // hand-built SEC1: version 1, 32-byte key, [0] prime256v1
        let mut inner = vec![0x02, 0x01, 0x01];
        inner.extend_from_slice(&der_tlv(0x04, &[0x11u8; 32]));
        inner.extend_from_slice(&der_tlv(0xa0, OID_SECP256R1));
        let sec1 = der_tlv(0x30, &inner);

        let pkcs8 = sec1_to_pkcs8(&sec1).unwrap();
        let mut outer = DerReader::new(&pkcs8);
        let (tag, content) = outer.read_tlv().unwrap();
        assert_eq!(tag, 0x30);
        let mut fields = DerReader::new(content);
        assert_eq!(fields.read_tlv().unwrap(), (0x02, &[0x00u8][..]));
        let (alg_tag, alg) = fields.read_tlv().unwrap();
        assert_eq!(alg_tag, 0x30);
        assert!(alg.starts_with(OID_EC_PUBLIC_KEY));
        assert!(alg.ends_with(OID_SECP256R1));
        let (key_tag, wrapped) = fields.read_tlv().unwrap();
        assert_eq!(key_tag, 0x04);
        // inner ECPrivateKey kept the key but dropped the [0] parameters
        assert!(wrapped.windows(32).any(|w| w == [0x11u8; 32]));
        assert!(!wrapped.windows(OID_SECP256R1.len()).any(|w| w == OID_SECP256R1));
    }

    #[test]
    fn pkcs1_wrap_produces_pkcs8_layout() {
        let fake_rsa = der_tlv(0x30, &[0x02, 0x01, 0x00]);
        let pkcs8 = pkcs1_to_pkcs8(&fake_rsa);
        let mut outer = DerReader::new(&pkcs8);
        let (tag, content) = outer.read_tlv().unwrap();
        assert_eq!(tag, 0x30);
        let mut fields = DerReader::new(content);
        fields.read_tlv().unwrap();
        let (_, alg) = fields.read_tlv().unwrap();
        assert!(alg.starts_with(OID_RSA_ENCRYPTION));
        assert!(alg.ends_with(DER_NULL));
    }
}
