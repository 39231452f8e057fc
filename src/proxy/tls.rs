//! TLS certificate handling and interception handshakes
//!
//! The terminator presents a leaf minted by the local CA to the peer; the
//! initiator dials the origin without certificate validation, optionally
//! shaping its ClientHello after a JA3 spec. When the origin's leaf is
//! visible its subject, SANs, and validity are mirrored onto the minted
//! certificate.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509Certificate};

use super::ja3::Ja3Spec;
use crate::error::{ProxyError, ProxyResult};

/// A minted leaf ready for a TLS server handshake
#[derive(Debug)]
pub struct MintedCert {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for MintedCert {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// Certificate Authority minting per-host leaf certificates
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    cert_cache: RwLock<HashMap<String, MintedCert>>,
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Vantage Proxy CA");
    dn.push(DnType::OrganizationName, "Vantage");
    params.distinguished_name = dn;
    params
}

impl CertificateAuthority {
    /// Generate a fresh CA
    pub fn new() -> ProxyResult<Self> {
        let key_pair = KeyPair::generate()?;
        let ca_cert = ca_params().self_signed(&key_pair)?;
        let ca_cert_pem = ca_cert.pem();

        Ok(Self {
            ca_cert,
            ca_key: key_pair,
            ca_cert_pem,
            cert_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Load the CA key pair from PEM files and rebuild the CA certificate
    /// around it
    pub fn from_files(cert_path: &Path, key_path: &Path) -> ProxyResult<Self> {
        let _cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| ProxyError::tls(format!("failed to read CA certificate: {e}")))?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| ProxyError::tls(format!("failed to read CA private key: {e}")))?;

        let key_pair = KeyPair::from_pem(&key_pem)?;
        let ca_cert = ca_params().self_signed(&key_pair)?;
        let ca_cert_pem = ca_cert.pem();

        Ok(Self {
            ca_cert,
            ca_key: key_pair,
            ca_cert_pem,
            cert_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Save CA certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> ProxyResult<()> {
        fs::write(cert_path, self.ca_cert_pem.as_bytes())
            .map_err(|e| ProxyError::tls(format!("failed to write CA certificate: {e}")))?;
        fs::write(key_path, self.ca_key.serialize_pem().as_bytes())
            .map_err(|e| ProxyError::tls(format!("failed to write CA private key: {e}")))?;
        Ok(())
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn cached(&self, key: &str) -> Option<MintedCert> {
        self.cert_cache.read().get(key).cloned()
    }

    fn sign_leaf(&self, key: &str, params: CertificateParams) -> ProxyResult<MintedCert> {
        let key_pair = KeyPair::generate()?;
        let cert = params.signed_by(&key_pair, &self.ca_cert, &self.ca_key)?;

        let minted = MintedCert {
            chain: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        };
        self.cert_cache
            .write()
            .insert(key.to_string(), minted.clone());
        Ok(minted)
    }

    /// Mint a generic leaf for an SNI or host name
    pub fn mint_for_host(&self, host: &str) -> ProxyResult<MintedCert> {
        if let Some(cached) = self.cached(host) {
            return Ok(cached);
        }

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else {
            params.subject_alt_names = vec![SanType::DnsName(
                host.try_into()
                    .map_err(|_| ProxyError::tls(format!("host not usable as SAN: {host:?}")))?,
            )];
        }

        self.sign_leaf(host, params)
    }

    /// Mint a leaf mirroring the origin's: same subject CN, SANs, and
    /// validity window, re-signed by this CA
    pub fn mint_from_origin(&self, origin_leaf: &CertificateDer<'_>) -> ProxyResult<MintedCert> {
        let (_, parsed) = X509Certificate::from_der(origin_leaf.as_ref())
            .map_err(|e| ProxyError::tls(format!("failed to parse origin leaf: {e}")))?;

        let cache_key = format!("serial:{}", parsed.raw_serial_as_string());
        if let Some(cached) = self.cached(&cache_key) {
            return Ok(cached);
        }

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        if let Some(cn) = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
        {
            dn.push(DnType::CommonName, cn);
        }
        if let Some(org) = parsed
            .subject()
            .iter_organization()
            .next()
            .and_then(|attr| attr.as_str().ok())
        {
            dn.push(DnType::OrganizationName, org);
        }
        params.distinguished_name = dn;

        for ext in parsed.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => {
                            if let Ok(dns) = (*dns).try_into() {
                                params.subject_alt_names.push(SanType::DnsName(dns));
                            }
                        }
                        GeneralName::IPAddress(raw) => {
                            let ip = match raw.len() {
                                4 => {
                                    let mut o = [0u8; 4];
                                    o.copy_from_slice(raw);
                                    Some(std::net::IpAddr::from(o))
                                }
                                16 => {
                                    let mut o = [0u8; 16];
                                    o.copy_from_slice(raw);
                                    Some(std::net::IpAddr::from(o))
                                }
                                _ => None,
                            };
                            if let Some(ip) = ip {
                                params.subject_alt_names.push(SanType::IpAddress(ip));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        params.not_before = parsed.validity().not_before.to_datetime();
        params.not_after = parsed.validity().not_after.to_datetime();

        self.sign_leaf(&cache_key, params)
    }

    pub fn clear_cache(&self) {
        self.cert_cache.write().clear();
    }
}

fn alpn_protocols(force_h1: bool) -> Vec<Vec<u8>> {
    if force_h1 {
        vec![b"http/1.1".to_vec()]
    } else {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    }
}

/// Strip the port from an authority string for use as SNI
pub fn server_name(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Terminate TLS towards the peer using a minted certificate
///
/// Returns the negotiated stream and whether the peer chose `h2`.
pub async fn terminate_client<S>(
    stream: S,
    cert: MintedCert,
    force_h1: bool,
) -> ProxyResult<(server::TlsStream<S>, bool)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert.chain, cert.key)?;
    config.alpn_protocols = alpn_protocols(force_h1);

    let acceptor = TlsAcceptor::from(Arc::new(config));
    let tls = acceptor.accept(stream).await?;
    let is_h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
    Ok((tls, is_h2))
}

/// Open TLS towards the origin
///
/// Certificate validation is intentionally disabled: the proxy forwards
/// whatever the origin presents and mirrors its leaf when minting. With a
/// JA3 spec the ClientHello is shaped to match it as far as rustls can
/// express (protocol versions, cipher order, key-exchange groups).
///
/// Returns the stream, whether ALPN chose `h2`, and the origin's leaf.
pub async fn connect_origin<S>(
    stream: S,
    authority: &str,
    force_h1: bool,
    ja3: Option<&Ja3Spec>,
) -> ProxyResult<(client::TlsStream<S>, bool, Option<CertificateDer<'static>>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let builder = match ja3 {
        Some(spec) => ClientConfig::builder_with_provider(Arc::new(spec.crypto_provider()))
            .with_protocol_versions(&spec.protocol_versions())?,
        None => ClientConfig::builder(),
    };
    let mut config = builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    config.alpn_protocols = alpn_protocols(force_h1);

    let host = server_name(authority);
    let name = ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::tls(format!("invalid SNI host: {host:?}")))?;

    let connector = TlsConnector::from(Arc::new(config));
    let tls = connector.connect(name, stream).await?;

    let (_, conn) = tls.get_ref();
    let is_h2 = conn.alpn_protocol() == Some(b"h2".as_slice());
    let leaf = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.clone().into_owned());

    Ok((tls, is_h2, leaf))
}

/// Verifier that accepts any origin certificate
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[test]
    fn test_ca_creation() {
        let ca = CertificateAuthority::new();
        assert!(ca.is_ok());
        assert!(ca.unwrap().ca_cert_pem().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_mint_for_host_cached() {
        let ca = CertificateAuthority::new().unwrap();
        let first = ca.mint_for_host("example.com").unwrap();
        let second = ca.mint_for_host("example.com").unwrap();
        assert_eq!(first.chain[0], second.chain[0]);
    }

    #[test]
    fn test_mint_from_origin_mirrors_subject() {
        let ca = CertificateAuthority::new().unwrap();
        let origin = ca.mint_for_host("mirror.test").unwrap();

        let cloned = ca.mint_from_origin(&origin.chain[0]).unwrap();
        let (_, parsed) = X509Certificate::from_der(cloned.chain[0].as_ref()).unwrap();
        let cn = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .unwrap();
        assert_eq!(cn, "mirror.test");

        let has_san = parsed.extensions().iter().any(|ext| {
            matches!(ext.parsed_extension(), ParsedExtension::SubjectAlternativeName(san)
                if san.general_names.iter().any(|n| matches!(n, GeneralName::DNSName(d) if *d == "mirror.test")))
        });
        assert!(has_san);
    }

    #[tokio::test]
    async fn test_terminate_and_connect_negotiate_h2() {
        install_provider();
        let ca = CertificateAuthority::new().unwrap();
        let cert = ca.mint_for_host("alpn.test").unwrap();

        let (near, far) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move { terminate_client(near, cert, false).await });
        let client = tokio::spawn(async move { connect_origin(far, "alpn.test:443", false, None).await });

        let (_, server_h2) = server.await.unwrap().unwrap();
        let (_, client_h2, leaf) = client.await.unwrap().unwrap();
        assert!(server_h2);
        assert!(client_h2);
        assert!(leaf.is_some());
    }

    #[tokio::test]
    async fn test_forced_h1_alpn() {
        install_provider();
        let ca = CertificateAuthority::new().unwrap();
        let cert = ca.mint_for_host("h1.test").unwrap();

        let (near, far) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move { terminate_client(near, cert, true).await });
        let client = tokio::spawn(async move { connect_origin(far, "h1.test:443", false, None).await });

        let (_, server_h2) = server.await.unwrap().unwrap();
        let (_, client_h2, _) = client.await.unwrap().unwrap();
        assert!(!server_h2);
        assert!(!client_h2);
    }

    #[test]
    fn test_server_name_strips_port() {
        assert_eq!(server_name("example.com:443"), "example.com");
        assert_eq!(server_name("example.com"), "example.com");
        assert_eq!(server_name("[::1]:443"), "[::1]");
    }
}
