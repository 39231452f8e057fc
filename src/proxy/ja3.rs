//! TLS and HTTP/2 fingerprint specs
//!
//! A JA3 string names the five ClientHello components
//! (`version,ciphers,extensions,curves,point-formats`); the spec drives
//! the origin-facing TLS configuration so the proxy's hello resembles the
//! configured client stack. The HTTP/2 spec is the Akamai-style string
//! (`SETTINGS|WINDOW_UPDATE|PRIORITY|pseudo-header-order`) applied to the
//! initial frames of the origin-facing HTTP/2 connection.

use rustls::crypto::{ring, CryptoProvider};
use rustls::SupportedProtocolVersion;

use crate::error::{ProxyError, ProxyResult};

/// TLS extension id for supported_versions; its presence means the hello
/// offers TLS 1.3
const EXT_SUPPORTED_VERSIONS: u16 = 43;

/// Parsed JA3 ClientHello spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ja3Spec {
    pub version: u16,
    pub ciphers: Vec<u16>,
    pub extensions: Vec<u16>,
    pub curves: Vec<u16>,
    pub point_formats: Vec<u8>,
}

fn parse_list<T: std::str::FromStr>(raw: &str, what: &str) -> ProxyResult<Vec<T>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split('-')
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| ProxyError::parse(format!("bad {what} in ja3 spec: {v:?}")))
        })
        .collect()
}

impl Ja3Spec {
    pub fn parse(raw: &str) -> ProxyResult<Self> {
        let fields: Vec<&str> = raw.trim().split(',').collect();
        if fields.len() != 5 {
            return Err(ProxyError::parse(format!(
                "ja3 spec needs 5 comma-separated fields, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            version: fields[0]
                .parse()
                .map_err(|_| ProxyError::parse(format!("bad ja3 version: {:?}", fields[0])))?,
            ciphers: parse_list(fields[1], "cipher")?,
            extensions: parse_list(fields[2], "extension")?,
            curves: parse_list(fields[3], "curve")?,
            point_formats: parse_list(fields[4], "point format")?,
        })
    }

    /// Crypto provider with cipher suites and key-exchange groups filtered
    /// and ordered per the spec. Ids rustls does not implement are
    /// silently dropped; an empty intersection falls back to the default
    /// set so the handshake still succeeds.
    pub fn crypto_provider(&self) -> CryptoProvider {
        let base = ring::default_provider();

        let mut cipher_suites: Vec<_> = self
            .ciphers
            .iter()
            .filter_map(|id| {
                base.cipher_suites
                    .iter()
                    .find(|s| u16::from(s.suite()) == *id)
                    .copied()
            })
            .collect();
        if cipher_suites.is_empty() {
            cipher_suites = base.cipher_suites.clone();
        }

        let mut kx_groups: Vec<_> = self
            .curves
            .iter()
            .filter_map(|id| {
                base.kx_groups
                    .iter()
                    .find(|g| u16::from(g.name()) == *id)
                    .copied()
            })
            .collect();
        if kx_groups.is_empty() {
            kx_groups = base.kx_groups.clone();
        }

        CryptoProvider {
            cipher_suites,
            kx_groups,
            ..base
        }
    }

    pub fn protocol_versions(&self) -> Vec<&'static SupportedProtocolVersion> {
        if self.extensions.contains(&EXT_SUPPORTED_VERSIONS) || self.version >= 772 {
            vec![&rustls::version::TLS13, &rustls::version::TLS12]
        } else {
            vec![&rustls::version::TLS12]
        }
    }
}

/// Parsed HTTP/2 fingerprint
///
/// Only the SETTINGS block and the connection WINDOW_UPDATE are
/// expressible through the h2 client; the PRIORITY and pseudo-header
/// segments of the string are accepted and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct H2Ja3Spec {
    /// `(identifier, value)` pairs in emission order
    pub settings: Vec<(u16, u32)>,

    /// Increment applied to the connection flow-control window
    pub connection_window: Option<u32>,
}

impl H2Ja3Spec {
    pub fn parse(raw: &str) -> ProxyResult<Self> {
        let mut segments = raw.trim().split('|');
        let settings_raw = segments
            .next()
            .ok_or_else(|| ProxyError::parse("empty h2 spec"))?;

        let mut settings = Vec::new();
        for pair in settings_raw.split(';').filter(|p| !p.is_empty()) {
            let (id, value) = pair
                .split_once(':')
                .ok_or_else(|| ProxyError::parse(format!("bad h2 setting: {pair:?}")))?;
            let id = id
                .parse()
                .map_err(|_| ProxyError::parse(format!("bad h2 setting id: {id:?}")))?;
            let value = value
                .parse()
                .map_err(|_| ProxyError::parse(format!("bad h2 setting value: {value:?}")))?;
            settings.push((id, value));
        }

        let connection_window = match segments.next() {
            Some("0") | Some("") | None => None,
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| ProxyError::parse(format!("bad h2 window update: {raw:?}")))?,
            ),
        };

        Ok(Self {
            settings,
            connection_window,
        })
    }

    /// Apply the fingerprint to an HTTP/2 client builder
    pub fn apply(&self, builder: &mut h2::client::Builder) {
        for (id, value) in &self.settings {
            match id {
                1 => {
                    builder.header_table_size(*value);
                }
                3 => {
                    builder.max_concurrent_streams(*value);
                }
                4 => {
                    builder.initial_window_size(*value);
                }
                5 => {
                    builder.max_frame_size(*value);
                }
                6 => {
                    builder.max_header_list_size(*value);
                }
                // 2 (ENABLE_PUSH) is fixed by h2, the rest are unknown ids
                _ => {}
            }
        }
        if let Some(window) = self.connection_window {
            builder.initial_connection_window_size(window);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_H2_JA3, DEFAULT_JA3};

    #[test]
    fn test_parse_default_ja3() {
        let spec = Ja3Spec::parse(DEFAULT_JA3).unwrap();
        assert_eq!(spec.version, 771);
        assert_eq!(spec.ciphers[0], 4865); // TLS13_AES_128_GCM_SHA256
        assert_eq!(spec.curves, vec![29, 23, 24]);
        assert_eq!(spec.point_formats, vec![0]);
        // supported_versions present, so TLS 1.3 is offered
        assert_eq!(spec.protocol_versions().len(), 2);
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        assert!(Ja3Spec::parse("771,4865,0-23").is_err());
        assert!(Ja3Spec::parse("771,4865,x,29,0").is_err());
    }

    #[test]
    fn test_tls12_only_spec() {
        let spec = Ja3Spec::parse("771,49195-49199,0-23-65281,29-23,0").unwrap();
        assert_eq!(spec.protocol_versions().len(), 1);
    }

    #[test]
    fn test_provider_orders_ciphers() {
        let spec = Ja3Spec::parse(DEFAULT_JA3).unwrap();
        let provider = spec.crypto_provider();
        assert!(!provider.cipher_suites.is_empty());
        // first spec id implemented by ring leads the ordering
        assert_eq!(u16::from(provider.cipher_suites[0].suite()), 4865);
    }

    #[test]
    fn test_unknown_ids_fall_back() {
        let spec = Ja3Spec::parse("771,1-2-3,0,9999,0").unwrap();
        let provider = spec.crypto_provider();
        assert!(!provider.cipher_suites.is_empty());
        assert!(!provider.kx_groups.is_empty());
    }

    #[test]
    fn test_parse_default_h2() {
        let spec = H2Ja3Spec::parse(DEFAULT_H2_JA3).unwrap();
        assert_eq!(spec.settings.len(), 5);
        assert_eq!(spec.settings[0], (1, 65536));
        assert_eq!(spec.connection_window, Some(15663105));
    }

    #[test]
    fn test_parse_h2_settings_only() {
        let spec = H2Ja3Spec::parse("4:131072;5:16384").unwrap();
        assert_eq!(spec.settings, vec![(4, 131072), (5, 16384)]);
        assert_eq!(spec.connection_window, None);
    }
}
