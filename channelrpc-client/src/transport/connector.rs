//! TLS configuration.
//!
//! # Feature Flags
//!
//! TLS needs both a crypto provider and root certificates:
//!
//! - **Crypto providers** (choose one):
//!   - `tls-ring` - ring crypto (default with `tls`)
//!   - `tls-aws-lc` - AWS LC crypto
//!
//! - **Root certificates** (choose one):
//!   - `tls-native-roots` - system root certificates (default with `tls`)
//!   - `tls-webpki-roots` - bundled Mozilla root certificates
//!
//! Without a provider feature, a process-wide default installed through
//! `CryptoProvider::install_default()` is used.

use std::sync::{Arc, OnceLock};

use channelrpc_core::ChannelError;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};

use crate::config::TlsSettings;

/// Whether a crypto provider and root certificates are compiled in.
#[inline]
pub const fn has_tls_support() -> bool {
    cfg!(any(feature = "tls-ring", feature = "tls-aws-lc"))
        && cfg!(any(feature = "tls-native-roots", feature = "tls-webpki-roots"))
}

#[cfg(feature = "tls-ring")]
fn crypto_provider() -> Result<Arc<CryptoProvider>, ChannelError> {
    Ok(Arc::new(rustls::crypto::ring::default_provider()))
}

#[cfg(all(feature = "tls-aws-lc", not(feature = "tls-ring")))]
fn crypto_provider() -> Result<Arc<CryptoProvider>, ChannelError> {
    Ok(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

#[cfg(not(any(feature = "tls-ring", feature = "tls-aws-lc")))]
fn crypto_provider() -> Result<Arc<CryptoProvider>, ChannelError> {
    CryptoProvider::get_default().cloned().ok_or_else(|| {
        ChannelError::configuration(
            "TLS requires a crypto provider: enable `tls-ring` or `tls-aws-lc`, \
             or install one with `CryptoProvider::install_default()`",
        )
    })
}

/// Platform trust anchors, loaded once per process.
fn platform_roots() -> &'static RootCertStore {
    static ROOTS: OnceLock<RootCertStore> = OnceLock::new();
    ROOTS.get_or_init(|| {
        #[allow(unused_mut)]
        let mut roots = RootCertStore::empty();

        #[cfg(feature = "tls-native-roots")]
        {
            let native = rustls_native_certs::load_native_certs();
            if !native.errors.is_empty() {
                tracing::warn!(errors = ?native.errors, "errors loading native root certificates");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            tracing::debug!(added, ignored, "loaded native root certificates");
        }

        #[cfg(all(feature = "tls-webpki-roots", not(feature = "tls-native-roots")))]
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        roots
    })
}

fn tls_error(context: &str, err: impl std::fmt::Display) -> ChannelError {
    ChannelError::configuration(format!("{context}: {err}"))
}

/// Build the rustls client configuration for a connection.
///
/// Applies extra trust anchors, the client certificate and, when set, the
/// peer thumbprint pin.
pub fn build_tls_config(settings: &TlsSettings) -> Result<ClientConfig, ChannelError> {
    let provider = crypto_provider()?;
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("invalid TLS protocol versions", e))?;

    let mut roots = platform_roots().clone();
    for cert in &settings.extra_roots {
        roots
            .add(cert.clone())
            .map_err(|e| tls_error("invalid extra root certificate", e))?;
    }

    let builder = if settings.peer_thumbprint.is_some() || settings.accept_invalid_certs {
        let chain = if settings.accept_invalid_certs {
            None
        } else {
            Some(
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                    .build()
                    .map_err(|e| tls_error("cannot build certificate verifier", e))?,
            )
        };
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PeerVerifier {
                chain,
                pin: settings.peer_thumbprint,
                provider,
            }))
    } else {
        builder.with_root_certificates(roots)
    };

    // ALPN stays empty; the connector builder fills it per enabled version.
    match &settings.client_certificate {
        Some(identity) => builder
            .with_client_auth_cert(identity.cert_chain.clone(), identity.key.clone_key())
            .map_err(|e| tls_error("invalid client certificate", e)),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// SHA-256 of a DER certificate, as used for peer pinning.
pub fn thumbprint(cert: &CertificateDer<'_>) -> [u8; 32] {
    Sha256::digest(cert.as_ref()).into()
}

/// Server verifier enforcing a certificate pin.
///
/// With `chain` set, the normal WebPKI chain validation runs first. Without
/// it every chain is accepted, which is only reachable through
/// `accept_invalid_certs`.
#[derive(Debug)]
struct PeerVerifier {
    chain: Option<Arc<WebPkiServerVerifier>>,
    pin: Option<[u8; 32]>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(chain) = &self.chain {
            chain.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        }
        if let Some(pin) = &self.pin {
            if thumbprint(end_entity) != *pin {
                tracing::warn!(
                    server = ?server_name,
                    "server certificate does not match the pinned thumbprint"
                );
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
