//! rustls configuration for both legs of an intercepted tunnel.
//!
//! The origin leg deliberately skips certificate validation: the proxy is an
//! inspection tool and impersonates the client without establishing trust in
//! the origin. Nothing outside interception and replay should use
//! [`insecure_client_config`].

use std::sync::Arc;

use anyhow::Context as _;
use rustls::{
    ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, WebPkiSupportedAlgorithms},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::ca::IssuedCert;

const ALPN_HTTP1: &[u8] = b"http/1.1";

pub fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Server-side config presenting the issued leaf to the client. Only
/// HTTP/1.1 is offered.
pub fn leaf_server_config(issued: &IssuedCert) -> anyhow::Result<ServerConfig> {
    let cert_chain = vec![
        CertificateDer::from_pem_file(&issued.cert_path).with_context(|| {
            format!("load leaf certificate {}", issued.cert_path.display())
        })?,
    ];
    let private_key = PrivateKeyDer::from_pem_file(&issued.key_path)
        .with_context(|| format!("load leaf private key {}", issued.key_path.display()))?;

    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .context("select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .with_context(|| format!("build TLS server config for `{}`", issued.hostname))?;
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(config)
}

pub fn leaf_acceptor(issued: &IssuedCert) -> anyhow::Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(Arc::new(leaf_server_config(issued)?)))
}

/// Client config that accepts any origin certificate. No ALPN protocols are
/// set; hyper-rustls refuses a config that already carries them.
pub fn insecure_client_config() -> anyhow::Result<ClientConfig> {
    let provider = crypto_provider();
    let verifier = AcceptAnyServerCert {
        algorithms: provider.signature_verification_algorithms,
    };
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("select TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

/// Origin leg of an intercepted tunnel, offering HTTP/1.1 only.
pub fn origin_client_config() -> anyhow::Result<ClientConfig> {
    let mut config = insecure_client_config()?;
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(config)
}

pub fn origin_connector() -> anyhow::Result<TlsConnector> {
    Ok(TlsConnector::from(Arc::new(origin_client_config()?)))
}

pub fn server_name(host: &str) -> anyhow::Result<ServerName<'static>> {
    let host = host
        .strip_prefix('[')
        .and_then(|host| host.strip_suffix(']'))
        .unwrap_or(host);
    ServerName::try_from(host.to_owned())
        .map_err(|err| anyhow::anyhow!("invalid TLS server name `{host}`: {err}"))
}

/// Skips chain and hostname checks but still verifies handshake signatures,
/// so the session is at least bound to the key the origin presented.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
