use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{pem::PemObject, CertificateDer, ServerName, UnixTime},
    ClientConfig,
    DigitallySignedStruct,
    Error as TlsError,
    RootCertStore,
    SignatureScheme,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{
    error::{ErrorKind, Result},
    options::TlsOptions,
};

/// Configuration required to use TLS. Creating this is expensive, so it is built once per client
/// and shared by every connection.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Create a new `TlsConfig` from the provided options from the user.
    pub(crate) fn new(options: TlsOptions) -> Result<TlsConfig> {
        let config = make_rustls_config(options)?;
        Ok(TlsConfig {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    pub(crate) async fn connect(
        &self,
        host: &str,
        tcp_stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let name = ServerName::try_from(host.to_string()).map_err(|e| {
            ErrorKind::InvalidTlsConfig {
                message: format!("invalid server name {host:?}: {e}"),
            }
        })?;
        Ok(self.connector.connect(name, tcp_stream).await?)
    }
}

fn invalid_config(message: impl std::fmt::Display) -> crate::error::Error {
    ErrorKind::InvalidTlsConfig {
        message: message.to_string(),
    }
    .into()
}

/// Converts `TlsOptions` into a rustls::ClientConfig.
fn make_rustls_config(cfg: TlsOptions) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut store = RootCertStore::empty();
    if let Some(path) = cfg.ca_file_path {
        let certs = CertificateDer::pem_file_iter(&path).map_err(|e| {
            invalid_config(format!(
                "Unable to read root certificates from {}: {e}",
                path.display()
            ))
        })?;
        for cert in certs {
            let cert = cert.map_err(|e| {
                invalid_config(format!(
                    "Unable to parse PEM-encoded root certificate from {}: {e}",
                    path.display()
                ))
            })?;
            store.add(cert).map_err(invalid_config)?;
        }
    } else {
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(invalid_config)?
        .with_root_certificates(store)
        .with_no_client_auth();

    if let Some(true) = cfg.allow_invalid_certificates {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier(provider)));
    }

    Ok(config)
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct NoCertVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
