use crate::config::{get_namespaced_string, optional};
use crate::error::Error;
use ::config::Config;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing::debug;

/// TLS settings shared by every encrypted connection created from it.
///
/// Build one context, wrap it in an `Arc` and hand it to
/// [`Connection::connect_with`](crate::Connection::connect_with) or
/// [`Listener::listen_with`](crate::Listener::listen_with). Dropping the last
/// reference releases it. There is no process-wide TLS state.
///
/// - The server side needs a certificate chain and private key.
/// - The client side needs either trusted CA certificates or its own key
///   pair, which is then presented to the server and trusted as a root.
#[derive(Debug, Clone)]
pub struct TlsContext {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
    server_name: Option<String>,
}

impl TlsContext {
    /// Builds a context from PEM files.
    ///
    /// `cert_path` and `key_path` form this endpoint's identity. It enables
    /// the server role and is presented as the client certificate when
    /// connecting. `ca_cert_path` lists the roots trusted when connecting;
    /// without it the identity's own chain is the only trusted root, so two
    /// endpoints sharing one key pair can reach each other.
    pub fn new(
        cert_path: Option<&str>,
        key_path: Option<&str>,
        ca_cert_path: Option<&str>,
    ) -> Result<Self, Error> {
        let identity = match (cert_path, key_path) {
            (Some(cert), Some(key)) => Some(Identity {
                chain: load_certs(cert)?,
                key: load_key(key)?,
            }),
            _ => None,
        };

        let server = match &identity {
            Some(identity) => Some(Arc::new(build_server_config(identity)?)),
            None => None,
        };
        let client = match (ca_cert_path, &identity) {
            (None, None) => None,
            (ca, identity) => Some(Arc::new(build_client_config(ca, identity.as_ref())?)),
        };
        Ok(Self {
            server,
            client,
            server_name: None,
        })
    }

    /// Reads `tls_server_cert`, `tls_server_key`, `tls_ca_cert` and
    /// `tls_server_name` from configuration.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Same as [`Self::from_config`] with configuration namespacing.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        // Only a missing key means "not configured"; a malformed one is an error
        let cert = optional(get_namespaced_string(config, name, "tls_server_cert"))?;
        let key = optional(get_namespaced_string(config, name, "tls_server_key"))?;
        let ca = optional(get_namespaced_string(config, name, "tls_ca_cert"))?;

        let mut context = Self::new(cert.as_deref(), key.as_deref(), ca.as_deref())?;

        // Optional override for the TLS server name/SNI used during connect
        context.server_name = optional(get_namespaced_string(config, name, "tls_server_name"))?;
        Ok(context)
    }

    /// Overrides the name verified against the server certificate. Defaults to
    /// the host passed to `connect`.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn can_accept(&self) -> bool {
        self.server.is_some()
    }

    pub fn can_connect(&self) -> bool {
        self.client.is_some()
    }

    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>, Error> {
        self.server.clone().ok_or(Error::TlsServerConfigMissing)
    }

    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>, Error> {
        self.client.clone().ok_or(Error::TlsClientConfigMissing)
    }

    pub(crate) fn server_name_for(&self, host: &str) -> Result<ServerName<'static>, Error> {
        let name = self.server_name.as_deref().unwrap_or(host).to_string();
        debug!(server_name = %name, "Using TLS server name");
        ServerName::try_from(name.clone()).map_err(|_| Error::TlsInvalidServerName(name))
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    let chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;

    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "No certificates found in {path}"
        )));
    }
    Ok(chain)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsKeyLoad {
        path: path.to_string(),
        source: e,
    })?;
    private_key(&mut BufReader::new(file))
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("No private key found in {path}")))
}

// Certificate chain and private key of this endpoint.
struct Identity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

fn build_server_config(identity: &Identity) -> Result<ServerConfig, Error> {
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(identity.chain.clone(), identity.key.clone_key())
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))
}

fn build_client_config(
    ca_cert_path: Option<&str>,
    identity: Option<&Identity>,
) -> Result<ClientConfig, Error> {
    let roots = match (ca_cert_path, identity) {
        (Some(ca), _) => load_certs(ca)?,
        (None, Some(identity)) => identity.chain.clone(),
        (None, None) => Vec::new(),
    };
    let mut root_cert_store = RootCertStore::empty();
    for cert in roots {
        root_cert_store
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(root_cert_store);
    match identity {
        Some(identity) => builder
            .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())
            .map_err(|e| Error::TlsClientConfigBuild(e.to_string())),
        None => Ok(builder.with_no_client_auth()),
    }
}
