//! TLS client configuration for `ldaps://` and StartTLS connections.

use anyhow::{Context, Result};
use rustls::ClientConfig;
use rustls_pemfile::certs;
use rustls_pki_types::CertificateDer;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Build a rustls ClientConfig trusting the system roots plus the CA certificates
/// in `ca_file`, if one is configured.
pub fn client_config(ca_file: Option<&Path>) -> Result<Arc<ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().context("Load system CA certs")? {
        let _ = root_store.add(cert);
    }
    if let Some(path) = ca_file {
        let extra = load_certs_from_file(path)?;
        let (added, ignored) = root_store.add_parsable_certificates(extra);
        debug!("Loaded {} CA certificates from {} ({} ignored)", added, path.display(), ignored);
        if added == 0 {
            anyhow::bail!("No usable CA certificates in {}", path.display());
        }
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("Select TLS protocol versions")?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

pub fn load_certs_from_file(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open CA file: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

/// Check that the CA file exists and holds at least one PEM certificate.
pub fn validate_ca_file(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("TLS CA file not found: {}", path.display());
    }
    load_certs_from_file(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_ca_file() {
        let err = validate_ca_file(Path::new("/nonexistent/ca.pem")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let err = load_certs_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("No certificates found"));
        assert!(validate_ca_file(file.path()).is_err());
    }

    #[test]
    fn test_client_config_rejects_bad_ca_file() {
        let file = NamedTempFile::new().unwrap();
        assert!(client_config(Some(file.path())).is_err());
    }
}
