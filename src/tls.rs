//! TLS material for the `--tls` listener.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, KeyUsagePurpose};
use std::path::{Path, PathBuf};

use crate::config;

/// Ensure a self-signed certificate exists under `$HOME/.agentide/tls/`,
/// generating one on first use. Returns `(cert_path, key_path)`.
///
/// # Errors
///
/// Returns an error if generation or writing fails.
pub fn ensure_self_signed() -> anyhow::Result<(PathBuf, PathBuf)> {
    let tls_dir = config::tls_dir();
    let cert_path = tls_dir.join("cert.pem");
    let key_path = tls_dir.join("key.pem");

    if cert_path.exists() && key_path.exists() {
        return Ok((cert_path, key_path));
    }

    std::fs::create_dir_all(&tls_dir)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "c3 hub");
    params.distinguished_name = dn;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.subject_alt_names = vec![
        rcgen::SanType::DnsName(
            "localhost"
                .to_owned()
                .try_into()
                .map_err(|e| anyhow::anyhow!("Invalid DNS name 'localhost': {e}"))?,
        ),
        rcgen::SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
    ];

    // Valid for 1 year
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(365);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(cert = %cert_path.display(), "Generated self-signed TLS certificate");
    Ok((cert_path, key_path))
}

/// Load an axum-server rustls config from PEM files.
///
/// # Errors
///
/// Returns an error if the files are missing or malformed.
pub async fn rustls_config(
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<axum_server::tls_rustls::RustlsConfig> {
    Ok(axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?)
}
