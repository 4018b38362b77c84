//! On-the-fly certificate authority
//!
//! Loads the local CA material at startup and mints per-hostname leaf
//! certificates on demand, mirroring the upstream server's SAN set so the
//! forged certificate is plausible to the client. Minted leaves are
//! persisted under `<work_dir>/ssl/<serial>.crt|.key` and reused while
//! both files still exist.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::errors::{ProxyError, Result};

/// Leaf certificates mimic the original's ten-year validity.
const LEAF_VALIDITY_DAYS: i64 = 3650;

pub struct CertificateAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    leaf_dir: PathBuf,
    /// hostname -> serial stem of the minted leaf on disk
    minted: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("leaf_dir", &self.leaf_dir)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Loads the CA certificate and key from `work_dir`. Any missing or
    /// malformed file is `CryptoLoad`, which is fatal to the listener.
    pub fn open(work_dir: &Path, ca_cert_file: &str, ca_key_file: &str) -> Result<Self> {
        let cert_path = work_dir.join(ca_cert_file);
        let key_path = work_dir.join(ca_key_file);

        let cert_pem = fs::read_to_string(&cert_path).map_err(|e| {
            ProxyError::CryptoLoad(format!("failed to read {}: {e}", cert_path.display()))
        })?;
        let key_pem = fs::read_to_string(&key_path).map_err(|e| {
            ProxyError::CryptoLoad(format!("failed to read {}: {e}", key_path.display()))
        })?;

        let ca_key = KeyPair::from_pem(&key_pem)
            .map_err(|e| ProxyError::CryptoLoad(format!("failed to parse CA key: {e}")))?;
        // Rebuild a signing certificate from the PEM so the minted leaves
        // carry the real CA subject as their issuer.
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| ProxyError::CryptoLoad(format!("failed to parse CA cert: {e}")))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| ProxyError::CryptoLoad(format!("failed to rebuild CA cert: {e}")))?;

        Ok(Self {
            ca_cert,
            ca_key,
            leaf_dir: work_dir.join("ssl"),
            minted: Mutex::new(HashMap::new()),
        })
    }

    /// Returns a TLS server context presenting a leaf for `hostname`,
    /// minting and persisting one on first use. `upstream_cert` is the DER
    /// certificate captured from the origin; its DNS SANs are mirrored.
    pub fn server_config_for(
        &self,
        hostname: &str,
        upstream_cert: &CertificateDer<'_>,
    ) -> Result<Arc<ServerConfig>> {
        let stem = self.leaf_for(hostname, upstream_cert)?;
        let cert_pem = fs::read_to_string(self.crt_path(&stem))
            .map_err(|e| ProxyError::Context(format!("failed to read minted cert: {e}")))?;
        let key_pem = fs::read_to_string(self.key_path(&stem))
            .map_err(|e| ProxyError::Context(format!("failed to read minted key: {e}")))?;

        let mut chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_bytes())
                .collect::<std::io::Result<_>>()
                .map_err(|e| ProxyError::Context(format!("bad minted cert pem: {e}")))?;
        chain.push(self.ca_cert.der().clone());
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| ProxyError::Context(format!("bad minted key pem: {e}")))?
            .ok_or_else(|| ProxyError::Context("minted key pem holds no key".to_string()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| ProxyError::Context(format!("failed to assemble server context: {e}")))?;
        Ok(Arc::new(config))
    }

    /// Resolves the on-disk serial stem for `hostname`, minting a fresh
    /// leaf when there is no cached one or its files have gone away.
    fn leaf_for(&self, hostname: &str, upstream_cert: &CertificateDer<'_>) -> Result<String> {
        let mut minted = self
            .minted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(stem) = minted.get(hostname) {
            if self.crt_path(stem).exists() && self.key_path(stem).exists() {
                debug!("reusing minted certificate {stem} for {hostname}");
                return Ok(stem.clone());
            }
        }

        let stem = self.mint(hostname, upstream_cert)?;
        minted.insert(hostname.to_string(), stem.clone());
        Ok(stem)
    }

    fn mint(&self, hostname: &str, upstream_cert: &CertificateDer<'_>) -> Result<String> {
        // Fresh 2048-bit RSA key per leaf; rcgen only generates EC keys
        // itself, so the key comes from the rsa crate and is imported.
        let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
            .map_err(|e| ProxyError::Context(format!("rsa key generation failed: {e}")))?;
        let key_pem = rsa_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ProxyError::Context(format!("rsa key encoding failed: {e}")))?;
        let key_pair = KeyPair::from_pem_and_sign_algo(&key_pem, &rcgen::PKCS_RSA_SHA256)
            .map_err(|e| ProxyError::Context(format!("rsa key import failed: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = params.not_before + Duration::days(LEAF_VALIDITY_DAYS);

        let serial: u64 = rand::random();
        params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));

        let mut names = upstream_dns_sans(upstream_cert.as_ref());
        if !names.iter().any(|n| n == hostname) {
            names.push(hostname.to_string());
        }
        for name in names {
            let san = name
                .try_into()
                .map_err(|e| ProxyError::Context(format!("bad SAN entry: {e}")))?;
            params.subject_alt_names.push(SanType::DnsName(san));
        }

        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| ProxyError::Context(format!("leaf signing failed: {e}")))?;

        let stem = serial.to_string();
        fs::create_dir_all(&self.leaf_dir)
            .map_err(|e| ProxyError::Context(format!("failed to create leaf dir: {e}")))?;
        fs::write(self.crt_path(&stem), cert.pem())
            .map_err(|e| ProxyError::Context(format!("failed to persist leaf cert: {e}")))?;
        fs::write(self.key_path(&stem), key_pem.as_bytes())
            .map_err(|e| ProxyError::Context(format!("failed to persist leaf key: {e}")))?;

        info!("minted certificate {stem} for {hostname}");
        Ok(stem)
    }

    fn crt_path(&self, stem: &str) -> PathBuf {
        self.leaf_dir.join(format!("{stem}.crt"))
    }

    fn key_path(&self, stem: &str) -> PathBuf {
        self.leaf_dir.join(format!("{stem}.key"))
    }
}

/// DNS names from the upstream certificate's SAN extension, deduplicated.
/// An unparseable certificate simply contributes no extra names.
fn upstream_dns_sans(der: &[u8]) -> Vec<String> {
    let Ok((_, cert)) = X509Certificate::from_der(der) else {
        return Vec::new();
    };
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return Vec::new();
    };
    let mut names = Vec::new();
    for general_name in &san.value.general_names {
        if let GeneralName::DNSName(name) = general_name {
            if !names.iter().any(|n| n == name) {
                names.push((*name).to_string());
            }
        }
    }
    names
}

/// Bootstraps a fresh root CA in `output_dir`, writing the PEM pair the
/// proxy loads at startup. Clients must be configured to trust the
/// certificate file for interception to work.
pub fn generate_ca(output_dir: &Path, ca_cert_file: &str, ca_key_file: &str) -> Result<()> {
    fs::create_dir_all(output_dir)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Sift Proxy CA");
    dn.push(DnType::OrganizationName, "Sift Proxy");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::days(3650);

    let key_pair = KeyPair::generate()
        .map_err(|e| ProxyError::Context(format!("ca key generation failed: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ProxyError::Context(format!("ca self-signing failed: {e}")))?;

    let cert_path = output_dir.join(ca_cert_file);
    fs::write(&cert_path, cert.pem())?;
    info!("CA certificate written to {}", cert_path.display());

    let key_path = output_dir.join(ca_key_file);
    fs::write(&key_path, key_pair.serialize_pem())?;
    info!("CA private key written to {}", key_path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_ca(dir: &TempDir) -> CertificateAuthority {
        generate_ca(dir.path(), "RootCA.crt", "RootCA.key").unwrap();
        CertificateAuthority::open(dir.path(), "RootCA.crt", "RootCA.key").unwrap()
    }

    /// A stand-in for the certificate captured from an origin server.
    fn upstream_cert(sans: &[&str]) -> CertificateDer<'static> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, sans[0]);
        params.distinguished_name = dn;
        for name in sans {
            params
                .subject_alt_names
                .push(SanType::DnsName((*name).to_string().try_into().unwrap()));
        }
        params.self_signed(&key).unwrap().der().clone()
    }

    fn minted_files(dir: &TempDir) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir.path().join("ssl"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_open_fails_without_material() {
        let dir = TempDir::new().unwrap();
        let err = CertificateAuthority::open(dir.path(), "RootCA.crt", "RootCA.key").unwrap_err();
        assert!(matches!(err, ProxyError::CryptoLoad(_)));
    }

    #[test]
    fn test_minted_leaf_mirrors_upstream_sans() {
        let dir = TempDir::new().unwrap();
        let ca = test_ca(&dir);
        let upstream = upstream_cert(&["example.com", "www.example.com"]);

        ca.server_config_for("mitm.example.com", &upstream).unwrap();

        let files = minted_files(&dir);
        assert_eq!(files.len(), 2);
        let crt = files.iter().find(|p| p.extension().unwrap() == "crt").unwrap();

        let pem = fs::read_to_string(crt).unwrap();
        let der = rustls_pemfile::certs(&mut pem.as_bytes())
            .next()
            .unwrap()
            .unwrap();
        let (_, leaf) = X509Certificate::from_der(der.as_ref()).unwrap();

        let subject = leaf.subject().to_string();
        assert!(subject.contains("mitm.example.com"));
        let constraints = leaf.basic_constraints().unwrap().unwrap();
        assert!(!constraints.value.ca);

        let san = leaf.subject_alternative_name().unwrap().unwrap();
        let names: Vec<String> = san
            .value
            .general_names
            .iter()
            .filter_map(|gn| match gn {
                GeneralName::DNSName(n) => Some((*n).to_string()),
                _ => None,
            })
            .collect();
        assert!(names.contains(&"example.com".to_string()));
        assert!(names.contains(&"www.example.com".to_string()));
        assert!(names.contains(&"mitm.example.com".to_string()));

        // Issuer carries the CA subject, not the leaf's own.
        assert!(leaf.issuer().to_string().contains("Sift Proxy CA"));
    }

    #[test]
    fn test_cache_reuses_leaf_while_files_exist() {
        let dir = TempDir::new().unwrap();
        let ca = test_ca(&dir);
        let upstream = upstream_cert(&["example.com"]);

        ca.server_config_for("example.com", &upstream).unwrap();
        let first = minted_files(&dir);
        ca.server_config_for("example.com", &upstream).unwrap();
        let second = minted_files(&dir);
        assert_eq!(first, second);
    }

    #[test]
    fn test_cache_regenerates_when_files_removed() {
        let dir = TempDir::new().unwrap();
        let ca = test_ca(&dir);
        let upstream = upstream_cert(&["example.com"]);

        ca.server_config_for("example.com", &upstream).unwrap();
        for file in minted_files(&dir) {
            fs::remove_file(file).unwrap();
        }
        ca.server_config_for("example.com", &upstream).unwrap();
        assert_eq!(minted_files(&dir).len(), 2);
    }

    #[test]
    fn test_unparseable_upstream_cert_still_mints_for_hostname() {
        let dir = TempDir::new().unwrap();
        let ca = test_ca(&dir);
        let bogus = CertificateDer::from(vec![0u8; 8]);

        ca.server_config_for("example.com", &bogus).unwrap();

        let files = minted_files(&dir);
        let crt = files.iter().find(|p| p.extension().unwrap() == "crt").unwrap();
        let pem = fs::read_to_string(crt).unwrap();
        let der = rustls_pemfile::certs(&mut pem.as_bytes())
            .next()
            .unwrap()
            .unwrap();
        let (_, leaf) = X509Certificate::from_der(der.as_ref()).unwrap();
        let san = leaf.subject_alternative_name().unwrap().unwrap();
        assert_eq!(san.value.general_names.len(), 1);
    }
}
