use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::config::Config;

/// TLS acceptor for the configured certificate pair, or `None` when TLS is off.
pub fn acceptor_from_config(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => {
            let server = server_config(load_certs(cert)?, load_key(key)?)?;
            Ok(Some(TlsAcceptor::from(Arc::new(server))))
        }
        _ => Err(io::Error::new(
            ErrorKind::InvalidInput,
            "INNKEEP_TLS_CERT and INNKEEP_TLS_KEY must be set together",
        )),
    }
}

fn load_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(path)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates in {path}"),
        ));
    }
    Ok(certs)
}

fn load_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(File::open(path)?))?.ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidInput, format!("no private key in {path}"))
    })
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> io::Result<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(cert: Option<&str>, key: Option<&str>) -> Config {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.tls_cert = cert.map(String::from);
        config.tls_key = key.map(String::from);
        config
    }

    #[test]
    fn disabled_without_paths() {
        assert!(acceptor_from_config(&config_with(None, None)).unwrap().is_none());
    }

    #[test]
    fn half_configured_rejected() {
        let err = acceptor_from_config(&config_with(Some("cert.pem"), None)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_files_reported() {
        let err = acceptor_from_config(&config_with(
            Some("/nonexistent/innkeep/cert.pem"),
            Some("/nonexistent/innkeep/key.pem"),
        ))
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn empty_certificate_file_rejected() {
        let dir = std::env::temp_dir().join("innkeep_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty_cert.pem");
        std::fs::write(&cert, "").unwrap();
        let err = load_certs(cert.to_str().unwrap()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
