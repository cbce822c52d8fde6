use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};
use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::Arc;

use crate::ftp::{ControlStream, FtpError};

pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

impl ControlStream for TlsStream {
    fn close(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        self.flush()
    }
}

/// Builds the client TLS configuration. With `verify_certificates` off any
/// server certificate is accepted, whatever name it carries; handshake
/// signatures are still checked.
pub fn client_config(verify_certificates: bool) -> Result<Arc<ClientConfig>, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = if verify_certificates {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    };

    Ok(Arc::new(config))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, FtpError> {
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|err| FtpError::ServerName(format!("{host:?}: {err}")))
}

/// Runs the client handshake to completion over an already connected socket.
pub fn handshake(
    config: Arc<ClientConfig>,
    host: &str,
    mut tcp: TcpStream,
) -> Result<TlsStream, FtpError> {
    let mut conn = ClientConnection::new(config, server_name(host)?)?;
    while conn.is_handshaking() {
        let (read, written) = conn.complete_io(&mut tcp)?;
        if read == 0 && written == 0 {
            return Err(FtpError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during TLS handshake",
            )));
        }
    }
    Ok(StreamOwned::new(conn, tcp))
}

#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        verify_tls12_signature(
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
        verify_tls13_signature(
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_both_verification_modes() {
        assert!(client_config(false).is_ok());
        assert!(client_config(true).is_ok());
    }

    #[test]
    fn accept_any_verifier_advertises_provider_schemes() {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = AcceptAnyCertificate {
            provider: provider.clone(),
        };
        let schemes = verifier.supported_verify_schemes();
        assert!(!schemes.is_empty());
        assert!(schemes.contains(&SignatureScheme::ECDSA_NISTP256_SHA256));
    }

    #[test]
    fn accept_any_verifier_ignores_certificate_contents() {
        let verifier = AcceptAnyCertificate {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        };
        let cert = CertificateDer::from(vec![0u8; 16]);
        let name = server_name("ftp.example.com").unwrap();
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
    }

    #[test]
    fn server_name_accepts_ip_and_dns_names() {
        assert!(matches!(
            server_name("162.0.215.16").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("ftp.example.com").unwrap(),
            ServerName::DnsName(_)
        ));
    }

    fn spawn_peer(reply: &'static [u8]) -> (std::net::SocketAddr, std::thread::JoinHandle<()>) {
        use std::io::Read;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut tcp, _) = listener.accept().unwrap();
            let mut hello = [0u8; 1024];
            let _ = tcp.read(&mut hello);
            let _ = tcp.write_all(reply);
        });
        (addr, handle)
    }

    #[test]
    fn handshake_fails_when_peer_speaks_plaintext() {
        let (addr, peer) = spawn_peer(b"500 this is not TLS\r\n");
        let tcp = TcpStream::connect(addr).unwrap();
        let result = handshake(client_config(false).unwrap(), "127.0.0.1", tcp);
        assert!(matches!(result, Err(FtpError::Io(_))));
        peer.join().unwrap();
    }

    #[test]
    fn handshake_fails_when_peer_hangs_up() {
        let (addr, peer) = spawn_peer(b"");
        let tcp = TcpStream::connect(addr).unwrap();
        let result = handshake(client_config(false).unwrap(), "127.0.0.1", tcp);
        assert!(matches!(result, Err(FtpError::Io(_))));
        peer.join().unwrap();
    }

    #[test]
    fn server_name_rejects_garbage() {
        assert!(matches!(server_name(""), Err(FtpError::ServerName(_))));
        assert!(matches!(server_name("bad host"), Err(FtpError::ServerName(_))));
    }
}
