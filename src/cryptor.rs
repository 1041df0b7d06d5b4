//! The tls engine used to secure an android auto session.
//!
//! The head unit acts as the tls client. Handshake records are not exchanged
//! on a socket; they ride inside control channel messages, so the engine here
//! only ever talks to in-memory buffers and the messenger shuttles the bytes.

use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Once};

use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};

use crate::cert;
use crate::error::AutoError;

/// Progress report from pumping the tls handshake
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// More handshake round trips are required
    InProgress,
    /// The tls session is established
    Done,
}

/// Makes sure a crypto provider is installed exactly once for the process
fn install_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// The server verifier for android auto head units. The phone presents a
/// certificate from a google-internal chain, so verification of the peer is
/// disabled and every certificate is accepted.
#[derive(Debug)]
struct AndroidAutoServerVerifier {
    /// The object providing the signature checking functionality
    base: Arc<rustls::client::WebPkiServerVerifier>,
}

impl AndroidAutoServerVerifier {
    /// Build a new server verifier using the given root certificate store
    fn new(roots: Arc<rustls::RootCertStore>) -> Result<Self, AutoError> {
        let base = rustls::client::WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| AutoError::Crypto {
                stage: "init",
                source: rustls::Error::General(e.to_string()),
            })?;
        Ok(Self { base })
    }
}

impl rustls::client::danger::ServerCertVerifier for AndroidAutoServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.base.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.base.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.base.supported_verify_schemes()
    }
}

/// The head unit's tls engine plus its in-memory buffers. Owned by the
/// messenger after construction; encrypt and decrypt are never called
/// concurrently.
pub struct Cryptor {
    /// The client side tls state machine
    conn: rustls::client::ClientConnection,
    /// Latched once the handshake has completed
    established: bool,
}

impl Cryptor {
    /// Construct the tls context in client mode with the embedded head unit
    /// certificate and key, and peer verification disabled.
    pub fn new() -> Result<Self, AutoError> {
        install_provider();
        let crypto_err = |e: rustls::Error| AutoError::Crypto {
            stage: "init",
            source: e,
        };
        let certificate = CertificateDer::from_pem_slice(cert::CERTIFICATE.as_bytes())
            .map_err(|e| crypto_err(rustls::Error::General(e.to_string())))?;
        let key = PrivateKeyDer::from_pem_slice(cert::PRIVATE_KEY.as_bytes())
            .map_err(|e| crypto_err(rustls::Error::General(e.to_string())))?;
        let root_store = Arc::new(rustls::RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        ));
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store.clone())
            .with_client_auth_cert(vec![certificate], key)
            .map_err(crypto_err)?;
        let verifier = Arc::new(AndroidAutoServerVerifier::new(root_store)?);
        config.dangerous().set_certificate_verifier(verifier);
        let server = "android-auto.local"
            .try_into()
            .map_err(|_| crypto_err(rustls::Error::General("bad server name".into())))?;
        let conn = rustls::client::ClientConnection::new(Arc::new(config), server)
            .map_err(crypto_err)?;
        Ok(Self {
            conn,
            established: false,
        })
    }

    /// Pump the handshake state machine, reporting whether it has finished
    pub fn do_handshake(&mut self) -> Result<HandshakeStatus, AutoError> {
        self.conn
            .process_new_packets()
            .map_err(|e| AutoError::Crypto {
                stage: "handshake",
                source: e,
            })?;
        if self.conn.is_handshaking() {
            Ok(HandshakeStatus::InProgress)
        } else {
            self.established = true;
            Ok(HandshakeStatus::Done)
        }
    }

    /// Drain the handshake ciphertext the head unit must send to the peer
    pub fn read_handshake(&mut self) -> Result<Vec<u8>, AutoError> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut out)
                .map_err(|e| AutoError::Crypto {
                    stage: "handshake",
                    source: rustls::Error::General(e.to_string()),
                })?;
        }
        Ok(out)
    }

    /// Push handshake ciphertext received from the peer into the engine
    pub fn write_handshake(&mut self, data: &[u8]) -> Result<(), AutoError> {
        let mut cursor = Cursor::new(data);
        while cursor.position() < data.len() as u64 {
            let n = self
                .conn
                .read_tls(&mut cursor)
                .map_err(|e| AutoError::Crypto {
                    stage: "handshake",
                    source: rustls::Error::General(e.to_string()),
                })?;
            if n == 0 {
                break;
            }
            self.conn
                .process_new_packets()
                .map_err(|e| AutoError::Crypto {
                    stage: "handshake",
                    source: e,
                })?;
        }
        Ok(())
    }

    /// True once the handshake has completed and record operations are legal
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Encrypt a record payload, producing the ciphertext to put on the wire
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, AutoError> {
        self.conn
            .writer()
            .write_all(plaintext)
            .map_err(|e| AutoError::Crypto {
                stage: "encrypt",
                source: rustls::Error::General(e.to_string()),
            })?;
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut out)
                .map_err(|e| AutoError::Crypto {
                    stage: "encrypt",
                    source: rustls::Error::General(e.to_string()),
                })?;
        }
        Ok(out)
    }

    /// Decrypt a record payload received from the wire
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, AutoError> {
        let mut plain = vec![0u8; ciphertext.len()];
        let mut cursor = Cursor::new(ciphertext);
        let mut index = 0;
        loop {
            let n = self
                .conn
                .read_tls(&mut cursor)
                .map_err(|e| AutoError::Crypto {
                    stage: "decrypt",
                    source: rustls::Error::General(e.to_string()),
                })?;
            self.conn
                .process_new_packets()
                .map_err(|e| AutoError::Crypto {
                    stage: "decrypt",
                    source: e,
                })?;
            if n == 0 {
                break;
            }
            if let Ok(l) = self.conn.reader().read(&mut plain[index..]) {
                index += l;
            }
        }
        plain.truncate(index);
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_succeeds_with_embedded_identity() {
        let cryptor = Cryptor::new().unwrap();
        assert!(!cryptor.is_established());
    }

    #[test]
    fn first_flight_is_nonempty() {
        let mut cryptor = Cryptor::new().unwrap();
        assert_eq!(cryptor.do_handshake().unwrap(), HandshakeStatus::InProgress);
        let hello = cryptor.read_handshake().unwrap();
        assert!(!hello.is_empty());
        // 0x16 is a tls handshake record
        assert_eq!(hello[0], 0x16);
    }
}
