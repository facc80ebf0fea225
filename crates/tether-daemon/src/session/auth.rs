//! Certificate authentication and key material parsing
//!
//! Users log in with OpenSSH user certificates signed by a single trusted
//! authority. Bare public keys are never accepted.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use russh_keys::PrivateKey;
use ssh_key::certificate::CertType;
use ssh_key::{Certificate, Fingerprint, HashAlg, PublicKey};

use tether_core::error::{AuthError, SessionServerError};

/// The trusted user-certificate authority
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    key: PublicKey,
    fingerprint: Fingerprint,
}

impl CertificateAuthority {
    /// Parse the authority from an authorized-keys style line
    pub fn from_authorized_key(line: &str) -> Result<Self, SessionServerError> {
        let key = PublicKey::from_openssh(line.trim()).map_err(|e| {
            SessionServerError::InvalidKeyMaterial(format!("authority public key: {}", e))
        })?;
        let fingerprint = key.fingerprint(HashAlg::Sha256);
        Ok(Self { key, fingerprint })
    }

    /// SHA-256 fingerprint of the authority key
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Check a presented certificate for `user` at the current time
    pub fn verify(&self, user: &str, cert: &Certificate) -> Result<(), AuthError> {
        self.verify_at(user, cert, unix_now())
    }

    /// Check a presented certificate for `user` at `now` (unix seconds).
    ///
    /// The certificate must be a user certificate signed by this authority,
    /// currently valid, list `user` among its principals (an empty list
    /// admits anyone) and carry no critical options.
    pub fn verify_at(&self, user: &str, cert: &Certificate, now: u64) -> Result<(), AuthError> {
        if cert.cert_type() != CertType::User {
            return Err(AuthError::WrongCertType(format!("{:?}", cert.cert_type())));
        }

        if cert.signature_key() != self.key.key_data() {
            return Err(AuthError::UnknownAuthority);
        }

        let after = cert.valid_after();
        let before = cert.valid_before();
        if now < after || now >= before {
            return Err(AuthError::Expired { now, after, before });
        }

        let principals = cert.valid_principals();
        if !principals.is_empty() && !principals.iter().any(|p| p == user) {
            return Err(AuthError::PrincipalMismatch(user.to_string()));
        }

        if let Some((name, _)) = cert.critical_options().iter().next() {
            return Err(AuthError::UnsupportedCriticalOption(name.clone()));
        }

        cert.validate_at(now, [&self.fingerprint])
            .map_err(|e| AuthError::BadSignature(e.to_string()))
    }
}

/// Parse the host private key.
///
/// Accepts PEM text directly, or the same text base64-encoded as a single
/// line (the form the fleet backend ships it in).
pub fn parse_host_key(text: &str) -> Result<PrivateKey, SessionServerError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SessionServerError::InvalidKeyMaterial(
            "host private key is empty".to_string(),
        ));
    }

    let pem = if text.starts_with("-----BEGIN") {
        text.to_string()
    } else {
        let compact: String = text.split_whitespace().collect();
        let bytes = STANDARD.decode(compact).map_err(|e| {
            SessionServerError::InvalidKeyMaterial(format!("host private key base64: {}", e))
        })?;
        String::from_utf8(bytes).map_err(|_| {
            SessionServerError::InvalidKeyMaterial("host private key is not text".to_string())
        })?
    };

    russh_keys::decode_secret_key(&pem, None)
        .map_err(|e| SessionServerError::InvalidKeyMaterial(format!("host private key: {}", e)))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
