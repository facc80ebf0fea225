//! Key and certificate fixtures for tests

#![allow(dead_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use ssh_key::certificate::{Builder, CertType};
use ssh_key::{Algorithm, Certificate, LineEnding, PrivateKey};

/// A throwaway user-certificate authority
pub struct TestAuthority {
    pub key: PrivateKey,
}

impl TestAuthority {
    /// Authority public key as an authorized-keys line
    pub fn authorized_key(&self) -> String {
        self.key.public_key().to_openssh().unwrap()
    }
}

/// Generate a fresh ed25519 authority
pub fn mint_authority() -> TestAuthority {
    TestAuthority {
        key: PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap(),
    }
}

/// Knobs for [`mint_user_cert`]
pub struct CertOptions {
    pub principals: Vec<String>,
    pub cert_type: CertType,
    pub critical_option: Option<(String, String)>,
    pub valid_for: Duration,
}

impl Default for CertOptions {
    fn default() -> Self {
        Self {
            principals: vec!["root".to_string()],
            cert_type: CertType::User,
            critical_option: None,
            valid_for: Duration::from_secs(3600),
        }
    }
}

/// Sign a certificate for a freshly generated user key
pub fn mint_user_cert(ca: &TestAuthority, options: CertOptions) -> Certificate {
    mint_user_key_and_cert(ca, options).1
}

/// Generate a user key and sign a certificate for it
pub fn mint_user_key_and_cert(
    ca: &TestAuthority,
    options: CertOptions,
) -> (PrivateKey, Certificate) {
    let user = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();

    let mut builder = Builder::new_with_random_nonce(
        &mut OsRng,
        user.public_key().key_data().clone(),
        now - 60,
        now + options.valid_for.as_secs(),
    )
    .unwrap();
    builder.serial(1).unwrap();
    builder.key_id("operator").unwrap();
    builder.cert_type(options.cert_type).unwrap();
    if options.principals.is_empty() {
        builder.all_principals_valid().unwrap();
    }
    for principal in options.principals {
        builder.valid_principal(principal).unwrap();
    }
    if let Some((name, data)) = options.critical_option {
        builder.critical_option(name, data).unwrap();
    }
    let cert = builder.sign(&ca.key).unwrap();
    (user, cert)
}

/// A fresh ed25519 host key in OpenSSH PEM form
pub fn host_key_pem() -> String {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .unwrap()
        .to_openssh(LineEnding::LF)
        .unwrap()
        .to_string()
}
