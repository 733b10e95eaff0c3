use crate::error::{config_error, openssl_error, IdpResult};
use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use openssl::x509::{X509NameBuilder, X509};
use std::fmt;
use std::path::Path;

/// The IdP's RSA key and the certificate published in metadata and `KeyInfo`.
#[derive(Clone)]
pub struct SigningCredentials {
    key: PKey<Private>,
    cert: X509,
}

impl fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredentials").finish_non_exhaustive()
    }
}

impl SigningCredentials {
    /// Reads PEM key and certificate files. Any failure is a startup `Config` error.
    pub fn load(key_path: &Path, cert_path: &Path) -> IdpResult<Self> {
        let key_pem = std::fs::read(key_path).map_err(|err| {
            config_error(format!("reading signing key {}: {err}", key_path.display()))
        })?;
        let cert_pem = std::fs::read(cert_path).map_err(|err| {
            config_error(format!("reading certificate {}: {err}", cert_path.display()))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> IdpResult<Self> {
        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|err| config_error(format!("parsing signing key: {err}")))?;
        let cert = X509::from_pem(cert_pem)
            .map_err(|err| config_error(format!("parsing certificate: {err}")))?;
        Self::from_parts(key, cert)
    }

    fn from_parts(key: PKey<Private>, cert: X509) -> IdpResult<Self> {
        if key.rsa().is_err() {
            return Err(config_error("signing key must be RSA"));
        }
        let cert_key = cert
            .public_key()
            .map_err(|err| config_error(format!("certificate public key: {err}")))?;
        if !cert_key.public_eq(&*key) {
            return Err(config_error("signing key does not match certificate"));
        }
        Ok(Self { key, cert })
    }

    /// Generates a throwaway RSA-2048 key with a self-signed certificate.
    pub fn generate_self_signed(common_name: &str) -> IdpResult<Self> {
        let key = PKey::from_rsa(Rsa::generate(2048).map_err(openssl_error)?)
            .map_err(openssl_error)?;

        let mut name = X509NameBuilder::new().map_err(openssl_error)?;
        name.append_entry_by_text("CN", common_name)
            .map_err(openssl_error)?;
        let name = name.build();

        let mut builder = X509::builder().map_err(openssl_error)?;
        builder.set_version(2).map_err(openssl_error)?;
        let serial = BigNum::from_u32(1)
            .and_then(|bn| bn.to_asn1_integer())
            .map_err(openssl_error)?;
        builder.set_serial_number(&serial).map_err(openssl_error)?;
        builder.set_subject_name(&name).map_err(openssl_error)?;
        builder.set_issuer_name(&name).map_err(openssl_error)?;
        builder.set_pubkey(&key).map_err(openssl_error)?;
        let not_before = Asn1Time::days_from_now(0).map_err(openssl_error)?;
        let not_after = Asn1Time::days_from_now(365).map_err(openssl_error)?;
        builder.set_not_before(&not_before).map_err(openssl_error)?;
        builder.set_not_after(&not_after).map_err(openssl_error)?;
        builder
            .sign(&key, MessageDigest::sha256())
            .map_err(openssl_error)?;

        Self::from_parts(key, builder.build())
    }

    /// RSA-SHA256 (PKCS#1 v1.5) signature over `data`.
    pub fn sign_sha256(&self, data: &[u8]) -> IdpResult<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key).map_err(openssl_error)?;
        signer.update(data).map_err(openssl_error)?;
        signer.sign_to_vec().map_err(openssl_error)
    }

    pub fn verify_sha256(&self, data: &[u8], signature: &[u8]) -> IdpResult<bool> {
        let public = self.cert.public_key().map_err(openssl_error)?;
        let mut verifier = Verifier::new(MessageDigest::sha256(), &public).map_err(openssl_error)?;
        verifier.update(data).map_err(openssl_error)?;
        verifier.verify(signature).map_err(openssl_error)
    }

    /// Certificate as base64 DER, the form used inside `<ds:X509Certificate>`.
    pub fn certificate_base64_der(&self) -> IdpResult<String> {
        let der = self.cert.to_der().map_err(openssl_error)?;
        Ok(STANDARD.encode(der))
    }

    /// PKCS#1 DER of the private key; the HMAC secret for session tokens.
    pub fn session_secret(&self) -> IdpResult<Vec<u8>> {
        let rsa = self.key.rsa().map_err(openssl_error)?;
        rsa.private_key_to_der().map_err(openssl_error)
    }

    pub fn private_key_pem(&self) -> IdpResult<Vec<u8>> {
        let rsa = self.key.rsa().map_err(openssl_error)?;
        rsa.private_key_to_pem().map_err(openssl_error)
    }

    pub fn public_key_pem(&self) -> IdpResult<Vec<u8>> {
        self.key.public_key_to_pem().map_err(openssl_error)
    }

    pub fn certificate_pem(&self) -> IdpResult<Vec<u8>> {
        self.cert.to_pem().map_err(openssl_error)
    }
}
