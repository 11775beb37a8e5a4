use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::Hmac;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::models::{Credential, Subject};
use crate::Error;

const ENVELOPE_VERSION: u8 = 1;
const KDF_SALT: &[u8] = b"gradewatch/vault/v1";
const KDF_ROUNDS: u32 = 100_000;

#[derive(Debug, Serialize, Deserialize)]
struct Sealed {
    version: u8,
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

/// Encrypts login secrets at rest with one process-wide AES-256-GCM key.
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    pub fn new(key: [u8; 32]) -> Result<Self, Error> {
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| Error::vault("vault key must be 32 bytes"))?;
        Ok(Self { cipher })
    }

    /// 64 hex characters are used as the raw key, anything else is stretched with PBKDF2.
    pub fn from_key_material(material: &str) -> Result<Self, Error> {
        let material = material.trim();
        if material.is_empty() {
            return Err(Error::vault("vault key is empty"));
        }
        let mut key = [0u8; 32];
        match hex::decode(material) {
            Ok(raw) if raw.len() == key.len() => key.copy_from_slice(&raw),
            _ => pbkdf2::pbkdf2::<Hmac<Sha256>>(material.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key),
        }
        Self::new(key)
    }

    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, Error> {
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| Error::vault("encryption failed"))?;
        let sealed = Sealed {
            version: ENVELOPE_VERSION,
            nonce,
            ciphertext,
        };
        Ok(postcard::to_allocvec(&sealed)?)
    }

    pub fn decrypt(&self, envelope: &[u8]) -> Result<String, Error> {
        let sealed: Sealed = postcard::from_bytes(envelope)?;
        if sealed.version != ENVELOPE_VERSION {
            return Err(Error::vault(format!(
                "unsupported credential envelope version {}",
                sealed.version
            )));
        }
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
            .map_err(|_| Error::vault("credential integrity check failed (wrong key?)"))?;
        String::from_utf8(plain).map_err(|_| Error::vault("decrypted credential is not UTF-8"))
    }

    /// Returns `(login_enc, password_enc)`.
    pub fn seal(&self, credential: &Credential) -> Result<(Vec<u8>, Vec<u8>), Error> {
        Ok((
            self.encrypt(&credential.login)?,
            self.encrypt(&credential.password)?,
        ))
    }

    pub fn open(&self, subject: &Subject) -> Result<Credential, Error> {
        Ok(Credential {
            login: self.decrypt(&subject.login_enc)?,
            password: self.decrypt(&subject.password_enc)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::from_key_material(&Vault::generate_key()).unwrap()
    }

    #[test]
    fn round_trips_plaintext() {
        let vault = vault();
        let sealed = vault.encrypt("s3cret pässword").unwrap();
        assert_eq!(vault.decrypt(&sealed).unwrap(), "s3cret pässword");
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let vault = vault();
        assert_ne!(vault.encrypt("same").unwrap(), vault.encrypt("same").unwrap());
    }

    #[test]
    fn wrong_key_is_detected() {
        let sealed = vault().encrypt("student01").unwrap();
        let err = vault().decrypt(&sealed).unwrap_err();
        assert!(matches!(err, Error::VaultFailure { .. }));
    }

    #[test]
    fn tampering_is_detected() {
        let vault = vault();
        let mut sealed = vault.encrypt("student01").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(vault.decrypt(&sealed), Err(Error::VaultFailure { .. })));
        assert!(matches!(vault.decrypt(&[1, 2]), Err(Error::VaultFailure { .. })));
    }

    #[test]
    fn passphrase_keys_are_stable() {
        let a = Vault::from_key_material("correct horse battery staple").unwrap();
        let b = Vault::from_key_material("correct horse battery staple").unwrap();
        let sealed = a.encrypt("login").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap(), "login");
        assert!(Vault::from_key_material("  ").is_err());
    }

    #[test]
    fn seals_credential_pairs() {
        let vault = vault();
        let credential = Credential {
            login: "student01".into(),
            password: "pw".into(),
        };
        let (login_enc, password_enc) = vault.seal(&credential).unwrap();
        assert_ne!(login_enc, password_enc);
        assert_eq!(vault.decrypt(&login_enc).unwrap(), "student01");
        assert_eq!(vault.decrypt(&password_enc).unwrap(), "pw");
    }
}
