//! Encryption of site secrets at rest.
//!
//! The store encrypts admin/database passwords, SSH private keys and the
//! instance database root secret before they reach SQLite, and decrypts
//! them on the way out. Ciphertext is an age payload, base64-encoded so it
//! fits a TEXT column.

use age::secrecy::ExposeSecret as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Symmetric boundary between plaintext secrets and stored ciphertext.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &SecretString) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<SecretString>;
}

/// age X25519 cipher keyed by a local identity file.
pub struct AgeCipher {
    identity: age::x25519::Identity,
    recipient: age::x25519::Recipient,
}

impl AgeCipher {
    /// Cipher with a throwaway identity. Ciphertext does not outlive the process.
    pub fn generate() -> Self {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();
        Self {
            identity,
            recipient,
        }
    }

    /// Load the identity at `path`, creating it (mode 0600) if absent.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            create_identity(path)?;
        }
        let identity = load_identity(path)?;
        let recipient = identity.to_public();
        Ok(Self {
            identity,
            recipient,
        })
    }

    /// Open the identity at the default location (~/.config/sitewright/identity.txt).
    pub fn open_default() -> Result<Self> {
        Self::open_or_create(&crate::paths::identity()?)
    }
}

impl SecretCipher for AgeCipher {
    fn encrypt(&self, plaintext: &SecretString) -> Result<String> {
        let encryptor = age::Encryptor::with_recipients(vec![Box::new(self.recipient.clone())])
            .ok_or_else(|| Error::crypto("no valid encryption recipients", None))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| Error::crypto(e.to_string(), Some("encrypt".to_string())))?;
        writer
            .write_all(plaintext.expose_secret().as_bytes())
            .map_err(|e| Error::crypto(e.to_string(), Some("encrypt".to_string())))?;
        writer
            .finish()
            .map_err(|e| Error::crypto(e.to_string(), Some("encrypt".to_string())))?;

        Ok(BASE64.encode(encrypted))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<SecretString> {
        let raw = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| Error::crypto(e.to_string(), Some("decode ciphertext".to_string())))?;

        let age::Decryptor::Recipients(decryptor) = age::Decryptor::new(&raw[..])
            .map_err(|e| Error::crypto(e.to_string(), Some("decrypt".to_string())))?
        else {
            return Err(Error::crypto("unexpected decryptor type", None));
        };

        let identity: &dyn age::Identity = &self.identity;
        let mut reader = decryptor
            .decrypt(std::iter::once(identity))
            .map_err(|e| Error::crypto(e.to_string(), Some("decrypt".to_string())))?;

        let mut decrypted = String::new();
        reader
            .read_to_string(&mut decrypted)
            .map_err(|e| Error::crypto(e.to_string(), Some("decrypt".to_string())))?;

        Ok(SecretString::from(decrypted))
    }
}

fn load_identity(path: &Path) -> Result<age::x25519::Identity> {
    #[cfg(unix)]
    check_identity_permissions(path)?;

    let contents = fs::read_to_string(path).map_err(|e| {
        Error::crypto(e.to_string(), Some(format!("read {}", path.display())))
    })?;

    contents
        .lines()
        .find(|line| !line.starts_with('#') && !line.trim().is_empty())
        .ok_or_else(|| Error::crypto("identity file is empty", Some(path.display().to_string())))?
        .trim()
        .parse::<age::x25519::Identity>()
        .map_err(|e| Error::crypto(e.to_string(), Some("parse identity".to_string())))
}

fn create_identity(path: &Path) -> Result<()> {
    let identity = age::x25519::Identity::generate();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("create {}", parent.display())))
        })?;
    }

    #[cfg(unix)]
    let mut file = {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| Error::internal_io(e.to_string(), Some("create identity".to_string())))?
    };

    #[cfg(not(unix))]
    let mut file = fs::File::create(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some("create identity".to_string())))?;

    writeln!(
        file,
        "# created: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    )
    .ok();
    writeln!(file, "# public key: {}", identity.to_public()).ok();
    writeln!(file, "{}", identity.to_string().expose_secret())
        .map_err(|e| Error::internal_io(e.to_string(), Some("write identity".to_string())))?;

    tracing::info!(path = %path.display(), "Created secret identity");
    Ok(())
}

#[cfg(unix)]
fn check_identity_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let metadata = fs::metadata(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some("stat identity".to_string())))?;
    let mode = metadata.mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(Error::crypto(
            format!("identity file has mode {:o}, expected 0600", mode),
            Some(path.display().to_string()),
        )
        .with_hint(format!("chmod 600 {}", path.display())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_recovers_plaintext() {
        let cipher = AgeCipher::generate();
        let secret = SecretString::from("hunter2-but-longer".to_string());

        let ciphertext = cipher.encrypt(&secret).unwrap();
        assert!(!ciphertext.contains("hunter2"));

        let plain = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(plain.expose_secret(), "hunter2-but-longer");
    }

    #[test]
    fn other_identity_cannot_decrypt() {
        let a = AgeCipher::generate();
        let b = AgeCipher::generate();
        let ciphertext = a.encrypt(&SecretString::from("x".to_string())).unwrap();
        assert_eq!(b.decrypt(&ciphertext).unwrap_err().code.as_str(), "internal.crypto_error");
    }

    #[test]
    fn identity_file_is_created_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.txt");

        let first = AgeCipher::open_or_create(&path).unwrap();
        let ciphertext = first.encrypt(&SecretString::from("persisted".to_string())).unwrap();

        let second = AgeCipher::open_or_create(&path).unwrap();
        assert_eq!(second.decrypt(&ciphertext).unwrap().expose_secret(), "persisted");

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            assert_eq!(fs::metadata(&path).unwrap().mode() & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_identity_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.txt");
        AgeCipher::open_or_create(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        assert!(AgeCipher::open_or_create(&path).is_err());
    }
}
