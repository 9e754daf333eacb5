//! Encrypted-at-rest persistence for the two session cookie sets.
//!
//! Cookie sets are written encrypted to the user config dir:
//! `~/.config/cardwatch/target.cookies.enc` and
//! `~/.config/cardwatch/federation.cookies.enc`
//! (or `$XDG_CONFIG_HOME/cardwatch/...`).

use std::env;
use std::ffi::OsString;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{CookieRecord, CookieSet};

const KEYRING_SERVICE: &str = "cardwatch";
const KEYRING_ENTRY_NAME: &str = "cookie-master-key-v1";
const MAGIC: &[u8; 4] = b"CWC1";
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// The two persisted cookie scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultSlot {
    /// Cookies scoped to the scraped application's domain.
    Target,
    /// Every cookie observed during the authentication walk (identity
    /// provider and second-factor provider included).
    Federation,
}

impl VaultSlot {
    fn file_name(self) -> &'static str {
        match self {
            Self::Target => "target.cookies.enc",
            Self::Federation => "federation.cookies.enc",
        }
    }
}

/// Errors for persisted cookie storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No suitable user config directory is available.
    #[error("unable to determine config directory (set XDG_CONFIG_HOME or HOME)")]
    ConfigDirUnavailable,
    /// Filesystem I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Could not access keychain and no env fallback key was provided.
    #[error(
        "unable to access system keychain for cookie encryption key; set CARDWATCH_MASTER_KEY or configure keychain access"
    )]
    KeychainUnavailable,
    /// Stored encrypted payload is malformed.
    #[error("persisted cookie payload is invalid")]
    InvalidPayload,
    /// Encryption failed.
    #[error("failed to encrypt persisted cookies")]
    EncryptionFailed,
    /// Decryption failed.
    #[error("failed to decrypt persisted cookies")]
    DecryptionFailed,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    path: String,
}

impl StoredCookie {
    fn from_record(record: &CookieRecord) -> Self {
        Self {
            name: record.name.clone(),
            value: record.value().to_string(),
            domain: record.domain.clone(),
            path: record.path.clone(),
        }
    }

    fn into_record(self) -> CookieRecord {
        CookieRecord::new(self.name, self.value, self.domain, self.path)
    }
}

/// Encrypted on-disk store for the target and federation cookie sets.
///
/// The vault directory and key are fixed at construction so operations and
/// tests can point at isolated locations; [`CookieVault::open_default`] uses
/// the user config dir and the keychain-held master key.
#[derive(Debug, Clone)]
pub struct CookieVault {
    dir: PathBuf,
    explicit_key: Option<String>,
}

impl CookieVault {
    /// Opens the vault at the default config location with keychain/env key
    /// resolution.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConfigDirUnavailable`] if no usable config dir
    /// is found.
    pub fn open_default() -> Result<Self, StoreError> {
        Ok(Self {
            dir: default_config_dir()?,
            explicit_key: None,
        })
    }

    /// Opens a vault rooted at an explicit directory with a fixed key.
    ///
    /// Used by tests and by deployments that manage their own key material.
    #[must_use]
    pub fn at(dir: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            explicit_key: Some(key.into()),
        }
    }

    /// Path of a slot's encrypted file.
    #[must_use]
    pub fn slot_path(&self, slot: VaultSlot) -> PathBuf {
        self.dir.join(slot.file_name())
    }

    /// Stores a cookie set encrypted at rest.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when key retrieval, encryption, or file
    /// writing fails.
    pub fn store(&self, slot: VaultSlot, cookies: &CookieSet) -> Result<PathBuf, StoreError> {
        let path = self.slot_path(slot);
        let key = self.key_material()?;

        let stored = cookies
            .iter()
            .map(StoredCookie::from_record)
            .collect::<Vec<_>>();
        let plaintext = serde_json::to_vec(&stored)?;
        let encrypted = encrypt_bytes(&plaintext, &key)?;
        write_encrypted_payload(&path, &encrypted)?;
        Ok(path)
    }

    /// Loads and decrypts a persisted cookie set.
    ///
    /// Returns `Ok(None)` when the slot has never been written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when key retrieval, decryption, or parsing
    /// fails.
    pub fn load(&self, slot: VaultSlot) -> Result<Option<CookieSet>, StoreError> {
        let path = self.slot_path(slot);
        if !path.exists() {
            return Ok(None);
        }

        let key = self.key_material()?;
        let bytes = fs::read(&path)?;
        let plaintext = decrypt_bytes(&bytes, &key)?;
        let stored = serde_json::from_slice::<Vec<StoredCookie>>(&plaintext)?;
        Ok(Some(
            stored.into_iter().map(StoredCookie::into_record).collect(),
        ))
    }

    /// Removes both persisted sets and best-effort clears the keychain key.
    ///
    /// Returns `true` when at least one slot file existed and was deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when file removal fails.
    pub fn clear(&self) -> Result<bool, StoreError> {
        let mut removed = false;
        for slot in [VaultSlot::Target, VaultSlot::Federation] {
            let path = self.slot_path(slot);
            if path.exists() {
                fs::remove_file(&path)?;
                removed = true;
            }
        }

        if self.explicit_key.is_none() && env::var_os("CARDWATCH_MASTER_KEY").is_none() {
            let _ = delete_keychain_key();
        }

        Ok(removed)
    }

    fn key_material(&self) -> Result<String, StoreError> {
        if let Some(key) = &self.explicit_key {
            return Ok(key.clone());
        }
        load_or_create_key()
    }
}

fn default_config_dir() -> Result<PathBuf, StoreError> {
    resolve_config_dir(
        sanitize_env_path(env::var_os("XDG_CONFIG_HOME")),
        sanitize_env_path(env::var_os("HOME")),
        sanitize_env_path(env::var_os("APPDATA")),
    )
}

fn sanitize_env_path(value: Option<OsString>) -> Option<PathBuf> {
    let value = value?;
    if value.to_string_lossy().trim().is_empty() {
        return None;
    }

    Some(PathBuf::from(value))
}

fn resolve_config_dir(
    xdg_config_home: Option<PathBuf>,
    home: Option<PathBuf>,
    app_data: Option<PathBuf>,
) -> Result<PathBuf, StoreError> {
    if let Some(xdg) = xdg_config_home {
        return Ok(xdg.join("cardwatch"));
    }
    if let Some(home) = home {
        return Ok(home.join(".config").join("cardwatch"));
    }
    if let Some(app_data) = app_data {
        return Ok(app_data.join("cardwatch"));
    }

    Err(StoreError::ConfigDirUnavailable)
}

fn load_or_create_key() -> Result<String, StoreError> {
    if let Some(from_env) = env::var_os("CARDWATCH_MASTER_KEY") {
        let key = from_env.to_string_lossy().trim().to_string();
        if !key.is_empty() {
            return Ok(key);
        }
    }

    let entry = safe_keyring_entry()?;

    match safe_keyring_get_password(&entry) {
        Ok(existing) if !existing.trim().is_empty() => Ok(existing),
        _ => {
            let generated = generate_key_material();
            safe_keyring_set_password(&entry, &generated)?;
            Ok(generated)
        }
    }
}

fn delete_keychain_key() -> Result<(), StoreError> {
    let entry = safe_keyring_entry()?;
    let _ = safe_keyring_delete_credential(&entry);
    Ok(())
}

fn safe_keyring_entry() -> Result<keyring::Entry, StoreError> {
    catch_unwind(|| keyring::Entry::new(KEYRING_SERVICE, KEYRING_ENTRY_NAME))
        .map_err(|_| StoreError::KeychainUnavailable)?
        .map_err(|_| StoreError::KeychainUnavailable)
}

fn safe_keyring_get_password(entry: &keyring::Entry) -> Result<String, StoreError> {
    catch_unwind(AssertUnwindSafe(|| entry.get_password()))
        .map_err(|_| StoreError::KeychainUnavailable)?
        .map_err(|_| StoreError::KeychainUnavailable)
}

fn safe_keyring_set_password(entry: &keyring::Entry, password: &str) -> Result<(), StoreError> {
    catch_unwind(AssertUnwindSafe(|| entry.set_password(password)))
        .map_err(|_| StoreError::KeychainUnavailable)?
        .map_err(|_| StoreError::KeychainUnavailable)
}

fn safe_keyring_delete_credential(entry: &keyring::Entry) -> Result<(), StoreError> {
    catch_unwind(AssertUnwindSafe(|| entry.delete_credential()))
        .map_err(|_| StoreError::KeychainUnavailable)?
        .map_err(|_| StoreError::KeychainUnavailable)
}

fn generate_key_material() -> String {
    let mut bytes = [0_u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

fn derive_key_bytes(key_material: &str) -> [u8; KEY_LEN] {
    let digest = Sha256::digest(key_material.as_bytes());
    let mut key = [0_u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

fn write_encrypted_payload(path: &Path, payload: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, payload)?;
    set_owner_only_permissions(path)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;

    let permissions = fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

fn encrypt_bytes(plaintext: &[u8], key_material: &str) -> Result<Vec<u8>, StoreError> {
    let key_bytes = derive_key_bytes(key_material);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));

    let mut nonce = [0_u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let nonce_ref = XNonce::from_slice(&nonce);

    let ciphertext = cipher
        .encrypt(nonce_ref, plaintext)
        .map_err(|_| StoreError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
    output.extend_from_slice(MAGIC);
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

fn decrypt_bytes(payload: &[u8], key_material: &str) -> Result<Vec<u8>, StoreError> {
    if payload.len() < MAGIC.len() + NONCE_LEN || &payload[..MAGIC.len()] != MAGIC {
        return Err(StoreError::InvalidPayload);
    }

    let key_bytes = derive_key_bytes(key_material);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    let nonce_start = MAGIC.len();
    let nonce_end = nonce_start + NONCE_LEN;
    let nonce = XNonce::from_slice(&payload[nonce_start..nonce_end]);
    let ciphertext = &payload[nonce_end..];

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| StoreError::DecryptionFailed)
}
