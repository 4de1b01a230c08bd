//! Encrypted on-disk credential storage.
//!
//! Credentials live in a single AES-256-GCM-encrypted JSON file under the
//! user's config directory: a 12-byte random nonce followed by ciphertext
//! and the 16-byte authentication tag, file mode 0600, written atomically
//! via temp file + rename. The plaintext is
//! `{ "version": 1, "credentials": { key -> credential } }`.
//!
//! The master key comes from `MCP_BRIDGE_MASTER_KEY` (64 hex characters)
//! when set; otherwise a generated key is persisted next to the store. The
//! decoded key material is hashed with SHA-256 to derive the cipher key. A
//! store whose key has gone missing is an error, never a trigger to mint a
//! fresh key over existing data.
//!
//! The store is read-modify-write per operation and is not safe against
//! concurrent external mutation of the file.

use aes_gcm::aead::{Aead as _, KeyInit as _};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

/// Environment variable overriding the master key (64 hex characters).
pub const MASTER_KEY_ENV: &str = "MCP_BRIDGE_MASTER_KEY";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CredentialStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid master key: {0}")]
    InvalidKey(String),

    /// Wrong master key or corrupt store data. Never auto-recovered.
    #[error("cannot decrypt credential store (wrong master key or corrupt data)")]
    Decrypt,

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("unsupported credential store version {0}")]
    UnsupportedVersion(u32),
}

pub type Result<T> = std::result::Result<T, CredentialStoreError>;

/// A stored credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credential {
    Bearer {
        token: String,
    },
    /// OAuth2 client configuration, stored as-is for the upstream to
    /// consume; the bridge itself never runs an OAuth flow.
    Oauth2 {
        #[serde(flatten)]
        config: serde_json::Map<String, serde_json::Value>,
    },
}

impl Credential {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bearer { .. } => "bearer",
            Self::Oauth2 { .. } => "oauth2",
        }
    }
}

/// Listing entry: key and credential kind, never the secret.
#[derive(Debug, Clone)]
pub struct CredentialSummary {
    pub key: String,
    pub kind: &'static str,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    credentials: BTreeMap<String, Credential>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            credentials: BTreeMap::new(),
        }
    }
}

pub struct CredentialStore {
    path: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

impl CredentialStore {
    /// `<config dir>/crabeye/credentials.enc`.
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| {
            CredentialStoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no user config directory",
            ))
        })?;
        Ok(base.join("crabeye").join("credentials.enc"))
    }

    pub fn open_default() -> Result<Self> {
        Self::open(&Self::default_path()?)
    }

    /// Open a store at `path`, resolving the master key from the
    /// environment or the key file next to the store.
    pub fn open(path: &Path) -> Result<Self> {
        match std::env::var(MASTER_KEY_ENV) {
            Ok(hex_key) => Self::open_with_key(path, hex_key.trim()),
            Err(_) => {
                let key = load_or_create_key(&key_file_path(path), path)?;
                Ok(Self {
                    path: path.to_path_buf(),
                    key,
                })
            }
        }
    }

    /// Open with an explicit master key (64 hex characters). No key file
    /// is read or written.
    pub fn open_with_key(path: &Path, hex_key: &str) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            key: parse_master_key(hex_key)?,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Result<Option<Credential>> {
        Ok(self.load()?.credentials.get(key).cloned())
    }

    pub fn set(&self, key: &str, credential: Credential) -> Result<()> {
        let mut store = self.load()?;
        store.credentials.insert(key.to_string(), credential);
        self.save(&store)
    }

    /// Returns whether a credential was actually removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let mut store = self.load()?;
        let removed = store.credentials.remove(key).is_some();
        if removed {
            self.save(&store)?;
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<CredentialSummary>> {
        Ok(self
            .load()?
            .credentials
            .iter()
            .map(|(key, credential)| CredentialSummary {
                key: key.clone(),
                kind: credential.kind(),
            })
            .collect())
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key[..])
            .map_err(|e| CredentialStoreError::Encrypt(e.to_string()))
    }

    fn load(&self) -> Result<StoreFile> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreFile::default());
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CredentialStoreError::Decrypt);
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CredentialStoreError::Decrypt)?;

        let store: StoreFile = serde_json::from_slice(&plaintext)?;
        if store.version != STORE_VERSION {
            return Err(CredentialStoreError::UnsupportedVersion(store.version));
        }
        Ok(store)
    }

    fn save(&self, store: &StoreFile) -> Result<()> {
        let plaintext = serde_json::to_vec(store)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill(&mut nonce_bytes);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|e| CredentialStoreError::Encrypt(format!("{e:?}")))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        write_atomically(&self.path, &combined)
    }
}

fn key_file_path(store_path: &Path) -> PathBuf {
    store_path.with_extension("key")
}

/// Validate the 64-hex master key and derive the cipher key from it.
fn parse_master_key(hex_key: &str) -> Result<Zeroizing<[u8; 32]>> {
    if hex_key.len() != 64 {
        return Err(CredentialStoreError::InvalidKey(
            "master key must be 64 hex characters".into(),
        ));
    }
    let material = Zeroizing::new(
        hex::decode(hex_key)
            .map_err(|_| CredentialStoreError::InvalidKey("master key is not valid hex".into()))?,
    );
    let derived = Sha256::digest(material.as_slice());
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&derived);
    Ok(key)
}

fn load_or_create_key(key_path: &Path, store_path: &Path) -> Result<Zeroizing<[u8; 32]>> {
    match std::fs::read_to_string(key_path) {
        Ok(contents) => parse_master_key(contents.trim()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if store_path.exists() {
                // The data exists but its key does not. Generating a new
                // key would silently orphan every stored credential.
                return Err(CredentialStoreError::InvalidKey(format!(
                    "credential store {} exists but its key file {} is missing",
                    store_path.display(),
                    key_path.display()
                )));
            }
            let mut material = Zeroizing::new([0u8; 32]);
            rand::rng().fill(&mut *material);
            let encoded = Zeroizing::new(hex::encode(&material[..]));
            write_atomically(key_path, encoded.as_bytes())?;
            parse_master_key(&encoded)
        }
        Err(e) => Err(e.into()),
    }
}

/// Write via temp file + rename, mode 0600.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        CredentialStoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "store path has no parent directory",
        ))
    })?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
