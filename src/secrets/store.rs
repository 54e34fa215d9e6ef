//! File-backed secret storage.

use crate::error::{FeedError, Result};
use crate::types::Hash;
use rand::RngCore;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for secret files.
const SECRET_MAGIC: &[u8; 4] = b"SEC\0";

/// Current secret format version.
const SECRET_VERSION: u8 = 2;

/// Sanity bounds on the stored fields.
const MAX_NAME_LEN: usize = 64 * 1024;
const MAX_SECRET_LEN: usize = 4096;

/// Length of generated secrets.
pub const SECRET_LEN: usize = 20;

/// Durable store of named secrets. The only authority on secret values.
pub struct SecretStore {
    path: PathBuf,
}

impl SecretStore {
    /// Open (creating if needed) a secret directory.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    /// Read a secret, if one has been created.
    pub fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let secret_path = self.secret_path(name);
        match File::open(&secret_path) {
            Ok(file) => read_secret(file, name).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Return the named secret, generating it on first use.
    ///
    /// Concurrent callers (in this process or another) all get the same
    /// value: the secret file is published with a hard link, which fails if
    /// a competing writer got there first.
    pub fn get_or_create(&self, name: &str) -> Result<Vec<u8>> {
        if let Some(secret) = self.get(name)? {
            return Ok(secret);
        }

        let mut secret = vec![0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);

        let temp_path = self
            .path
            .join(format!(".{}.{:016x}.tmp", file_name(name), rand::random::<u64>()));
        write_secret(&temp_path, name, &secret)?;

        let published = fs::hard_link(&temp_path, self.secret_path(name));
        let _ = fs::remove_file(&temp_path);

        match published {
            Ok(()) => {
                tracing::info!(secret = name, "generated secret");
                Ok(secret)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!(secret = name, "lost secret creation race");
                self.get(name)?
                    .ok_or_else(|| FeedError::Corruption(format!("secret {name} vanished")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn secret_path(&self, name: &str) -> PathBuf {
        self.path.join(file_name(name))
    }
}

/// Fixed-length file name for a secret; names themselves may be long URLs.
fn file_name(name: &str) -> String {
    Hash::from_bytes(name.as_bytes()).to_hex()
}

fn checksum(name: &[u8], secret: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(name);
    hasher.update(secret);
    hasher.finalize()
}

fn write_secret(path: &Path, name: &str, secret: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;

    file.write_all(SECRET_MAGIC)?;
    file.write_all(&[SECRET_VERSION])?;
    file.write_all(&(name.len() as u32).to_le_bytes())?;
    file.write_all(name.as_bytes())?;
    file.write_all(&(secret.len() as u32).to_le_bytes())?;
    file.write_all(secret)?;
    file.write_all(&checksum(name.as_bytes(), secret).to_le_bytes())?;
    file.sync_all()?;

    Ok(())
}

fn read_secret(mut file: File, expected_name: &str) -> Result<Vec<u8>> {
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != SECRET_MAGIC {
        return Err(FeedError::InvalidFormat("Invalid secret magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != SECRET_VERSION {
        return Err(FeedError::InvalidFormat(format!(
            "Unsupported secret version: {}",
            version[0]
        )));
    }

    let name = read_field(&mut file, MAX_NAME_LEN)?;
    let secret = read_field(&mut file, MAX_SECRET_LEN)?;

    let mut checksum_bytes = [0u8; 4];
    file.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = checksum(&name, &secret);
    if stored != computed {
        return Err(FeedError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    if name != expected_name.as_bytes() {
        return Err(FeedError::Corruption(format!(
            "secret file for {expected_name} holds {}",
            String::from_utf8_lossy(&name)
        )));
    }

    Ok(secret)
}

fn read_field(file: &mut File, max_len: usize) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > max_len {
        return Err(FeedError::Corruption(format!("secret field length {len}")));
    }

    let mut field = vec![0u8; len];
    file.read_exact(&mut field)?;
    Ok(field)
}
