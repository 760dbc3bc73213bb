//! Signing key storage.
//!
//! The key file holds the hex-encoded Ed25519 seed on a single line and is
//! created with owner-only permissions on first start.

use attest_core::RecordSigner;
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::Write;
use std::path::{Path, PathBuf};

const DEFAULT_KEY_RELATIVE_PATH: &str = ".attest/daemon/signing.key";

pub fn default_key_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(DEFAULT_KEY_RELATIVE_PATH))
}

pub fn load_or_create_signing_key(path: &Path) -> Result<RecordSigner, String> {
    if path.exists() {
        let content = fs_err::read_to_string(path)
            .map_err(|err| format!("Failed to read signing key {}: {}", path.display(), err))?;
        return RecordSigner::from_hex(content.trim())
            .map_err(|err| format!("Invalid signing key {}: {}", path.display(), err));
    }

    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)
            .map_err(|err| format!("Failed to create key directory: {}", err))?;
    }

    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let signer = RecordSigner::from_seed(seed);
    write_private(path, &signer.seed_hex())?;
    tracing::info!(
        path = %path.display(),
        key_id = %signer.key_id(),
        "Generated new record signing key"
    );
    Ok(signer)
}

#[cfg(unix)]
fn write_private(path: &Path, content: &str) -> Result<(), String> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|err| format!("Failed to create signing key {}: {}", path.display(), err))?;
    writeln!(file, "{}", content)
        .map_err(|err| format!("Failed to write signing key {}: {}", path.display(), err))
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &str) -> Result<(), String> {
    let mut file = fs_err::File::create(path)
        .map_err(|err| format!("Failed to create signing key {}: {}", path.display(), err))?;
    writeln!(file, "{}", content)
        .map_err(|err| format!("Failed to write signing key {}: {}", path.display(), err))
}
