//! Relayer keypair loading (spec §6 "Relayer keypair file"): an opaque
//! secret provider read from a filesystem path, never from process-wide
//! global state.

use std::path::{Path, PathBuf};

use solana_sdk::signature::{read_keypair_file, Keypair};
use thiserror::Error;
use tracing::warn;

/// Path segment under a deployment root where the relayer's ed25519 secret
/// key is stored, as a JSON array of 64 bytes.
pub const RELAYER_KEYPAIR_SUBPATH: &str = "relayer/solana.json";

#[derive(Debug, Error)]
pub enum KeypairError {
    #[error("failed to read keypair file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Joins a deployment root with the standard relayer keypair subpath.
#[must_use]
pub fn relayer_keypair_path(root: &Path) -> PathBuf {
    root.join(RELAYER_KEYPAIR_SUBPATH)
}

/// Loads the relayer's ed25519 keypair from `<root>/relayer/solana.json`.
///
/// Warns (does not fail) if the file's permissions are more permissive than
/// `0600` on unix platforms — the secret should not be group/world readable.
pub fn load_relayer_keypair(root: &Path) -> Result<Keypair, KeypairError> {
    let path = relayer_keypair_path(root);
    warn_if_too_permissive(&path);
    read_keypair_file(&path).map_err(|error| KeypairError::Read {
        path: path.clone(),
        source: anyhow::anyhow!("{error}"),
    })
}

#[cfg(unix)]
fn warn_if_too_permissive(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode() & 0o777;
    if mode != 0o600 {
        warn!(
            path = %path.display(),
            mode = format!("{mode:o}"),
            "relayer keypair file permissions are not 0600"
        );
    }
}

#[cfg(not(unix))]
fn warn_if_too_permissive(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_standard_subpath() {
        let root = Path::new("/var/lib/relayer-root");
        assert_eq!(
            relayer_keypair_path(root),
            PathBuf::from("/var/lib/relayer-root/relayer/solana.json")
        );
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let root = Path::new("/nonexistent-root-for-test");
        let result = load_relayer_keypair(root);
        assert!(matches!(result, Err(KeypairError::Read { .. })));
    }
}
