//! In-memory access credential storage
//!
//! Holds the single live access credential. The store can mirror the value to
//! a small JSON file so a restarted process resumes the session it had; the
//! mirror is best-effort and a failed mirror write never fails `set`/`clear`.
//!
//! The store does no coordination of its own. The refresh coordinator is the
//! only writer; everything else reads through `get()`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Opaque short-lived bearer token.
///
/// The token text is never inspected. `Debug` and `Display` are redacted so
/// the value cannot leak into logs, and the buffer is zeroized on drop.
pub struct AccessCredential(String);

impl AccessCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Expose the raw token (use sparingly)
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `Authorization` header value for this credential.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl Clone for AccessCredential {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl PartialEq for AccessCredential {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for AccessCredential {}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessCredential([REDACTED])")
    }
}

impl fmt::Display for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Drop for AccessCredential {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// On-disk mirror layout.
#[derive(Deserialize)]
struct MirrorFile {
    access_token: String,
}

/// Holder for the current access credential.
pub struct CredentialStore {
    mirror: Option<PathBuf>,
    current: RwLock<Option<AccessCredential>>,
}

impl CredentialStore {
    /// Store with no mirror; the credential lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            mirror: None,
            current: RwLock::new(None),
        }
    }

    /// Store mirrored to `path`.
    ///
    /// A credential found in an existing mirror file becomes the initial value.
    /// A missing or unreadable mirror starts the store empty.
    pub async fn with_mirror(path: PathBuf) -> Self {
        let initial = read_mirror(&path).await;
        info!(
            path = %path.display(),
            restored = initial.is_some(),
            "credential store initialized with mirror"
        );
        Self {
            mirror: Some(path),
            current: RwLock::new(initial),
        }
    }

    /// Current credential, if any.
    pub async fn get(&self) -> Option<AccessCredential> {
        self.current.read().await.clone()
    }

    /// Replace the current credential wholesale.
    pub async fn set(&self, credential: AccessCredential) {
        let mut current = self.current.write().await;
        if let Some(path) = &self.mirror {
            if let Err(e) = write_atomic(path, credential.expose()).await {
                warn!(path = %path.display(), error = %e, "failed to mirror access credential");
            }
        }
        *current = Some(credential);
        debug!("access credential updated");
    }

    /// Drop the current credential.
    pub async fn clear(&self) {
        let mut current = self.current.write().await;
        if let Some(path) = &self.mirror {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove credential mirror");
                }
            }
        }
        *current = None;
        debug!("access credential cleared");
    }

    /// Whether a credential is currently held.
    pub async fn is_empty(&self) -> bool {
        self.current.read().await.is_none()
    }
}

async fn read_mirror(path: &Path) -> Option<AccessCredential> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read credential mirror");
            return None;
        }
    };
    match serde_json::from_str::<MirrorFile>(&contents) {
        Ok(file) if !file.access_token.is_empty() => Some(AccessCredential::new(file.access_token)),
        Ok(_) => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unparsable credential mirror");
            None
        }
    }
}

/// Write the mirror file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Permissions are 0600 on unix since the file holds a token.
async fn write_atomic(path: &Path, token: &str) -> std::io::Result<()> {
    let json = serde_json::json!({ "access_token": token }).to_string();

    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "mirror path has no parent directory",
        )
    })?;
    let tmp_path = dir.join(format!(".session-mirror.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms).await?;
    }

    tokio::fs::rename(&tmp_path, path).await?;
    debug!(path = %path.display(), "mirrored access credential");
    Ok(())
}
