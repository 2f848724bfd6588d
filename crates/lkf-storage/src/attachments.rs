use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Where an attachment ended up, relative to and inside the store root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    /// `false` when identical bytes were already on disk for the same listing.
    pub newly_written: bool,
}

/// Content-addressed directory of listing attachments (thumbnails, floor plans).
///
/// Layout: `<root>/<listing id>/<sha256>.<ext>`.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn path_for(&self, listing_id: &str, sha256: &str, extension: &str) -> PathBuf {
        let extension = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        Path::new(&listing_dir_name(listing_id)).join(format!("{sha256}.{extension}"))
    }

    /// Writes `bytes` once per listing and content. The file appears atomically: a reader
    /// never sees a partial attachment.
    pub async fn put(
        &self,
        listing_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredAttachment> {
        let sha256 = Self::content_hash(bytes);
        let relative_path = self.path_for(listing_id, &sha256, extension);
        let absolute_path = self.root.join(&relative_path);
        let dir = self.root.join(listing_dir_name(listing_id));

        let mut stored = StoredAttachment {
            sha256,
            relative_path,
            absolute_path,
            newly_written: false,
        };
        if fs::try_exists(&stored.absolute_path).await.unwrap_or(false) {
            debug!(path = %stored.relative_path.display(), "attachment already stored");
            return Ok(stored);
        }

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let partial = dir.join(format!(".{}.partial", Uuid::new_v4()));
        write_fully(&partial, bytes).await?;

        match fs::rename(&partial, &stored.absolute_path).await {
            Ok(()) => {
                stored.newly_written = true;
                Ok(stored)
            }
            Err(err) => {
                let _ = fs::remove_file(&partial).await;
                if err.kind() == ErrorKind::AlreadyExists {
                    Ok(stored)
                } else {
                    Err(err).with_context(|| {
                        format!("moving attachment into {}", stored.absolute_path.display())
                    })
                }
            }
        }
    }
}

async fn write_fully(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", path.display()))?;
    Ok(())
}

/// Listing ids become one directory name; anything outside `[A-Za-z0-9_-]` is replaced.
fn listing_dir_name(listing_id: &str) -> String {
    let name: String = listing_id
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    if name.is_empty() {
        "_".into()
    } else {
        name
    }
}
