//! Atomic on-disk persistence of index artifacts.
//!
//! Each artifact lives in `<root>/<name>/` as `nodes.json`, `docstore.json` and `manifest.json`.
//! A write goes to a sibling staging directory first, with the manifest written last; the live
//! directory is then swapped out by two renames. Readers therefore see either the previous
//! complete artifact or the new one.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::artifact::{IndexArtifact, Manifest};
use super::types::{DocRef, IndexError, IndexName, Node};

/// Node list file.
pub const NODES_FILE: &str = "nodes.json";
/// Document reference map file.
pub const DOCSTORE_FILE: &str = "docstore.json";
/// Commit marker, written last.
pub const MANIFEST_FILE: &str = "manifest.json";

const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";

/// Directory holding the artifact `name`.
pub fn artifact_dir(root: &Path, name: &IndexName) -> PathBuf {
    root.join(name.as_str())
}

/// Write `artifact` under `root`, replacing any committed version atomically.
pub async fn persist(root: &Path, artifact: &IndexArtifact) -> Result<(), IndexError> {
    let name = artifact.name();
    fs::create_dir_all(root).await?;

    let staging = root.join(format!("{STAGING_PREFIX}{name}-{}", Uuid::new_v4()));
    if let Err(error) = write_staging(&staging, artifact).await {
        remove_dir_quietly(&staging).await;
        return Err(error);
    }

    let live = artifact_dir(root, name);
    let retired = root.join(format!("{RETIRED_PREFIX}{name}-{}", Uuid::new_v4()));
    let had_live = match fs::rename(&live, &retired).await {
        Ok(()) => true,
        Err(error) if error.kind() == ErrorKind::NotFound => false,
        Err(error) => {
            remove_dir_quietly(&staging).await;
            return Err(error.into());
        }
    };

    if let Err(error) = fs::rename(&staging, &live).await {
        if had_live && let Err(restore) = fs::rename(&retired, &live).await {
            tracing::error!(index = %name, error = %restore, "Failed to restore previous index");
        }
        remove_dir_quietly(&staging).await;
        return Err(error.into());
    }
    sync_dir(root).await;

    if had_live {
        remove_dir_quietly(&retired).await;
    }
    tracing::debug!(index = %name, path = %live.display(), "Persisted index");
    Ok(())
}

async fn write_staging(staging: &Path, artifact: &IndexArtifact) -> Result<(), IndexError> {
    fs::create_dir_all(staging).await?;
    write_json(&staging.join(NODES_FILE), &artifact.nodes).await?;
    write_json(&staging.join(DOCSTORE_FILE), &artifact.doc_refs).await?;
    write_json(&staging.join(MANIFEST_FILE), &artifact.manifest).await?;
    sync_dir(staging).await;
    Ok(())
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), IndexError> {
    let bytes = serde_json::to_vec(value)?;
    let mut file = fs::File::create(path).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Best effort; not every platform lets a directory be opened for syncing.
async fn sync_dir(path: &Path) {
    if let Ok(dir) = fs::File::open(path).await {
        let _ = dir.sync_all().await;
    }
}

/// Repair leftovers of an interrupted [`persist`] for `name`.
///
/// A committed retired directory is put back when the live one is missing; stale staging and
/// retired directories are removed.
pub async fn recover(root: &Path, name: &IndexName) -> Result<(), IndexError> {
    let (staged, mut retired) = leftovers(root, name).await?;
    for path in staged {
        tracing::warn!(index = %name, path = %path.display(), "Removing interrupted index write");
        remove_dir_quietly(&path).await;
    }

    let live = artifact_dir(root, name);
    if !fs::try_exists(&live).await? {
        let mut restorable = None;
        for (idx, path) in retired.iter().enumerate() {
            if fs::try_exists(path.join(MANIFEST_FILE)).await? {
                restorable = Some(idx);
                break;
            }
        }
        if let Some(idx) = restorable {
            let previous = retired.swap_remove(idx);
            tracing::warn!(index = %name, "Restoring index retired by an interrupted write");
            fs::rename(&previous, &live).await?;
        }
    }
    for path in retired {
        remove_dir_quietly(&path).await;
    }
    Ok(())
}

/// Staging and retired directories left behind for `name`.
async fn leftovers(
    root: &Path,
    name: &IndexName,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>), IndexError> {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok((Vec::new(), Vec::new())),
        Err(error) => return Err(error.into()),
    };

    let staging_prefix = format!("{STAGING_PREFIX}{name}-");
    let retired_prefix = format!("{RETIRED_PREFIX}{name}-");
    let mut staged = Vec::new();
    let mut retired = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if is_leftover(file_name, &staging_prefix) {
            staged.push(entry.path());
        } else if is_leftover(file_name, &retired_prefix) {
            retired.push(entry.path());
        }
    }
    Ok((staged, retired))
}

/// Leftover names are `<prefix><uuid>`; the uuid suffix keeps `a` from matching `a-b` leftovers.
fn is_leftover(file_name: &str, prefix: &str) -> bool {
    file_name
        .strip_prefix(prefix)
        .is_some_and(|suffix| Uuid::parse_str(suffix).is_ok())
}

/// Load the committed artifact `name`.
///
/// `Ok(None)` means nothing is committed. A committed artifact that cannot be read or fails
/// validation is an [`IndexError::Load`].
pub async fn load(root: &Path, name: &IndexName) -> Result<Option<IndexArtifact>, IndexError> {
    let dir = artifact_dir(root, name);
    let manifest_path = dir.join(MANIFEST_FILE);
    if !fs::try_exists(&manifest_path).await? {
        return Ok(None);
    }

    let load_error = |reason: String| IndexError::Load {
        name: name.to_string(),
        reason,
    };
    let manifest: Manifest = read_json(&manifest_path).await.map_err(load_error)?;
    let nodes: Vec<Node> = read_json(&dir.join(NODES_FILE)).await.map_err(load_error)?;
    let doc_refs: BTreeMap<String, DocRef> = read_json(&dir.join(DOCSTORE_FILE))
        .await
        .map_err(load_error)?;

    let artifact = IndexArtifact {
        name: name.clone(),
        path: dir,
        manifest,
        nodes,
        doc_refs,
    };
    artifact.validate().map_err(load_error)?;
    Ok(Some(artifact))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let bytes = fs::read(path)
        .await
        .map_err(|error| format!("{}: {error}", path.display()))?;
    serde_json::from_slice(&bytes).map_err(|error| format!("{}: {error}", path.display()))
}

/// Delete the artifact `name` with any leftovers of interrupted writes.
///
/// Missing directories are not an error; the return value tells whether a committed artifact
/// was removed.
pub async fn remove(root: &Path, name: &IndexName) -> Result<bool, IndexError> {
    let removed = match fs::remove_dir_all(artifact_dir(root, name)).await {
        Ok(()) => true,
        Err(error) if error.kind() == ErrorKind::NotFound => false,
        Err(error) => return Err(error.into()),
    };
    let (staged, retired) = leftovers(root, name).await?;
    for path in staged.into_iter().chain(retired) {
        fs::remove_dir_all(&path).await?;
    }
    Ok(removed)
}

/// Delete everything under `root`, leaving the root itself in place.
pub async fn remove_all(root: &Path) -> Result<usize, IndexError> {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(root).await?;
            return Ok(0);
        }
        Err(error) => return Err(error.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        removed += 1;
    }
    Ok(removed)
}

async fn remove_dir_quietly(path: &Path) {
    if let Err(error) = fs::remove_dir_all(path).await
        && error.kind() != ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %error, "Failed to remove directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::IndexKind;
    use tempfile::TempDir;

    fn sample(root: &Path) -> IndexArtifact {
        let name = IndexName::summary();
        let mut artifact =
            IndexArtifact::empty(name.clone(), artifact_dir(root, &name), IndexKind::Summary, None);
        artifact.nodes.push(Node {
            id: "n1".into(),
            doc_id: "a".into(),
            text: "hello".into(),
            embedding: None,
            metadata: BTreeMap::new(),
        });
        artifact.doc_refs.insert(
            "a".into(),
            DocRef {
                content_hash: "h".into(),
                node_ids: vec!["n1".into()],
            },
        );
        artifact.manifest.node_count = 1;
        artifact.manifest.document_count = 1;
        artifact
    }

    #[tokio::test]
    async fn persist_then_load() {
        let dir = TempDir::new().expect("tempdir");
        let artifact = sample(dir.path());
        persist(dir.path(), &artifact).await.expect("persist");

        let loaded = load(dir.path(), artifact.name())
            .await
            .expect("load")
            .expect("artifact present");
        assert_eq!(loaded.nodes(), artifact.nodes());
        assert_eq!(loaded.manifest(), artifact.manifest());
        assert!(loaded.contains_document("a"));
    }

    #[tokio::test]
    async fn persist_replaces_previous_version_without_leftovers() {
        let dir = TempDir::new().expect("tempdir");
        let mut artifact = sample(dir.path());
        persist(dir.path(), &artifact).await.expect("first persist");

        artifact.nodes[0].text = "updated".into();
        persist(dir.path(), &artifact).await.expect("second persist");

        let loaded = load(dir.path(), artifact.name()).await.expect("load").expect("present");
        assert_eq!(loaded.nodes()[0].text, "updated");

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .expect("read root")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![IndexName::SUMMARY.to_string()]);
    }

    #[tokio::test]
    async fn missing_manifest_means_absent() {
        let dir = TempDir::new().expect("tempdir");
        let name = IndexName::vector();
        std::fs::create_dir_all(artifact_dir(dir.path(), &name)).expect("mkdir");
        std::fs::write(artifact_dir(dir.path(), &name).join(NODES_FILE), "[]").expect("write");

        assert!(load(dir.path(), &name).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn corrupt_files_are_load_errors() {
        let dir = TempDir::new().expect("tempdir");
        let artifact = sample(dir.path());
        persist(dir.path(), &artifact).await.expect("persist");
        std::fs::write(artifact.path().join(NODES_FILE), "{ not json").expect("corrupt");

        let error = load(dir.path(), artifact.name()).await.expect_err("corrupt nodes");
        assert!(matches!(error, IndexError::Load { .. }));
    }

    #[tokio::test]
    async fn recover_restores_retired_and_drops_staging() {
        let dir = TempDir::new().expect("tempdir");
        let artifact = sample(dir.path());
        persist(dir.path(), &artifact).await.expect("persist");

        let name = artifact.name();
        let retired = dir.path().join(format!("{RETIRED_PREFIX}{name}-{}", Uuid::new_v4()));
        let staging = dir.path().join(format!("{STAGING_PREFIX}{name}-{}", Uuid::new_v4()));
        std::fs::rename(artifact.path(), &retired).expect("retire");
        std::fs::create_dir_all(&staging).expect("staging");
        std::fs::write(staging.join(NODES_FILE), "[]").expect("partial write");

        recover(dir.path(), name).await.expect("recover");

        assert!(!staging.exists());
        assert!(!retired.exists());
        let loaded = load(dir.path(), name).await.expect("load").expect("restored");
        assert_eq!(loaded.nodes(), artifact.nodes());
    }

    #[tokio::test]
    async fn recover_ignores_other_indexes() {
        let dir = TempDir::new().expect("tempdir");
        let other = dir
            .path()
            .join(format!("{STAGING_PREFIX}summary_index-extra-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&other).expect("mkdir");

        recover(dir.path(), &IndexName::summary()).await.expect("recover");
        assert!(other.exists());
    }

    #[tokio::test]
    async fn remove_clears_leftovers_and_tolerates_absence() {
        let dir = TempDir::new().expect("tempdir");
        let artifact = sample(dir.path());
        persist(dir.path(), &artifact).await.expect("persist");
        let staging = dir
            .path()
            .join(format!("{STAGING_PREFIX}{}-{}", artifact.name(), Uuid::new_v4()));
        std::fs::create_dir_all(&staging).expect("staging");

        assert!(remove(dir.path(), artifact.name()).await.expect("remove"));
        assert!(!artifact.path().exists());
        assert!(!staging.exists());
        assert!(!remove(dir.path(), artifact.name()).await.expect("second remove"));
    }

    #[tokio::test]
    async fn remove_all_keeps_root() {
        let dir = TempDir::new().expect("tempdir");
        persist(dir.path(), &sample(dir.path())).await.expect("persist");
        std::fs::write(dir.path().join("stray.txt"), "x").expect("write");

        assert_eq!(remove_all(dir.path()).await.expect("clear"), 2);
        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).expect("read").count(), 0);
    }
}
