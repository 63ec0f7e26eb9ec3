//! Loading plain-text documents from the filesystem.

use crate::index::Document;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// File extensions read as documents.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md", "markdown"];

/// Errors raised while collecting documents.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The given path does not exist.
    #[error("document path not found: {0}")]
    NotFound(PathBuf),
    /// Directory traversal failed.
    #[error("failed to walk {path}: {source}")]
    Walk {
        /// Directory being walked.
        path: PathBuf,
        /// Underlying traversal error.
        #[source]
        source: walkdir::Error,
    },
    /// A file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Load every supported file under `paths`, using the file path as document identity.
///
/// Directories are walked recursively in a stable order. Files that are not valid UTF-8 are
/// skipped with a warning; explicitly named files are read regardless of extension.
pub fn load_documents<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Document>, DocumentError> {
    let mut documents = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if path.is_file() {
            if let Some(document) = read_document(path)? {
                documents.push(document);
            }
            continue;
        }
        if !path.is_dir() {
            return Err(DocumentError::NotFound(path.to_path_buf()));
        }
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|source| DocumentError::Walk {
                path: path.to_path_buf(),
                source,
            })?;
            if entry.file_type().is_file()
                && is_supported(entry.path())
                && let Some(document) = read_document(entry.path())?
            {
                documents.push(document);
            }
        }
    }
    tracing::debug!(count = documents.len(), "Loaded documents");
    Ok(documents)
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| supported.eq_ignore_ascii_case(ext))
        })
}

fn read_document(path: &Path) -> Result<Option<Document>, DocumentError> {
    let bytes = std::fs::read(path).map_err(|source| DocumentError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let Ok(text) = String::from_utf8(bytes) else {
        tracing::warn!(path = %path.display(), "Skipping file that is not valid UTF-8");
        return Ok(None);
    };

    let file_path = path.display().to_string();
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.clone());
    Ok(Some(
        Document::new(file_path.clone(), text)
            .with_metadata("file_name", file_name)
            .with_metadata("file_path", file_path),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn walks_directories_for_supported_files() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("nested")).expect("mkdir");
        std::fs::write(dir.path().join("b.txt"), "bravo").expect("write");
        std::fs::write(dir.path().join("nested/a.md"), "# alpha").expect("write");
        std::fs::write(dir.path().join("image.png"), [0u8, 159, 146, 150]).expect("write");

        let documents = load_documents(&[dir.path()]).expect("load");
        let names: Vec<&str> = documents
            .iter()
            .map(|doc| doc.metadata["file_name"].as_str())
            .collect();
        assert_eq!(names, vec!["b.txt", "a.md"]);
        assert_eq!(documents[0].id, dir.path().join("b.txt").display().to_string());
        assert_eq!(documents[0].text, "bravo");
    }

    #[test]
    fn explicit_files_skip_invalid_utf8() {
        let dir = TempDir::new().expect("tempdir");
        let binary = dir.path().join("blob.txt");
        std::fs::write(&binary, [0xffu8, 0xfe, 0xfd]).expect("write");

        assert!(load_documents(&[&binary]).expect("load").is_empty());
    }

    #[test]
    fn missing_paths_are_errors() {
        let dir = TempDir::new().expect("tempdir");
        let missing = dir.path().join("missing");
        assert!(matches!(
            load_documents(&[missing]),
            Err(DocumentError::NotFound(_))
        ));
    }
}
