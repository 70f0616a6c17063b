//! Validation of media identifiers and containment within the media root.
//!
//! Dashboard requests name a recording as `YYYY-MM-DD/<file>`. Identifiers
//! are checked syntactically first; the resolved, symlink-free path must then
//! still lie under the media root.

use crate::error::{MediaError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

static DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid regex"));
static FILENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w.\-\[\]@]+$").expect("valid regex"));

/// Check a `YYYY-MM-DD` directory name.
pub fn validate_date(date: &str) -> Result<()> {
    if !DATE_RE.is_match(date) {
        return Err(MediaError::InvalidIdentifier(format!("bad date: {}", date)));
    }
    Ok(())
}

/// Check a single file name as uploaded by the camera.
pub fn validate_filename(filename: &str) -> Result<()> {
    if !FILENAME_RE.is_match(filename) || filename.starts_with('.') {
        return Err(MediaError::InvalidIdentifier(format!(
            "bad file name: {}",
            filename
        )));
    }
    Ok(())
}

/// A validated `date/filename` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaIdentifier {
    date: String,
    filename: String,
}

impl MediaIdentifier {
    pub fn new(date: &str, filename: &str) -> Result<Self> {
        validate_date(date)?;
        validate_filename(filename)?;
        Ok(Self {
            date: date.to_string(),
            filename: filename.to_string(),
        })
    }

    /// Parse `YYYY-MM-DD/<file>`.
    pub fn parse(relative: &str) -> Result<Self> {
        match relative.split_once('/') {
            Some((date, filename)) => Self::new(date, filename),
            None => Err(MediaError::InvalidIdentifier(relative.to_string())),
        }
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.date, self.filename)
    }
}

/// The read-only upload tree, resolved once at startup.
#[derive(Debug, Clone)]
pub struct MediaRoot {
    root: PathBuf,
}

impl MediaRoot {
    /// Open a media root; the directory must exist.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| match e.kind() {
            ErrorKind::NotFound => MediaError::SourceNotFound(root.display().to_string()),
            _ => MediaError::Io(e),
        })?;
        Ok(Self { root })
    }

    /// Canonical root path.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Lexical location of `relative` under the root, without touching disk.
    pub fn join(&self, relative: &str) -> Result<PathBuf> {
        let relative_path = Path::new(relative);
        if relative.is_empty() {
            return Err(MediaError::InvalidIdentifier("empty path".to_string()));
        }
        for component in relative_path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(MediaError::ContainmentViolation(relative.to_string()));
                }
            }
        }
        Ok(self.root.join(relative_path))
    }

    /// Resolve `relative` to an existing file that lies under the root.
    ///
    /// Symlinks are followed before the containment check, so a link that
    /// points outside the root is rejected like a `..` path.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let joined = self.join(relative)?;

        let canonical = joined.canonicalize().map_err(|e| match e.kind() {
            ErrorKind::NotFound => MediaError::SourceNotFound(relative.to_string()),
            _ => MediaError::Io(e),
        })?;

        if !canonical.starts_with(&self.root) {
            return Err(MediaError::ContainmentViolation(relative.to_string()));
        }
        if !canonical.is_file() {
            return Err(MediaError::SourceNotFound(relative.to_string()));
        }

        Ok(canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_with_file() -> (tempfile::TempDir, MediaRoot) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("media/2024-05-01")).unwrap();
        std::fs::write(dir.path().join("media/2024-05-01/clip.dav"), b"dav").unwrap();
        std::fs::write(dir.path().join("secret.dav"), b"secret").unwrap();
        let root = MediaRoot::new(dir.path().join("media")).unwrap();
        (dir, root)
    }

    #[test]
    fn test_identifier_validation() {
        assert!(MediaIdentifier::new("2024-05-01", "12.00.00-12.05.00[M][0@0][0].dav").is_ok());
        assert!(MediaIdentifier::new("2024-5-1", "clip.dav").is_err());
        assert!(MediaIdentifier::new("2024-05-01", "../clip.dav").is_err());
        assert!(MediaIdentifier::new("2024-05-01", "..").is_err());
        assert!(MediaIdentifier::new("2024-05-01", "a/b.dav").is_err());
        assert!(MediaIdentifier::new("2024-05-01", "clip dav").is_err());
    }

    #[test]
    fn test_parse_identifier() {
        let id = MediaIdentifier::parse("2024-05-01/clip.dav").unwrap();
        assert_eq!(id.date(), "2024-05-01");
        assert_eq!(id.filename(), "clip.dav");
        assert_eq!(id.relative_path(), "2024-05-01/clip.dav");
        assert!(matches!(
            MediaIdentifier::parse("clip.dav"),
            Err(MediaError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_resolve_inside_root() {
        let (_dir, root) = root_with_file();
        let path = root.resolve("2024-05-01/clip.dav").unwrap();
        assert!(path.starts_with(root.path()));
        assert!(path.is_file());
    }

    #[test]
    fn test_parent_traversal_rejected() {
        let (_dir, root) = root_with_file();
        assert!(matches!(
            root.resolve("../secret.dav"),
            Err(MediaError::ContainmentViolation(_))
        ));
        assert!(matches!(
            root.resolve("2024-05-01/../../secret.dav"),
            Err(MediaError::ContainmentViolation(_))
        ));
    }

    #[test]
    fn test_absolute_path_rejected() {
        let (dir, root) = root_with_file();
        let absolute = dir.path().join("secret.dav").display().to_string();
        assert!(matches!(
            root.resolve(&absolute),
            Err(MediaError::ContainmentViolation(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let (dir, root) = root_with_file();
        std::os::unix::fs::symlink(
            dir.path().join("secret.dav"),
            dir.path().join("media/2024-05-01/link.dav"),
        )
        .unwrap();
        assert!(matches!(
            root.resolve("2024-05-01/link.dav"),
            Err(MediaError::ContainmentViolation(_))
        ));
    }

    #[test]
    fn test_missing_source() {
        let (_dir, root) = root_with_file();
        assert!(matches!(
            root.resolve("2024-05-01/missing.dav"),
            Err(MediaError::SourceNotFound(_))
        ));
        assert!(matches!(
            root.resolve("2024-05-01"),
            Err(MediaError::SourceNotFound(_))
        ));
    }
}
