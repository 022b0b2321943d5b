//! Blob provider: a read-only, path-addressed byte store the boot protocol
//! pulls `bootcode.bin` and stage-2 file requests from.

use crate::identity::Family;
use std::path::{Component, Path, PathBuf};

/// The outcome of a blob lookup. Missing files are a normal condition, not
/// an error -- callers translate `Absent` into a zero-size response on the
/// wire rather than propagating a `Result::Err`.
pub enum BlobLookup {
    Found(Vec<u8>),
    Absent,
}

/// Contract for resolving a `(family, filename)` pair to bytes.
///
/// Implemented as a trait so tests can substitute an in-memory double for
/// the filesystem-backed implementation below.
pub trait BlobProvider: Send + Sync {
    fn read_blob(&self, family: Family, filename: &str) -> BlobLookup;
}

/// Resolves blobs under `<root>/<family-subdir>/<filename>` on disk.
pub struct FilesystemBlobProvider {
    root: PathBuf,
}

impl FilesystemBlobProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Builds the on-disk path for a blob, rejecting path traversal. The
    /// filename arrives over the wire from the device, so components like
    /// `..` must not be allowed to escape the family subdirectory.
    fn resolve(&self, family: Family, filename: &str) -> Option<PathBuf> {
        let mut path = self.root.join(family.blob_subdir());
        for part in Path::new(filename).components() {
            match part {
                Component::Normal(segment) => path.push(segment),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }
}

impl BlobProvider for FilesystemBlobProvider {
    fn read_blob(&self, family: Family, filename: &str) -> BlobLookup {
        let Some(path) = self.resolve(family, filename) else {
            return BlobLookup::Absent;
        };
        match std::fs::read(&path) {
            Ok(bytes) => BlobLookup::Found(bytes),
            Err(_) => BlobLookup::Absent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn reads_existing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let subdir = dir.path().join("raspberrypi");
        fs::create_dir_all(&subdir).unwrap();
        fs::write(subdir.join("bootcode.bin"), b"hello").unwrap();

        let provider = FilesystemBlobProvider::new(dir.path());
        match provider.read_blob(Family::Cm3Like, "bootcode.bin") {
            BlobLookup::Found(bytes) => assert_eq!(bytes, b"hello"),
            BlobLookup::Absent => panic!("expected blob to be found"),
        }
    }

    #[test]
    fn missing_blob_is_absent_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FilesystemBlobProvider::new(dir.path());
        assert!(matches!(
            provider.read_blob(Family::Cm4, "nope.bin"),
            BlobLookup::Absent
        ));
    }

    #[test]
    fn nested_filename_resolves_under_family_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("cm4").join("overlays");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("foo.dtbo"), b"overlay").unwrap();

        let provider = FilesystemBlobProvider::new(dir.path());
        match provider.read_blob(Family::Cm4, "overlays/foo.dtbo") {
            BlobLookup::Found(bytes) => assert_eq!(bytes, b"overlay"),
            BlobLookup::Absent => panic!("expected nested blob to be found"),
        }
    }

    #[test]
    fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("secret"), b"nope").unwrap();
        let provider = FilesystemBlobProvider::new(dir.path());
        assert!(matches!(
            provider.read_blob(Family::Cm3Like, "../secret"),
            BlobLookup::Absent
        ));
    }
}
