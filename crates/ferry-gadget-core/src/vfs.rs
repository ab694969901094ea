use crate::heap::ObjectStat;
use crate::{Error, Result};
use ferry_proto::ResponseCode;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, warn};

/// Upper bound on exposed storages, from the PTP storage-id space.
pub const MAX_STORAGES: usize = 255;

/// One configured storage root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsEntry {
    pub display_name: String,
    pub root_path: PathBuf,
    pub writable: bool,
}

/// A mounted storage with its assigned PTP storage id.
#[derive(Clone, Debug)]
pub struct Storage {
    pub id: u32,
    pub display_name: String,
    pub root: PathBuf,
    pub writable: bool,
}

/// Directory listing element.
#[derive(Clone, Debug)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

/// Uniform async view over the configured storage roots.
///
/// Storage ids are assigned in declaration order starting at 1; the first
/// entry is the default storage. All paths handed in are storage-relative
/// and must not escape the root.
pub struct FilesystemProxy {
    storages: Vec<Storage>,
}

impl FilesystemProxy {
    pub fn new(entries: Vec<FsEntry>) -> Result<Self> {
        if entries.is_empty() || entries.len() > MAX_STORAGES {
            return Err(Error::Filesystem(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("storage count {} outside 1..={MAX_STORAGES}", entries.len()),
            )));
        }
        let storages = entries
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| {
                debug!(
                    id = idx as u32 + 1,
                    name = %entry.display_name,
                    root = %entry.root_path.display(),
                    writable = entry.writable,
                    "mounting storage"
                );
                Storage {
                    id: idx as u32 + 1,
                    display_name: entry.display_name,
                    root: entry.root_path,
                    writable: entry.writable,
                }
            })
            .collect();
        Ok(Self { storages })
    }

    pub fn storages(&self) -> &[Storage] {
        &self.storages
    }

    pub fn storage(&self, id: u32) -> Result<&Storage> {
        self.storages
            .iter()
            .find(|storage| storage.id == id)
            .ok_or(Error::Protocol(ResponseCode::InvalidStorageId))
    }

    /// Reject mutations on a read-only storage.
    pub fn ensure_writable(&self, id: u32) -> Result<()> {
        if self.storage(id)?.writable {
            Ok(())
        } else {
            Err(Error::Protocol(ResponseCode::StoreReadOnly))
        }
    }

    /// Join a storage-relative path onto its root. Only plain name
    /// components are accepted; anything that could escape the root is a
    /// protocol violation.
    pub fn full_path(&self, storage_id: u32, relative: &Path) -> Result<PathBuf> {
        let storage = self.storage(storage_id)?;
        let mut path = storage.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => {
                    warn!(path = %relative.display(), "rejecting path escaping storage root");
                    return Err(Error::Protocol(ResponseCode::InvalidParameter));
                }
            }
        }
        Ok(path)
    }

    pub async fn stat(&self, storage_id: u32, relative: &Path) -> Result<ObjectStat> {
        let path = self.full_path(storage_id, relative)?;
        let meta = fs::metadata(&path).await?;
        Ok(ObjectStat {
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
        })
    }

    /// List a directory. Order is filesystem-defined but stable within one
    /// call. Entries with non-UTF-8 names are skipped; they cannot be
    /// represented in a PTP string.
    pub async fn enumerate(&self, storage_id: u32, relative: &Path) -> Result<Vec<DirEntryInfo>> {
        let path = self.full_path(storage_id, relative)?;
        let mut listing = Vec::new();
        let mut dir = fs::read_dir(&path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                warn!(path = %entry.path().display(), "skipping non-UTF-8 entry name");
                continue;
            };
            let meta = entry.metadata().await?;
            listing.push(DirEntryInfo {
                name,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                mtime: meta.modified().ok(),
            });
        }
        Ok(listing)
    }

    pub async fn open_read(&self, storage_id: u32, relative: &Path) -> Result<fs::File> {
        let path = self.full_path(storage_id, relative)?;
        Ok(fs::File::open(&path).await?)
    }

    pub async fn create_file(&self, storage_id: u32, relative: &Path) -> Result<fs::File> {
        self.ensure_writable(storage_id)?;
        let path = self.full_path(storage_id, relative)?;
        Ok(fs::File::create(&path).await?)
    }

    /// Open an existing file for a truncating rewrite.
    pub async fn open_write(&self, storage_id: u32, relative: &Path) -> Result<fs::File> {
        self.ensure_writable(storage_id)?;
        let path = self.full_path(storage_id, relative)?;
        Ok(fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await?)
    }

    pub async fn create_dir(&self, storage_id: u32, relative: &Path) -> Result<()> {
        self.ensure_writable(storage_id)?;
        let path = self.full_path(storage_id, relative)?;
        Ok(fs::create_dir(&path).await?)
    }

    pub async fn delete_file(&self, storage_id: u32, relative: &Path) -> Result<()> {
        self.ensure_writable(storage_id)?;
        let path = self.full_path(storage_id, relative)?;
        Ok(fs::remove_file(&path).await?)
    }

    /// Delete a directory tree. Children that cannot be deleted are skipped
    /// and reported as a partial deletion; everything else still goes.
    pub async fn delete_dir_recursive(&self, storage_id: u32, relative: &Path) -> Result<()> {
        self.ensure_writable(storage_id)?;
        let root = self.full_path(storage_id, relative)?;

        let mut failed = false;
        let mut dirs: Vec<PathBuf> = Vec::new();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            match fs::read_dir(&dir).await {
                Ok(mut entries) => loop {
                    match entries.next_entry().await {
                        Ok(Some(entry)) => {
                            let is_dir = entry
                                .file_type()
                                .await
                                .map(|ty| ty.is_dir())
                                .unwrap_or(false);
                            if is_dir {
                                stack.push(entry.path());
                            } else if let Err(err) = fs::remove_file(entry.path()).await {
                                warn!(path = %entry.path().display(), %err, "failed to delete file");
                                failed = true;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(path = %dir.display(), %err, "directory walk failed");
                            failed = true;
                            break;
                        }
                    }
                },
                Err(err) => {
                    warn!(path = %dir.display(), %err, "failed to open directory");
                    failed = true;
                }
            }
            dirs.push(dir);
        }
        // Reverse pre-order puts every child before its parent.
        for dir in dirs.iter().rev() {
            if let Err(err) = fs::remove_dir(dir).await {
                warn!(path = %dir.display(), %err, "failed to delete directory");
                failed = true;
            }
        }

        if failed {
            Err(Error::Protocol(ResponseCode::PartialDeletion))
        } else {
            Ok(())
        }
    }

    /// Rename or move within one storage. Atomic from the responder's
    /// perspective.
    pub async fn rename(&self, storage_id: u32, from: &Path, to: &Path) -> Result<()> {
        self.ensure_writable(storage_id)?;
        let from = self.full_path(storage_id, from)?;
        let to = self.full_path(storage_id, to)?;
        Ok(fs::rename(&from, &to).await?)
    }

    /// Capacity and free space of a storage in bytes.
    pub async fn storage_stat(&self, storage_id: u32) -> Result<(u64, u64)> {
        let root = self.storage(storage_id)?.root.clone();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&root))
            .await
            .map_err(|err| Error::Filesystem(io::Error::other(err)))?
            .map_err(|errno| Error::Filesystem(io::Error::from_raw_os_error(errno as i32)))?;
        let fragment = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * fragment;
        let free = stat.blocks_available() as u64 * fragment;
        Ok((total, free))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn proxy(root: &Path, writable: bool) -> FilesystemProxy {
        FilesystemProxy::new(vec![FsEntry {
            display_name: "A".into(),
            root_path: root.to_owned(),
            writable,
        }])
        .unwrap()
    }

    #[test]
    fn storage_ids_follow_declaration_order() {
        let dir = tempdir().unwrap();
        let vfs = FilesystemProxy::new(vec![
            FsEntry {
                display_name: "first".into(),
                root_path: dir.path().to_owned(),
                writable: true,
            },
            FsEntry {
                display_name: "second".into(),
                root_path: dir.path().to_owned(),
                writable: false,
            },
        ])
        .unwrap();
        assert_eq!(vfs.storages()[0].id, 1);
        assert_eq!(vfs.storages()[1].id, 2);
        assert_eq!(vfs.storage(2).unwrap().display_name, "second");
        assert!(vfs.storage(3).is_err());
    }

    #[test]
    fn empty_entry_list_is_rejected() {
        assert!(FilesystemProxy::new(Vec::new()).is_err());
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let dir = tempdir().unwrap();
        let vfs = proxy(dir.path(), true);
        assert!(vfs.full_path(1, Path::new("ok/name.txt")).is_ok());
        assert!(vfs.full_path(1, Path::new("../escape")).is_err());
        assert!(vfs.full_path(1, Path::new("/absolute")).is_err());
    }

    #[tokio::test]
    async fn create_enumerate_delete_round_trip() {
        let dir = tempdir().unwrap();
        let vfs = proxy(dir.path(), true);

        vfs.create_dir(1, Path::new("photos")).await.unwrap();
        drop(vfs.create_file(1, Path::new("photos/cat.jpg")).await.unwrap());
        tokio::fs::write(dir.path().join("photos/cat.jpg"), b"meow")
            .await
            .unwrap();

        let listing = vfs.enumerate(1, Path::new("")).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].is_dir);

        let listing = vfs.enumerate(1, Path::new("photos")).await.unwrap();
        assert_eq!(listing[0].name, "cat.jpg");
        assert_eq!(listing[0].size, 4);

        vfs.delete_dir_recursive(1, Path::new("photos")).await.unwrap();
        assert!(vfs.stat(1, Path::new("photos")).await.is_err());
    }

    #[tokio::test]
    async fn read_only_storage_refuses_mutations() {
        let dir = tempdir().unwrap();
        let vfs = proxy(dir.path(), false);
        let err = vfs.create_dir(1, Path::new("nope")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ResponseCode::StoreReadOnly)
        ));
        assert!(vfs.enumerate(1, Path::new("")).await.is_ok());
    }

    #[tokio::test]
    async fn rename_moves_entries_within_storage() {
        let dir = tempdir().unwrap();
        let vfs = proxy(dir.path(), true);
        drop(vfs.create_file(1, Path::new("a.txt")).await.unwrap());
        vfs.create_dir(1, Path::new("sub")).await.unwrap();
        vfs.rename(1, Path::new("a.txt"), Path::new("sub/b.txt"))
            .await
            .unwrap();
        assert!(vfs.stat(1, Path::new("a.txt")).await.is_err());
        assert!(!vfs.stat(1, Path::new("sub/b.txt")).await.unwrap().is_dir);
    }

    #[tokio::test]
    async fn storage_stat_reports_capacity() {
        let dir = tempdir().unwrap();
        let vfs = proxy(dir.path(), true);
        let (total, free) = vfs.storage_stat(1).await.unwrap();
        assert!(total > 0);
        assert!(free <= total);
    }
}
