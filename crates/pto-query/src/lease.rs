use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const OWNERS_DIR: &str = "owners";

/// Advisory lock held for as long as a cache instance is open. Entries it
/// starts are tagged with its id; other instances treat them as running
/// while the lock is held and as interrupted once it is gone.
pub struct OwnerLease {
    id: String,
    path: PathBuf,
    file: File,
}

impl OwnerLease {
    pub fn acquire(cache_root: &Path) -> io::Result<Self> {
        let id = Uuid::new_v4().simple().to_string();
        let path = owner_path(cache_root, &id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.try_lock_exclusive()?;

        let metadata = format!(
            "owner_id={id}\nowner_pid={}\nacquired_at={}\n",
            std::process::id(),
            Utc::now().to_rfc3339(),
        );
        file.set_len(0)?;
        file.write_all(metadata.as_bytes())?;
        file.flush()?;

        Ok(Self { id, path, file })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for OwnerLease {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
        let _ = self.file.unlock();
    }
}

/// Whether the instance `owner` still holds its lease under `cache_root`.
/// A lease file left behind by a crashed process is cleared.
pub fn owner_is_live(cache_root: &Path, owner: &str) -> io::Result<bool> {
    let path = owner_path(cache_root, owner);
    let file = match OpenOptions::new().read(true).write(true).open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = fs::remove_file(&path);
            let _ = file.unlock();
            Ok(false)
        }
        Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(true),
        Err(err) => Err(err),
    }
}

fn owner_path(cache_root: &Path, owner: &str) -> PathBuf {
    cache_root.join(OWNERS_DIR).join(format!("{owner}.lock"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lease_is_live_until_dropped() {
        let dir = TempDir::new().expect("temp dir");
        let lease = OwnerLease::acquire(dir.path()).expect("acquire");
        let other = OwnerLease::acquire(dir.path()).expect("second instance");
        assert_ne!(lease.id(), other.id());

        assert!(owner_is_live(dir.path(), lease.id()).expect("check"));
        let owner = lease.id().to_string();
        drop(lease);
        assert!(!owner_is_live(dir.path(), &owner).expect("check after drop"));
        assert!(owner_is_live(dir.path(), other.id()).expect("other still live"));
    }

    #[test]
    fn abandoned_lease_file_is_cleared() {
        let dir = TempDir::new().expect("temp dir");
        let stale = owner_path(dir.path(), "deadbeef");
        fs::create_dir_all(stale.parent().expect("parent")).expect("owners dir");
        fs::write(&stale, "owner_id=deadbeef\n").expect("stale lease");

        assert!(!owner_is_live(dir.path(), "deadbeef").expect("check"));
        assert!(!stale.exists());
        assert!(!owner_is_live(dir.path(), "never-seen").expect("missing lease"));
    }
}
