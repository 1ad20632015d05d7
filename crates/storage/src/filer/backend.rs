//! Physical filer backends
//!
//! A backend performs one byte-range operation synchronously. The [`Filer`]
//! queue in front of it provides ordering, coalescing and caller waits.
//!
//! [`Filer`]: super::Filer

use crystal_core::{BufferPool, CrystalError, CrystalResult, SharedBuffer};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

/// Read length meaning "everything from offset to end of file"
pub const TO_END: usize = usize::MAX;

/// Synchronous byte-range operations against one physical location
///
/// Paths are relative to the backend root. Missing files are `NoData` on read
/// and silently succeed on delete.
pub trait FilerBackend: Send + Sync {
    /// Validate and create the backing location
    fn prepare(&self) -> CrystalResult<()>;

    /// Write `data` at `offset`, creating the file if needed
    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> CrystalResult<()>;

    /// Read up to `len` bytes at `offset`; shorter files yield shorter buffers
    fn read_at(
        &self,
        path: &Path,
        offset: u64,
        len: usize,
        pool: &BufferPool,
    ) -> CrystalResult<SharedBuffer>;

    /// Remove one file
    fn delete(&self, path: &Path) -> CrystalResult<()>;

    /// Remove everything below the root
    fn delete_all(&self) -> CrystalResult<()>;

    /// Relative paths of files whose name matches `pattern` (`*` wildcard)
    fn list(&self, pattern: &str) -> CrystalResult<Vec<PathBuf>>;

    /// Human-readable location, for logs
    fn location(&self) -> String;
}

/// Reject absolute paths and paths escaping the backend root
pub fn validate_path(path: &Path) -> CrystalResult<()> {
    if path.as_os_str().is_empty() {
        return Err(CrystalError::invalid_argument("empty filer path"));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(CrystalError::invalid_argument(format!(
                    "filer path must be relative and stay below the root: {}",
                    path.display()
                )))
            }
        }
    }
    Ok(())
}

/// Match a file name against a pattern where `*` matches any run of characters
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return name == pattern;
    }
    let first = parts[0];
    let last = parts[parts.len() - 1];
    if name.len() < first.len() + last.len() || !name.starts_with(first) || !name.ends_with(last)
    {
        return false;
    }
    let mut rest = &name[first.len()..name.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    true
}

/// Backend over a directory of the local file system
pub struct LocalFileBackend {
    root: PathBuf,
    sync_writes: bool,
}

impl LocalFileBackend {
    /// Create a backend rooted at `root`
    pub fn new(root: impl Into<PathBuf>, sync_writes: bool) -> Self {
        Self {
            root: root.into(),
            sync_writes,
        }
    }

    /// Backend root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collect(&self, dir: &Path, pattern: &str, out: &mut Vec<PathBuf>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect(&path, pattern, out)?;
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if matches_pattern(&name, pattern) {
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    out.push(relative.to_path_buf());
                }
            }
        }
        Ok(())
    }
}

impl FilerBackend for LocalFileBackend {
    fn prepare(&self) -> CrystalResult<()> {
        fs::create_dir_all(&self.root)?;
        let meta = fs::metadata(&self.root)?;
        if !meta.is_dir() {
            return Err(CrystalError::FileError(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> CrystalResult<()> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&full)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        if self.sync_writes {
            file.sync_data()?;
        }
        Ok(())
    }

    fn read_at(
        &self,
        path: &Path,
        offset: u64,
        len: usize,
        pool: &BufferPool,
    ) -> CrystalResult<SharedBuffer> {
        let full = self.root.join(path);
        let mut file = match OpenOptions::new().read(true).open(&full) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CrystalError::NoData),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len();
        let available = size.saturating_sub(offset);
        let n = (len as u64).min(available) as usize;
        let mut owner = pool.rent(n);
        owner.resize(n);
        if n > 0 {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(owner.as_mut_slice())?;
        }
        Ok(owner.freeze())
    }

    fn delete(&self, path: &Path) -> CrystalResult<()> {
        match fs::remove_file(self.root.join(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_all(&self) -> CrystalResult<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn list(&self, pattern: &str) -> CrystalResult<Vec<PathBuf>> {
        let mut out = Vec::new();
        self.collect(&self.root, pattern, &mut out)?;
        out.sort();
        Ok(out)
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("book-000001.book", "*.book"));
        assert!(matches_pattern("book-000001.book", "book-*"));
        assert!(matches_pattern("book-000001.book", "book-*.book"));
        assert!(matches_pattern("a.obj", "*"));
        assert!(matches_pattern("exact", "exact"));
        assert!(!matches_pattern("book-1.seg", "*.book"));
        assert!(!matches_pattern("ab", "a*b*c"));
        assert!(matches_pattern("a-x-b-y-c", "a*b*c"));
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path(Path::new("objects/00/1.obj")).is_ok());
        assert!(validate_path(Path::new("/etc/passwd")).is_err());
        assert!(validate_path(Path::new("../escape")).is_err());
        assert!(validate_path(Path::new("")).is_err());
    }

    #[test]
    fn test_write_then_read_range() {
        let dir = tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path(), false);
        let pool = BufferPool::new(4);
        backend.prepare().unwrap();

        backend.write_at(Path::new("a/b.bin"), 0, b"hello world").unwrap();
        backend.write_at(Path::new("a/b.bin"), 6, b"WORLD").unwrap();

        let all = backend.read_at(Path::new("a/b.bin"), 0, TO_END, &pool).unwrap();
        assert_eq!(&all[..], b"hello WORLD");

        let part = backend.read_at(Path::new("a/b.bin"), 6, 3, &pool).unwrap();
        assert_eq!(&part[..], b"WOR");

        let past_end = backend.read_at(Path::new("a/b.bin"), 100, 3, &pool).unwrap();
        assert!(past_end.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path(), false);
        let pool = BufferPool::new(4);
        backend.prepare().unwrap();

        assert_eq!(
            backend.read_at(Path::new("nope"), 0, 10, &pool),
            Err(CrystalError::NoData)
        );
        assert!(backend.delete(Path::new("nope")).is_ok());
    }

    #[test]
    fn test_list_and_delete_all() {
        let dir = tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path().join("root"), false);
        backend.prepare().unwrap();

        backend.write_at(Path::new("x/1.obj"), 0, b"1").unwrap();
        backend.write_at(Path::new("y/2.obj"), 0, b"2").unwrap();
        backend.write_at(Path::new("3.tmp"), 0, b"3").unwrap();

        let listed = backend.list("*.obj").unwrap();
        assert_eq!(
            listed,
            vec![PathBuf::from("x/1.obj"), PathBuf::from("y/2.obj")]
        );

        backend.delete_all().unwrap();
        assert!(backend.list("*").unwrap().is_empty());
        assert!(backend.root().exists());
    }
}
