use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{ProvisionerError, Result};

/// OS-level probes the Discoverer/Deleter need. Trait-ified so tests can substitute an
/// in-memory fake instead of touching the real filesystem.
pub trait VolumeUtil: Send + Sync {
    fn is_dir(&self, path: &Path) -> Result<bool>;
    fn is_block_device(&self, path: &Path) -> Result<bool>;
    fn read_dir(&self, path: &Path) -> Result<Vec<String>>;
    fn capacity(&self, path: &Path) -> Result<u64>;
    fn is_likely_mount_point(&self, path: &Path) -> Result<bool>;
}

fn probe_err(path: &Path, source: io::Error) -> ProvisionerError {
    ProvisionerError::ProbeFailure {
        path: path.display().to_string(),
        source,
    }
}

/// Real implementation, backed by `std::fs` plus the unix-only syscalls needed for block-device
/// and mount-point detection.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsVolumeUtil;

impl VolumeUtil for OsVolumeUtil {
    fn is_dir(&self, path: &Path) -> Result<bool> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(probe_err(path, e)),
        }
    }

    #[cfg(unix)]
    fn is_block_device(&self, path: &Path) -> Result<bool> {
        use std::os::unix::fs::FileTypeExt;
        match std::fs::metadata(path) {
            Ok(meta) => Ok(meta.file_type().is_block_device()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(probe_err(path, e)),
        }
    }

    #[cfg(not(unix))]
    fn is_block_device(&self, _path: &Path) -> Result<bool> {
        Err(ProvisionerError::Unsupported(
            "block device probing is only supported on unix hosts".to_string(),
        ))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(path).map_err(|e| probe_err(path, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| probe_err(path, e))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    #[cfg(unix)]
    fn capacity(&self, path: &Path) -> Result<u64> {
        if self.is_block_device(path)? {
            block_device_size(path).map_err(|e| probe_err(path, e))
        } else {
            filesystem_capacity(path).map_err(|e| probe_err(path, e))
        }
    }

    #[cfg(not(unix))]
    fn capacity(&self, path: &Path) -> Result<u64> {
        filesystem_capacity(path).map_err(|e| probe_err(path, e))
    }

    #[cfg(unix)]
    fn is_likely_mount_point(&self, path: &Path) -> Result<bool> {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(path).map_err(|e| probe_err(path, e))?;
        let parent = path.parent().unwrap_or(path);
        let parent_meta = std::fs::metadata(parent).map_err(|e| probe_err(parent, e))?;
        Ok(meta.dev() != parent_meta.dev())
    }

    #[cfg(not(unix))]
    fn is_likely_mount_point(&self, _path: &Path) -> Result<bool> {
        Err(ProvisionerError::Unsupported(
            "mount point detection is only supported on unix hosts".to_string(),
        ))
    }
}

/// Returns the size in bytes of a device node by seeking to its end. Works for any Linux block
/// device without a raw `BLKGETSIZE64` ioctl: the kernel reports the device's true length as
/// the file's apparent end.
#[cfg(unix)]
fn block_device_size(path: &Path) -> io::Result<u64> {
    use std::io::{Seek, SeekFrom};
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::End(0))
}

#[cfg(unix)]
fn filesystem_capacity(path: &Path) -> io::Result<u64> {
    use nix::sys::statvfs::statvfs;
    let stat = statvfs(path).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok(stat.blocks() as u64 * stat.fragment_size())
}

#[cfg(not(unix))]
fn filesystem_capacity(_path: &Path) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "filesystem capacity probing is only supported on unix hosts",
    ))
}

/// In-memory fake used by discoverer/deleter tests: every path classification and size is
/// pre-seeded rather than touching the real filesystem.
#[derive(Debug, Default, Clone)]
pub struct FakeVolumeUtil {
    pub dirs: HashMap<PathBuf, Vec<String>>,
    pub is_dir: HashMap<PathBuf, bool>,
    pub is_block: HashMap<PathBuf, bool>,
    pub is_mount_point: HashMap<PathBuf, bool>,
    pub capacities: HashMap<PathBuf, u64>,
}

impl FakeVolumeUtil {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dir(mut self, dir: &str, entries: &[&str]) -> Self {
        self.dirs.insert(
            PathBuf::from(dir),
            entries.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn with_filesystem_entry(mut self, path: &str, capacity: u64, mount_point: bool) -> Self {
        let p = PathBuf::from(path);
        self.is_dir.insert(p.clone(), true);
        self.is_block.insert(p.clone(), false);
        self.is_mount_point.insert(p.clone(), mount_point);
        self.capacities.insert(p, capacity);
        self
    }

    pub fn with_block_entry(mut self, path: &str, capacity: u64) -> Self {
        let p = PathBuf::from(path);
        self.is_dir.insert(p.clone(), false);
        self.is_block.insert(p.clone(), true);
        self.capacities.insert(p, capacity);
        self
    }
}

impl VolumeUtil for FakeVolumeUtil {
    fn is_dir(&self, path: &Path) -> Result<bool> {
        Ok(*self.is_dir.get(path).unwrap_or(&false))
    }

    fn is_block_device(&self, path: &Path) -> Result<bool> {
        Ok(*self.is_block.get(path).unwrap_or(&false))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        self.dirs.get(path).cloned().ok_or_else(|| {
            ProvisionerError::ProbeFailure {
                path: path.display().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such directory"),
            }
        })
    }

    fn capacity(&self, path: &Path) -> Result<u64> {
        self.capacities.get(path).copied().ok_or_else(|| {
            ProvisionerError::ProbeFailure {
                path: path.display().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no known capacity"),
            }
        })
    }

    fn is_likely_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(*self.is_mount_point.get(path).unwrap_or(&false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_reports_configured_filesystem_entry() {
        let util = FakeVolumeUtil::new().with_filesystem_entry("/mnt/fast/vol1", 100, true);
        let path = Path::new("/mnt/fast/vol1");
        assert!(util.is_dir(path).unwrap());
        assert!(!util.is_block_device(path).unwrap());
        assert!(util.is_likely_mount_point(path).unwrap());
        assert_eq!(util.capacity(path).unwrap(), 100);
    }

    #[test]
    fn fake_reports_configured_block_entry() {
        let util = FakeVolumeUtil::new().with_block_entry("/mnt/raw/sdb", 500);
        let path = Path::new("/mnt/raw/sdb");
        assert!(util.is_block_device(path).unwrap());
        assert!(!util.is_dir(path).unwrap());
    }

    #[test]
    fn fake_read_dir_lists_seeded_entries() {
        let util = FakeVolumeUtil::new().with_dir("/mnt/fast", &["vol1", "vol2"]);
        let entries = util.read_dir(Path::new("/mnt/fast")).unwrap();
        assert_eq!(entries, vec!["vol1".to_string(), "vol2".to_string()]);
    }

    #[test]
    fn fake_read_dir_missing_path_is_probe_failure() {
        let util = FakeVolumeUtil::new();
        assert!(util.read_dir(Path::new("/nowhere")).is_err());
    }
}
