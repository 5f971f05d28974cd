use std::fs::{File, OpenOptions};
use std::path::Path;

/// Advisory exclusive lock held while the cache index is rewritten.
///
/// Two previewer processes sharing a cache directory would otherwise race on
/// the index temp file. Backed by flock(2), so a killed holder releases it.
pub struct IndexWriteLock {
    _file: File,
}

impl IndexWriteLock {
    const LOCK_FILE: &'static str = "index.lock";

    /// Acquire, blocking until available. Rewrites are short, so waiting is
    /// bounded by one index write in the other process.
    pub fn acquire(cache_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(cache_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(cache_dir.join(Self::LOCK_FILE))?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if ret != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
impl Drop for IndexWriteLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::flock(self._file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
