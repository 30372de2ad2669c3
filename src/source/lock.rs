//! Exclusive lock serializing acquisitions of one target directory.
//!
//! The lock file lives next to the target directory, not inside it,
//! because directory preparation may wipe the target's contents while
//! the lock is held.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

/// Default lock timeout (5 minutes) - prevents indefinite hangs
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A guard that holds an exclusive lock on a checkout target.
/// Lock is released when dropped.
#[derive(Debug)]
pub struct CheckoutLock {
    file: File,
}

impl CheckoutLock {
    /// Acquire the lock guarding `target`, blocking until available or
    /// the default timeout elapses.
    pub fn acquire_for(target: &Path) -> io::Result<Self> {
        Self::acquire_with_timeout(&lock_path_for(target), DEFAULT_LOCK_TIMEOUT)
    }

    /// Acquire an exclusive lock with a custom timeout.
    /// Returns an error with `ErrorKind::TimedOut` if the lock cannot be
    /// acquired within the specified duration.
    pub fn acquire_with_timeout(lock_path: &Path, timeout: Duration) -> io::Result<Self> {
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        // Poll with exponential backoff instead of blocking forever.
        let start = Instant::now();
        let mut sleep_duration = Duration::from_millis(10);
        let max_sleep = Duration::from_millis(500);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("lock acquisition timed out after {:?}", timeout),
                        ));
                    }
                    std::thread::sleep(sleep_duration);
                    sleep_duration = (sleep_duration * 2).min(max_sleep);
                }
                Err(e) => return Err(e),
            }
        }
    }

}

impl Drop for CheckoutLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Lock file path for a target directory: a dotfile sibling.
fn lock_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkout".to_string());
    let file_name = format!(".{}.ghco.lock", name);
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(file_name),
        _ => PathBuf::from(file_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn lock_file_is_a_sibling_of_the_target() {
        let path = lock_path_for(Path::new("/work/checkout"));
        assert_eq!(path, Path::new("/work/.checkout.ghco.lock"));
    }

    #[test]
    fn lock_file_for_bare_relative_target() {
        let path = lock_path_for(Path::new("checkout"));
        assert_eq!(path, Path::new(".checkout.ghco.lock"));
    }

    #[test]
    fn acquire_creates_lock_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("checkout");

        let lock = CheckoutLock::acquire_for(&target).unwrap();

        assert!(dir.path().join(".checkout.ghco.lock").exists());

        drop(lock);
    }

    #[test]
    fn held_lock_blocks_a_second_acquire() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("checkout");
        let lock_path = lock_path_for(&target);

        let _lock = CheckoutLock::acquire_for(&target).unwrap();
        let result = CheckoutLock::acquire_with_timeout(&lock_path, Duration::from_millis(50));
        assert!(result.is_err(), "Should not acquire a held lock");
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("checkout");
        let lock_path = lock_path_for(&target);

        {
            let _lock = CheckoutLock::acquire_for(&target).unwrap();
            assert!(
                CheckoutLock::acquire_with_timeout(&lock_path, Duration::from_millis(50)).is_err()
            );
        }
        let lock = CheckoutLock::acquire_with_timeout(&lock_path, Duration::from_millis(50));
        assert!(lock.is_ok());
    }

    #[test]
    fn acquire_with_timeout_times_out() {
        let dir = tempdir().unwrap();
        let lock_path = Arc::new(dir.path().join(".checkout.ghco.lock"));
        let barrier = Arc::new(Barrier::new(2));

        let lock_path_clone = Arc::clone(&lock_path);
        let barrier_clone = Arc::clone(&barrier);

        let handle1 = thread::spawn(move || {
            let lock =
                CheckoutLock::acquire_with_timeout(&lock_path_clone, DEFAULT_LOCK_TIMEOUT).unwrap();
            barrier_clone.wait();
            thread::sleep(Duration::from_millis(500));
            drop(lock);
        });

        let handle2 = thread::spawn(move || {
            barrier.wait();
            let result =
                CheckoutLock::acquire_with_timeout(&lock_path, Duration::from_millis(100));
            assert!(result.is_err(), "Should have timed out");
            let err = result.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        });

        handle1.join().unwrap();
        handle2.join().unwrap();
    }
}
