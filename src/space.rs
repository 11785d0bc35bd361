//! Disk-space accounting for uploads in flight.
//!
//! A plain free-space check races with concurrent uploads: two requests can both see
//! enough room before either has written a byte. [`SpaceAccountant`] closes that gap by
//! counting bytes that have been promised to uploads but not yet written.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const MB: u64 = 1024 * 1024;

/// Source of free-space figures for a volume.
pub trait VolumeProbe: Send + Sync {
    fn free_bytes(&self) -> io::Result<u64>;
}

/// Probe backed by the filesystem holding `path`.
#[derive(Debug, Clone)]
pub struct FsVolume {
    path: PathBuf,
}

impl FsVolume {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl VolumeProbe for FsVolume {
    fn free_bytes(&self) -> io::Result<u64> {
        fs2::available_space(&self.path)
    }
}

/// Probe reporting a fixed amount that can be changed at runtime.
#[derive(Debug, Default)]
pub struct FixedVolume {
    free: AtomicU64,
}

impl FixedVolume {
    pub fn new(free_bytes: u64) -> Self {
        Self {
            free: AtomicU64::new(free_bytes),
        }
    }

    pub fn with_free_mb(mb: u64) -> Self {
        Self::new(mb * MB)
    }

    pub fn set_free_mb(&self, mb: u64) {
        self.free.store(mb * MB, Ordering::SeqCst);
    }
}

impl VolumeProbe for FixedVolume {
    fn free_bytes(&self) -> io::Result<u64> {
        Ok(self.free.load(Ordering::SeqCst))
    }
}

/// Free MB on a volume, 0 if it cannot be read.
pub fn free_mb(volume: &dyn VolumeProbe) -> i64 {
    match volume.free_bytes() {
        Ok(bytes) => (bytes / MB) as i64,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read free space, assuming none");
            0
        }
    }
}

/// Process-wide counter of bytes reserved by uploads that are still being written.
pub struct SpaceAccountant {
    volume: Arc<dyn VolumeProbe>,
    reserved: AtomicU64,
}

impl SpaceAccountant {
    pub fn new(volume: Arc<dyn VolumeProbe>) -> Self {
        Self {
            volume,
            reserved: AtomicU64::new(0),
        }
    }

    pub fn reserve(&self, size: u64) {
        self.reserved.fetch_add(size, Ordering::SeqCst);
    }

    /// Returns reserved bytes. Clamps at zero; an underflow means reserve and release
    /// calls are mismatched somewhere.
    pub fn release(&self, size: u64) {
        let previous = self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(size))
            })
            .unwrap_or(0);
        if previous < size {
            tracing::warn!(
                reserved = previous,
                released = size,
                "Reserved space would drop below zero, clamping. Reservation mismatch!"
            );
        }
    }

    /// Reserve `size` bytes until the returned guard is dropped.
    pub fn reserve_guard(&self, size: u64) -> SpaceReservation<'_> {
        self.reserve(size);
        SpaceReservation {
            accountant: self,
            size,
        }
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Free MB on the volume minus what is already promised to uploads.
    pub fn available_mb(&self) -> i64 {
        free_mb(self.volume.as_ref()) - (self.reserved_bytes() / MB) as i64
    }
}

/// Releases its reservation when dropped, whatever path the upload took.
pub struct SpaceReservation<'a> {
    accountant: &'a SpaceAccountant,
    size: u64,
}

impl Drop for SpaceReservation<'_> {
    fn drop(&mut self) {
        self.accountant.release(self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accountant(free_mb: u64) -> SpaceAccountant {
        SpaceAccountant::new(Arc::new(FixedVolume::with_free_mb(free_mb)))
    }

    #[test]
    fn reservation_reduces_available_space() {
        let acc = accountant(1000);
        assert_eq!(acc.available_mb(), 1000);
        acc.reserve(300 * MB);
        assert_eq!(acc.available_mb(), 700);
        acc.release(300 * MB);
        assert_eq!(acc.available_mb(), 1000);
    }

    #[test]
    fn release_clamps_at_zero() {
        let acc = accountant(10);
        acc.reserve(5);
        acc.release(50);
        assert_eq!(acc.reserved_bytes(), 0);
        acc.release(1);
        assert_eq!(acc.reserved_bytes(), 0);
    }

    #[test]
    fn guard_releases_on_early_return() {
        let acc = accountant(100);

        fn failing_write(acc: &SpaceAccountant) -> Result<(), &'static str> {
            let _guard = acc.reserve_guard(40 * MB);
            Err("disk went away")
        }

        assert!(failing_write(&acc).is_err());
        assert_eq!(acc.reserved_bytes(), 0);
    }

    #[test]
    fn guard_releases_on_panic() {
        let acc = accountant(100);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = acc.reserve_guard(MB);
            panic!("write failed");
        }));
        assert!(result.is_err());
        assert_eq!(acc.reserved_bytes(), 0);
    }

    #[test]
    fn available_can_go_negative() {
        let acc = accountant(1);
        acc.reserve(5 * MB);
        assert_eq!(acc.available_mb(), -4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_guards_settle_at_zero() {
        let acc = Arc::new(accountant(10_000));
        let mut tasks = Vec::new();
        for i in 0..32u64 {
            let acc = acc.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = acc.reserve_guard((i + 1) * MB);
                tokio::task::yield_now().await;
                assert!(acc.available_mb() <= 10_000 - (i as i64 + 1));
                if i % 3 == 0 {
                    panic!("upload {} aborted", i);
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
        assert_eq!(acc.reserved_bytes(), 0);
        assert_eq!(acc.available_mb(), 10_000);
    }
}
