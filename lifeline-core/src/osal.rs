//! Thin POSIX layer: process-shared semaphores and shared-memory regions.
//!
//! Everything that crosses the parent/child boundary lives in memory mapped
//! `MAP_SHARED`, so the types here are `#[repr(C)]` and initialized in place.

use std::cell::UnsafeCell;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;

use crate::error::CoreError;

/// Polling resolution of [`RawSemaphore::timed_wait`].
const SEM_WAIT_RESOLUTION: Duration = Duration::from_millis(2);

/// A counting semaphore embedded directly in (possibly shared) memory.
///
/// `sem_timedwait` is deliberately avoided: it is driven by the realtime
/// clock, which another process may step. The timed wait is a
/// `sem_trywait` poll at a two-millisecond resolution instead, which keeps
/// busy time low and bounds the accumulated error on long delays.
#[repr(C)]
pub struct RawSemaphore {
    sem: UnsafeCell<libc::sem_t>,
}

// The pointer handed to sem_* is stable (the semaphore is never moved once
// initialized in place) and the sem_* family is thread-safe.
unsafe impl Send for RawSemaphore {}
unsafe impl Sync for RawSemaphore {}

impl RawSemaphore {
    /// Initialize in place. `shared` selects cross-process visibility.
    pub fn init(&self, value: u32, shared: bool) -> Result<(), Errno> {
        let pshared = i32::from(shared);
        let rc = unsafe { libc::sem_init(self.sem.get(), pshared, value) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Errno::last())
        }
    }

    pub fn post(&self) -> Result<(), Errno> {
        let rc = unsafe { libc::sem_post(self.sem.get()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Errno::last())
        }
    }

    /// Block until posted. Fails on signal interruption.
    pub fn wait(&self) -> Result<(), Errno> {
        let rc = unsafe { libc::sem_wait(self.sem.get()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Errno::last())
        }
    }

    /// Wait up to `timeout`. Returns true if the semaphore was taken.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let mut remaining = timeout;
        loop {
            Errno::clear();
            let rc = unsafe { libc::sem_trywait(self.sem.get()) };
            if rc == 0 {
                return true;
            }
            if Errno::last() == Errno::EAGAIN && remaining >= SEM_WAIT_RESOLUTION {
                thread::sleep(SEM_WAIT_RESOLUTION);
                remaining -= SEM_WAIT_RESOLUTION;
            } else {
                return false;
            }
        }
    }

    /// Destroy the semaphore. Only the last user may call this.
    pub fn destroy(&self) {
        unsafe {
            libc::sem_destroy(self.sem.get());
        }
    }
}

/// A `MAP_SHARED` memory region.
///
/// File-backed regions (created through an unlinked `shm_open` object) carry
/// a file descriptor that can be handed to a forked child and re-mapped
/// after exec. Anonymous regions serve in-process use and tests.
pub struct SharedRegion {
    ptr: *mut u8,
    len: usize,
    fd: Option<OwnedFd>,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

static SHM_SEQ: AtomicU64 = AtomicU64::new(0);

impl SharedRegion {
    /// Create a file-backed region of `len` zeroed bytes. The shm object is
    /// unlinked immediately; the open descriptor is the only remaining
    /// reference and is what a child re-maps after exec.
    pub fn create(len: usize) -> Result<SharedRegion, CoreError> {
        let name = format!(
            "/lifeline-{}-{}\0",
            std::process::id(),
            SHM_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr().cast(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(CoreError::SharedMemory(format!(
                "shm_open failed: {}",
                Errno::last()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        unsafe {
            libc::shm_unlink(name.as_ptr().cast());
        }
        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
            return Err(CoreError::SharedMemory(format!(
                "ftruncate failed: {}",
                Errno::last()
            )));
        }
        let ptr = Self::map(len, Some(&fd))?;
        Ok(SharedRegion {
            ptr,
            len,
            fd: Some(fd),
        })
    }

    /// Create an anonymous shared region. Visible to forked children but
    /// not re-attachable after exec.
    pub fn anonymous(len: usize) -> Result<SharedRegion, CoreError> {
        let ptr = Self::map(len, None)?;
        Ok(SharedRegion { ptr, len, fd: None })
    }

    /// Map an existing region from a descriptor, e.g. the well-known comms
    /// slot inherited from the launcher.
    ///
    /// # Safety
    /// `fd` must refer to a shm object of at least `len` bytes whose
    /// contents were laid out by this crate.
    pub unsafe fn attach(fd: BorrowedFd<'_>, len: usize) -> Result<SharedRegion, CoreError> {
        let dup = libc::dup(fd.as_raw_fd());
        if dup < 0 {
            return Err(CoreError::Os(Errno::last()));
        }
        let owned = OwnedFd::from_raw_fd(dup);
        let ptr = Self::map(len, Some(&owned))?;
        Ok(SharedRegion {
            ptr,
            len,
            fd: Some(owned),
        })
    }

    fn map(len: usize, fd: Option<&OwnedFd>) -> Result<*mut u8, CoreError> {
        let (flags, raw_fd) = match fd {
            Some(fd) => (libc::MAP_SHARED, fd.as_raw_fd()),
            None => (libc::MAP_SHARED | libc::MAP_ANONYMOUS, -1),
        };
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                raw_fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CoreError::SharedMemory(format!(
                "mmap failed: {}",
                Errno::last()
            )));
        }
        Ok(ptr.cast())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| {
            // SAFETY: the descriptor outlives the borrow (owned by self).
            unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) }
        })
    }

    /// View a `T` at `offset`.
    ///
    /// # Safety
    /// The caller guarantees `offset` is in bounds, suitably aligned for
    /// `T`, and that the bytes there were initialized as a `T`.
    pub unsafe fn at<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + std::mem::size_of::<T>() <= self.len);
        &*self.ptr.add(offset).cast::<T>()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn semaphore_post_then_wait() {
        let region = SharedRegion::anonymous(size_of::<RawSemaphore>()).unwrap();
        let sem: &RawSemaphore = unsafe { region.at(0) };
        sem.init(0, false).unwrap();
        sem.post().unwrap();
        assert!(sem.timed_wait(Duration::from_millis(10)));
        sem.destroy();
    }

    #[test]
    fn timed_wait_expires() {
        let region = SharedRegion::anonymous(size_of::<RawSemaphore>()).unwrap();
        let sem: &RawSemaphore = unsafe { region.at(0) };
        sem.init(0, false).unwrap();
        let begin = Instant::now();
        assert!(!sem.timed_wait(Duration::from_millis(20)));
        assert!(begin.elapsed() >= Duration::from_millis(18));
        sem.destroy();
    }

    #[test]
    fn semaphore_wakes_other_thread() {
        let region = Arc::new(SharedRegion::anonymous(size_of::<RawSemaphore>()).unwrap());
        let sem: &RawSemaphore = unsafe { region.at(0) };
        sem.init(0, true).unwrap();

        let waiter = {
            let region = Arc::clone(&region);
            thread::spawn(move || {
                let sem: &RawSemaphore = unsafe { region.at(0) };
                sem.timed_wait(Duration::from_secs(2))
            })
        };
        sem.post().unwrap();
        assert!(waiter.join().unwrap());
        sem.destroy();
    }

    #[test]
    fn file_backed_region_is_zeroed() {
        let region = SharedRegion::create(64).unwrap();
        let word: &u64 = unsafe { region.at(0) };
        assert_eq!(*word, 0);
        assert!(region.fd().is_some());
    }
}
