//! Shared-memory futex fences.
//!
//! The X Sync extension can import a fence whose state lives in a page of
//! memory shared between client and server. Both sides update a single
//! 32-bit word: 1 means triggered, 0 untriggered, negative values mean
//! untriggered with waiters parked on the futex.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use rustix::fs::{ftruncate, memfd_create, MemfdFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

use crate::SurfaceError;

const TRIGGERED: i32 = 1;
const UNTRIGGERED: i32 = 0;
const WAITING: i32 = -1;

pub(crate) struct ShmFence {
    fd: OwnedFd,
    word: *mut AtomicI32,
    map_len: usize,
}

// The mapped word is only accessed through atomics; the fd is never
// mutated after creation.
unsafe impl Send for ShmFence {}
unsafe impl Sync for ShmFence {}

impl ShmFence {
    /// Allocates the backing page and maps it untriggered.
    pub fn alloc() -> Result<Self, SurfaceError> {
        let fd = memfd_create("wsi-shm-fence", MemfdFlags::CLOEXEC)
            .map_err(|_| SurfaceError::OutOfMemory)?;
        let map_len = page_size();
        ftruncate(&fd, map_len as u64).map_err(|_| SurfaceError::OutOfMemory)?;
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                map_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|_| SurfaceError::OutOfMemory)?;
        Ok(Self {
            fd,
            word: ptr.cast(),
            map_len,
        })
    }

    /// The fd to hand to the server. Callers duplicate it because the
    /// protocol layer takes ownership of transferred descriptors.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn word(&self) -> &AtomicI32 {
        unsafe { &*self.word }
    }

    /// Clears the fence ahead of a present request. Only flips a triggered
    /// fence so parked waiters are never lost.
    pub fn reset(&self) {
        let _ = self.word().compare_exchange(
            TRIGGERED,
            UNTRIGGERED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Signals the fence and wakes every waiter.
    pub fn trigger(&self) {
        if self.word().swap(TRIGGERED, Ordering::SeqCst) < 0 {
            futex_wake_all(self.word());
        }
    }

    /// Blocks until the fence is triggered.
    pub fn wait(&self) {
        loop {
            match self.word().compare_exchange(
                UNTRIGGERED,
                WAITING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                // We either installed the waiter marker or somebody else
                // already did; park until the server triggers.
                Ok(_) => futex_wait(self.word(), WAITING),
                Err(current) if current == WAITING => futex_wait(self.word(), WAITING),
                Err(_) => return,
            }
        }
    }
}

impl Drop for ShmFence {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.word.cast(), self.map_len);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn futex_wait(word: &AtomicI32, expected: i32) {
    unsafe {
        // Shared (non-private) futex so the server can wake us.
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
            0usize,
            0u32,
        );
    }
}

fn futex_wake_all(word: &AtomicI32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            0usize,
            0u32,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn triggered_fence_does_not_block() {
        let fence = ShmFence::alloc().unwrap();
        fence.trigger();
        fence.wait();
    }

    #[test]
    fn reset_then_cross_thread_trigger() {
        let fence = ShmFence::alloc().unwrap();
        fence.trigger();
        fence.reset();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                fence.trigger();
            });
            fence.wait();
        });
    }

    #[test]
    fn reset_only_clears_triggered_state() {
        let fence = ShmFence::alloc().unwrap();
        // A reset on an untriggered fence must not clobber the waiter
        // marker, so a trigger right after still wakes us.
        fence.reset();
        fence.trigger();
        fence.wait();
    }

    #[test]
    fn trigger_wakes_multiple_waiters() {
        let fence = ShmFence::alloc().unwrap();
        std::thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| fence.wait());
            }
            std::thread::sleep(Duration::from_millis(20));
            fence.trigger();
        });
    }
}
