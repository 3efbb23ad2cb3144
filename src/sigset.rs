//! Thin owned wrapper over `libc::sigset_t`.
//!
//! The reactor and the blocking network primitives both juggle thread
//! signal masks; this keeps the unsafe sigset plumbing in one place.

use crate::error::{Error, Result};

#[derive(Clone, Copy)]
pub struct SigSet {
    raw: libc::sigset_t,
}

impl SigSet {
    pub fn empty() -> SigSet {
        let mut raw: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe { libc::sigemptyset(&mut raw) };
        SigSet { raw }
    }

    pub fn full() -> SigSet {
        let mut raw: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe { libc::sigfillset(&mut raw) };
        SigSet { raw }
    }

    pub fn add(&mut self, signo: i32) -> Result<()> {
        if unsafe { libc::sigaddset(&mut self.raw, signo) } != 0 {
            return Err(Error::InvalidArgument("bad signal number"));
        }
        Ok(())
    }

    pub fn remove(&mut self, signo: i32) -> Result<()> {
        if unsafe { libc::sigdelset(&mut self.raw, signo) } != 0 {
            return Err(Error::InvalidArgument("bad signal number"));
        }
        Ok(())
    }

    pub fn contains(&self, signo: i32) -> bool {
        unsafe { libc::sigismember(&self.raw, signo) == 1 }
    }

    pub fn as_ptr(&self) -> *const libc::sigset_t {
        &self.raw
    }

    /// Replace the calling thread's mask with `self`, returning the
    /// previous mask so the caller can restore it.
    pub fn swap_thread_mask(&self) -> Result<SigSet> {
        let mut prev: libc::sigset_t = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.raw, &mut prev) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::from_raw_os_error(rc)));
        }
        Ok(SigSet { raw: prev })
    }
}

impl std::fmt::Debug for SigSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // sigset_t is opaque; show membership of the classic range.
        let members: Vec<i32> = (1..32).filter(|s| self.contains(*s)).collect();
        f.debug_struct("SigSet").field("members", &members).finish()
    }
}
