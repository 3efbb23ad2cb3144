//! Compact pollfd vector handed raw to ppoll/poll.
//!
//! One entry per fd, order preserved across removals so dispatch order
//! matches registration order. The reactor points the kernel directly at
//! `as_mut_ptr()`; `revents` is whatever the last wait left behind.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

bitflags::bitflags! {
    /// poll(2) event bits. `ERR`, `HUP` and `NVAL` are return-only: the
    /// kernel reports them regardless of the requested interest.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: libc::c_short {
        const IN = libc::POLLIN;
        const OUT = libc::POLLOUT;
        const PRI = libc::POLLPRI;
        const ERR = libc::POLLERR;
        const HUP = libc::POLLHUP;
        const NVAL = libc::POLLNVAL;
    }
}

#[derive(Default)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl std::fmt::Debug for PollSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.fds.iter().map(|p| (p.fd, p.events, p.revents)))
            .finish()
    }
}

impl PollSet {
    pub fn new() -> PollSet {
        PollSet { fds: Vec::new() }
    }

    fn position(&self, fd: RawFd) -> Option<usize> {
        self.fds.iter().position(|p| p.fd == fd)
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.position(fd).is_some()
    }

    /// Register `fd` with an initial interest mask. At most one entry per
    /// fd; a second add fails without touching the first.
    pub fn add(&mut self, fd: RawFd, interest: Readiness) -> Result<()> {
        if fd < 0 {
            return Err(Error::InvalidArgument("negative fd"));
        }
        if self.contains(fd) {
            return Err(Error::Busy("fd already registered"));
        }
        self.fds.push(libc::pollfd { fd, events: interest.bits(), revents: 0 });
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd) -> Result<()> {
        let at = self.position(fd).ok_or(Error::InvalidArgument("fd not registered"))?;
        self.fds.remove(at);
        Ok(())
    }

    pub fn set_events(&mut self, fd: RawFd, interest: Readiness) -> Result<()> {
        let at = self.position(fd).ok_or(Error::InvalidArgument("fd not registered"))?;
        self.fds[at].events = interest.bits();
        Ok(())
    }

    /// OR extra interest bits into an existing registration.
    pub fn include_events(&mut self, fd: RawFd, interest: Readiness) -> Result<()> {
        let at = self.position(fd).ok_or(Error::InvalidArgument("fd not registered"))?;
        self.fds[at].events |= interest.bits();
        Ok(())
    }

    /// Clear interest bits on an existing registration.
    pub fn exclude_events(&mut self, fd: RawFd, interest: Readiness) -> Result<()> {
        let at = self.position(fd).ok_or(Error::InvalidArgument("fd not registered"))?;
        self.fds[at].events &= !interest.bits();
        Ok(())
    }

    pub fn events(&self, fd: RawFd) -> Option<Readiness> {
        self.position(fd).map(|at| Readiness::from_bits_retain(self.fds[at].events))
    }

    pub fn revents(&self, fd: RawFd) -> Option<Readiness> {
        self.position(fd).map(|at| Readiness::from_bits_retain(self.fds[at].revents))
    }

    /// Entries the last wait reported active, in vector order.
    pub fn ready(&self) -> impl Iterator<Item = (RawFd, Readiness)> + '_ {
        self.fds
            .iter()
            .filter(|p| p.revents != 0)
            .map(|p| (p.fd, Readiness::from_bits_retain(p.revents)))
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    /// Raw view for the kernel multiplexer.
    pub fn as_mut_ptr(&mut self) -> *mut libc::pollfd {
        self.fds.as_mut_ptr()
    }

    pub fn nfds(&self) -> libc::nfds_t {
        self.fds.len() as libc::nfds_t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_entry_per_fd() {
        let mut set = PollSet::new();
        set.add(3, Readiness::IN).unwrap();
        assert!(matches!(set.add(3, Readiness::OUT), Err(Error::Busy(_))));
        assert_eq!(set.len(), 1);
        assert_eq!(set.events(3), Some(Readiness::IN));
    }

    #[test]
    fn test_negative_fd_rejected() {
        let mut set = PollSet::new();
        assert!(matches!(set.add(-1, Readiness::IN), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_include_exclude_events() {
        let mut set = PollSet::new();
        set.add(5, Readiness::IN).unwrap();
        set.include_events(5, Readiness::OUT).unwrap();
        assert_eq!(set.events(5), Some(Readiness::IN | Readiness::OUT));
        set.exclude_events(5, Readiness::IN).unwrap();
        assert_eq!(set.events(5), Some(Readiness::OUT));
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut set = PollSet::new();
        for fd in [4, 5, 6, 7] {
            set.add(fd, Readiness::IN).unwrap();
        }
        set.remove(5).unwrap();
        assert_eq!(set.len(), 3);
        assert!(!set.contains(5));
        assert!(matches!(set.remove(5), Err(Error::InvalidArgument(_))));
        // Entries keep registration order after the compaction.
        assert!(set.contains(4) && set.contains(6) && set.contains(7));
    }

    #[test]
    fn test_absent_fd_lookups() {
        let set = PollSet::new();
        assert_eq!(set.events(9), None);
        assert_eq!(set.revents(9), None);
        assert_eq!(set.ready().count(), 0);
    }
}
