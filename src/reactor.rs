//! Single-threaded poll reactor.
//!
//! One callback shape serves fd readiness, POSIX signals, and timers:
//! `FnMut(&mut Control, &LoopEvent) -> bool`, where returning `false` stops
//! the loop after the current dispatch pass. Handlers never touch the
//! reactor directly — they queue edits on the `Control` they are handed,
//! and the loop applies those edits at the top of the next iteration. That
//! keeps "callback mutates its own loop" well-defined and race-free.
//!
//! ## Signal delivery
//! On entry `run` blocks every signal on the calling thread and restores
//! the saved mask on exit. Registered signals are delivered through a
//! `signalfd` polled like any other descriptor (Linux), or through the
//! self-pipe pattern (elsewhere): a minimal `sigaction` handler writes the
//! signal number to a non-blocking pipe, and the registered signals are
//! unblocked only inside the poll wait. Either way a signal cannot slip
//! between the "should we keep waiting?" decision and the wait itself.
//!
//! The self-pipe write end lives in a process-wide slot installed on entry
//! and restored on exit, so loops may nest across invocations but a thread
//! cannot re-enter `run` (the running guard refuses).
//!
//! ## Ordering
//! Within one iteration: due timers fire first in fire-time order, then
//! active fds in vector order; signals drain in arrival order when their
//! descriptor comes up in that scan.

use std::any::Any;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pollset::{PollSet, Readiness};
use crate::sched::{Cycles, Event, Scheduler};
use crate::sigset::SigSet;
use crate::timespec::TimeSpec;

/// What a handler is being told about.
#[derive(Debug)]
pub enum LoopEvent<'a> {
    /// An fd from `add_fd` became active; `revents` is the kernel's answer.
    Fd { fd: RawFd, revents: Readiness },
    /// A registered signal arrived.
    Signal { signo: i32 },
    /// A timer fired. `event` is `Some` only when the timer was periodic
    /// and has been re-armed — the handle can then cancel the remainder.
    Timer { id: u32, event: Option<&'a Event> },
}

/// Handler contract shared by all three event kinds. Return `false` to
/// stop the loop after the current dispatch pass.
pub type Handler = Box<dyn FnMut(&mut Control, &LoopEvent<'_>) -> bool>;

/// Timer payload holding the handler (or `None` for "use the loop
/// default"). Shared via `Rc` between the scheduler's copy of the event
/// and the copies `pop` hands back.
struct TimerSlot {
    handler: RefCell<Option<Handler>>,
}

enum Op {
    AddFd { fd: RawFd, interest: Readiness, handler: Option<Handler> },
    IncludeFd { fd: RawFd, interest: Readiness },
    ExcludeFd { fd: RawFd, interest: Readiness },
    DelFd { fd: RawFd },
    DelFdAll,
    AddSignal { signo: i32, handler: Option<Handler> },
    DelSignal { signo: i32 },
    DelSignalAll,
    AddOnce { at: Option<TimeSpec>, id: u32, handler: Option<Handler> },
    AddOnceDelayed { interval: TimeSpec, id: u32, handler: Option<Handler> },
    AddPeriodic { at: Option<TimeSpec>, id: u32, handler: Option<Handler>, period: TimeSpec, cycles: Cycles },
    AddPeriodicDelayed { id: u32, handler: Option<Handler>, period: TimeSpec, cycles: Cycles },
    DelSched { ev: Event },
    DelSchedById { id: u32 },
    DelSchedAll,
}

/// Deferred-edit queue handed to every handler. Edits apply at the top of
/// the next loop iteration, never mid-dispatch.
#[derive(Default)]
pub struct Control {
    ops: Vec<Op>,
    stop: bool,
}

impl Control {
    pub fn add_fd(&mut self, fd: RawFd, interest: Readiness, handler: Option<Handler>) {
        self.ops.push(Op::AddFd { fd, interest, handler });
    }

    pub fn include_fd_event(&mut self, fd: RawFd, interest: Readiness) {
        self.ops.push(Op::IncludeFd { fd, interest });
    }

    pub fn exclude_fd_event(&mut self, fd: RawFd, interest: Readiness) {
        self.ops.push(Op::ExcludeFd { fd, interest });
    }

    pub fn del_fd(&mut self, fd: RawFd) {
        self.ops.push(Op::DelFd { fd });
    }

    pub fn del_fd_all(&mut self) {
        self.ops.push(Op::DelFdAll);
    }

    pub fn add_signal(&mut self, signo: i32, handler: Option<Handler>) {
        self.ops.push(Op::AddSignal { signo, handler });
    }

    pub fn del_signal(&mut self, signo: i32) {
        self.ops.push(Op::DelSignal { signo });
    }

    pub fn del_signal_all(&mut self) {
        self.ops.push(Op::DelSignalAll);
    }

    pub fn add_once(&mut self, at: Option<TimeSpec>, id: u32, handler: Option<Handler>) {
        self.ops.push(Op::AddOnce { at, id, handler });
    }

    pub fn add_once_delayed(&mut self, interval: TimeSpec, id: u32, handler: Option<Handler>) {
        self.ops.push(Op::AddOnceDelayed { interval, id, handler });
    }

    pub fn add_periodic(
        &mut self,
        at: Option<TimeSpec>,
        id: u32,
        handler: Option<Handler>,
        period: TimeSpec,
        cycles: Cycles,
    ) {
        self.ops.push(Op::AddPeriodic { at, id, handler, period, cycles });
    }

    pub fn add_periodic_delayed(&mut self, id: u32, handler: Option<Handler>, period: TimeSpec, cycles: Cycles) {
        self.ops.push(Op::AddPeriodicDelayed { id, handler, period, cycles });
    }

    pub fn del_sched(&mut self, ev: &Event) {
        self.ops.push(Op::DelSched { ev: ev.clone() });
    }

    pub fn del_sched_by_id(&mut self, id: u32) {
        self.ops.push(Op::DelSchedById { id });
    }

    pub fn del_sched_all(&mut self) {
        self.ops.push(Op::DelSchedAll);
    }

    /// Equivalent to a handler returning `false`.
    pub fn quit(&mut self) {
        self.stop = true;
    }
}

struct FdReg {
    fd: RawFd,
    handler: Option<Handler>,
}

struct SigReg {
    signo: i32,
    handler: Option<Handler>,
}

pub struct Reactor {
    sched: Scheduler,
    pollset: PollSet,
    fd_regs: Vec<FdReg>,
    sig_regs: Vec<SigReg>,
    default_handler: Option<Handler>,
    running: bool,
    /// Signal registrations changed; the delivery path needs re-arming.
    sig_dirty: bool,
}

impl Reactor {
    /// `default_handler` serves any registration made without its own
    /// handler. Events with neither are dropped with a debug note.
    pub fn new(default_handler: Option<Handler>) -> Reactor {
        Reactor {
            sched: Scheduler::new(),
            pollset: PollSet::new(),
            fd_regs: Vec::new(),
            sig_regs: Vec::new(),
            default_handler,
            running: false,
            sig_dirty: false,
        }
    }

    // ── fd registrations ──────────────────────────────────────────────

    pub fn add_fd(&mut self, fd: RawFd, interest: Readiness, handler: Option<Handler>) -> Result<()> {
        self.pollset.add(fd, interest)?;
        self.fd_regs.push(FdReg { fd, handler });
        Ok(())
    }

    pub fn include_fd_event(&mut self, fd: RawFd, interest: Readiness) -> Result<()> {
        if !self.fd_regs.iter().any(|r| r.fd == fd) {
            return Err(Error::InvalidArgument("fd not registered"));
        }
        self.pollset.include_events(fd, interest)
    }

    pub fn exclude_fd_event(&mut self, fd: RawFd, interest: Readiness) -> Result<()> {
        if !self.fd_regs.iter().any(|r| r.fd == fd) {
            return Err(Error::InvalidArgument("fd not registered"));
        }
        self.pollset.exclude_events(fd, interest)
    }

    pub fn del_fd(&mut self, fd: RawFd) -> Result<()> {
        let before = self.fd_regs.len();
        self.fd_regs.retain(|r| r.fd != fd);
        if self.fd_regs.len() == before {
            return Err(Error::InvalidArgument("fd not registered"));
        }
        self.pollset.remove(fd)
    }

    pub fn del_fd_all(&mut self) {
        for reg in self.fd_regs.drain(..) {
            // The signal descriptor is not in fd_regs, so it survives.
            let _ = self.pollset.remove(reg.fd);
        }
    }

    // ── signal registrations ──────────────────────────────────────────

    /// Register a handler for `signo`; re-adding replaces the previous
    /// registration.
    pub fn add_signal(&mut self, signo: i32, handler: Option<Handler>) -> Result<()> {
        // Borrow sigaddset's validation for the signo range.
        SigSet::empty().add(signo)?;
        if let Some(reg) = self.sig_regs.iter_mut().find(|r| r.signo == signo) {
            reg.handler = handler;
        } else {
            self.sig_regs.push(SigReg { signo, handler });
            self.sig_dirty = true;
        }
        Ok(())
    }

    pub fn del_signal(&mut self, signo: i32) -> Result<()> {
        let before = self.sig_regs.len();
        self.sig_regs.retain(|r| r.signo != signo);
        if self.sig_regs.len() == before {
            return Err(Error::InvalidArgument("signal not registered"));
        }
        self.sig_dirty = true;
        Ok(())
    }

    pub fn del_signal_all(&mut self) {
        if !self.sig_regs.is_empty() {
            self.sig_regs.clear();
            self.sig_dirty = true;
        }
    }

    fn registered_sigset(&self) -> SigSet {
        let mut set = SigSet::empty();
        for reg in &self.sig_regs {
            // Validated at registration time.
            let _ = set.add(reg.signo);
        }
        set
    }

    // ── timers ────────────────────────────────────────────────────────

    fn timer_payload(handler: Option<Handler>) -> Rc<dyn Any> {
        Rc::new(TimerSlot { handler: RefCell::new(handler) })
    }

    pub fn add_once(&mut self, at: Option<TimeSpec>, id: u32, handler: Option<Handler>) -> Result<Event> {
        self.sched.schedule_once(at, id, Self::timer_payload(handler))
    }

    pub fn add_once_delayed(&mut self, interval: TimeSpec, id: u32, handler: Option<Handler>) -> Result<Event> {
        self.sched.schedule_once_delayed(interval, id, Self::timer_payload(handler))
    }

    pub fn add_periodic(
        &mut self,
        at: Option<TimeSpec>,
        id: u32,
        handler: Option<Handler>,
        period: TimeSpec,
        cycles: Cycles,
    ) -> Result<Event> {
        self.sched.schedule_periodic(at, id, Self::timer_payload(handler), period, cycles)
    }

    pub fn add_periodic_delayed(
        &mut self,
        id: u32,
        handler: Option<Handler>,
        period: TimeSpec,
        cycles: Cycles,
    ) -> Result<Event> {
        self.sched.schedule_periodic_delayed(id, Self::timer_payload(handler), period, cycles)
    }

    pub fn del_sched(&mut self, ev: &Event) -> usize {
        self.sched.remove_event(ev)
    }

    pub fn del_sched_by_id(&mut self, id: u32) -> usize {
        self.sched.remove_by_id(id)
    }

    pub fn del_sched_all(&mut self) {
        self.sched.clear();
    }

    // ── the loop ──────────────────────────────────────────────────────

    /// Run until a handler asks to stop (`Ok`) or the multiplexer fails
    /// (`Err`). Refuses nesting.
    pub fn run(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::Busy("loop already running"));
        }
        self.running = true;
        let out = self.run_guarded();
        self.running = false;
        out
    }

    fn run_guarded(&mut self) -> Result<()> {
        let saved_mask = SigSet::full().swap_thread_mask()?;
        let out = match SignalPath::new() {
            Ok(mut path) => {
                let sig_fd = path.fd();
                let out = match self.pollset.add(sig_fd, Readiness::IN) {
                    Ok(()) => {
                        self.sig_dirty = true;
                        let out = self.poll_loop(&mut path);
                        let _ = self.pollset.remove(sig_fd);
                        out
                    }
                    Err(e) => Err(e),
                };
                // Dropping the path restores dispositions / closes fds.
                drop(path);
                out
            }
            Err(e) => Err(e),
        };
        let _ = saved_mask.swap_thread_mask();
        debug!("event loop finished");
        out
    }

    fn poll_loop(&mut self, path: &mut SignalPath) -> Result<()> {
        let mut ctl = Control::default();
        debug!("event loop entered");

        loop {
            self.apply_ops(&mut ctl);
            if ctl.stop {
                return Ok(());
            }
            if self.sig_dirty {
                path.rearm(&self.registered_sigset())?;
                self.sig_dirty = false;
            }

            let timeout = self.sched.next_interval();
            let rc = path.wait(&mut self.pollset, timeout)?;

            // Due timers go first, in fire-time order.
            while let Some(ev) = self.sched.pop() {
                let slot = ev.payload().clone();
                let info = LoopEvent::Timer { id: ev.id(), event: if ev.busy() { Some(&ev) } else { None } };
                let keep = match slot.downcast::<TimerSlot>() {
                    Ok(slot) => {
                        let mut h = slot.handler.borrow_mut();
                        invoke(h.as_mut().or(self.default_handler.as_mut()), &mut ctl, &info)
                    }
                    Err(_) => invoke(self.default_handler.as_mut(), &mut ctl, &info),
                };
                if !keep {
                    ctl.stop = true;
                }
            }

            if rc > 0 {
                let ready: Vec<(RawFd, Readiness)> = self.pollset.ready().collect();
                for (fd, revents) in ready {
                    if fd == path.fd() {
                        while let Some(signo) = path.next_signal() {
                            let (regs, def) = (&mut self.sig_regs, &mut self.default_handler);
                            let info = LoopEvent::Signal { signo };
                            let keep = match regs.iter_mut().find(|r| r.signo == signo) {
                                Some(reg) => invoke(reg.handler.as_mut().or(def.as_mut()), &mut ctl, &info),
                                None => {
                                    debug!(signo, "dropping unregistered signal");
                                    true
                                }
                            };
                            if !keep {
                                ctl.stop = true;
                            }
                        }
                    } else {
                        let (regs, def) = (&mut self.fd_regs, &mut self.default_handler);
                        let info = LoopEvent::Fd { fd, revents };
                        let keep = match regs.iter_mut().find(|r| r.fd == fd) {
                            Some(reg) => invoke(reg.handler.as_mut().or(def.as_mut()), &mut ctl, &info),
                            None => {
                                debug!(fd, "active fd has no registration");
                                true
                            }
                        };
                        if !keep {
                            ctl.stop = true;
                        }
                    }
                }
            }

            if ctl.stop {
                return Ok(());
            }
        }
    }

    /// Apply the edits handlers queued during the last dispatch pass.
    /// Failures here have nowhere to return to, so they are logged and
    /// skipped.
    fn apply_ops(&mut self, ctl: &mut Control) {
        for op in ctl.ops.drain(..).collect::<Vec<_>>() {
            let outcome = match op {
                Op::AddFd { fd, interest, handler } => self.add_fd(fd, interest, handler),
                Op::IncludeFd { fd, interest } => self.include_fd_event(fd, interest),
                Op::ExcludeFd { fd, interest } => self.exclude_fd_event(fd, interest),
                Op::DelFd { fd } => self.del_fd(fd),
                Op::DelFdAll => {
                    self.del_fd_all();
                    Ok(())
                }
                Op::AddSignal { signo, handler } => self.add_signal(signo, handler),
                Op::DelSignal { signo } => self.del_signal(signo),
                Op::DelSignalAll => {
                    self.del_signal_all();
                    Ok(())
                }
                Op::AddOnce { at, id, handler } => self.add_once(at, id, handler).map(|_| ()),
                Op::AddOnceDelayed { interval, id, handler } => {
                    self.add_once_delayed(interval, id, handler).map(|_| ())
                }
                Op::AddPeriodic { at, id, handler, period, cycles } => {
                    self.add_periodic(at, id, handler, period, cycles).map(|_| ())
                }
                Op::AddPeriodicDelayed { id, handler, period, cycles } => {
                    self.add_periodic_delayed(id, handler, period, cycles).map(|_| ())
                }
                Op::DelSched { ev } => {
                    self.del_sched(&ev);
                    Ok(())
                }
                Op::DelSchedById { id } => {
                    self.del_sched_by_id(id);
                    Ok(())
                }
                Op::DelSchedAll => {
                    self.del_sched_all();
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                warn!(error = %e, "deferred loop edit failed");
            }
        }
    }
}

fn invoke(handler: Option<&mut Handler>, ctl: &mut Control, info: &LoopEvent<'_>) -> bool {
    match handler {
        Some(h) => h(ctl, info),
        None => {
            debug!("event without handler dropped");
            true
        }
    }
}

// ── platform signal delivery ──────────────────────────────────────────

/// Linux: a signalfd covering the registered set, polled like any fd.
#[cfg(target_os = "linux")]
struct SignalPath {
    sfd: RawFd,
}

#[cfg(target_os = "linux")]
impl SignalPath {
    fn new() -> Result<SignalPath> {
        let empty = SigSet::empty();
        let sfd = unsafe { libc::signalfd(-1, empty.as_ptr(), libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        if sfd < 0 {
            return Err(Error::last_os());
        }
        debug!(sfd, "signal delivery via signalfd");
        Ok(SignalPath { sfd })
    }

    fn fd(&self) -> RawFd {
        self.sfd
    }

    /// Point the signalfd at the current registration set. Signals stay
    /// blocked on the thread; the descriptor is the only delivery route.
    fn rearm(&mut self, set: &SigSet) -> Result<()> {
        if unsafe { libc::signalfd(self.sfd, set.as_ptr(), libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) } < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    fn wait(&mut self, pollset: &mut PollSet, timeout: Option<TimeSpec>) -> Result<i32> {
        loop {
            let ts = timeout.map(|t| t.as_libc());
            let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |t| t as *const libc::timespec);
            // Everything stays blocked during the wait; signalfd reports.
            let mask = SigSet::full();
            let rc = unsafe { libc::ppoll(pollset.as_mut_ptr(), pollset.nfds(), ts_ptr, mask.as_ptr()) };
            if rc < 0 {
                match std::io::Error::last_os_error().raw_os_error() {
                    Some(libc::EINTR) => continue,
                    _ => return Err(Error::last_os()),
                }
            }
            return Ok(rc);
        }
    }

    /// One queued signal, if any.
    fn next_signal(&mut self) -> Option<i32> {
        let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
        let want = std::mem::size_of::<libc::signalfd_siginfo>();
        let n = unsafe { libc::read(self.sfd, &mut info as *mut _ as *mut libc::c_void, want) };
        if n == want as isize {
            Some(info.ssi_signo as i32)
        } else {
            None
        }
    }
}

#[cfg(target_os = "linux")]
impl Drop for SignalPath {
    fn drop(&mut self) {
        unsafe { libc::close(self.sfd) };
    }
}

/// Portable fallback: self-pipe plus a shared sigaction handler. The
/// handler does the minimum — write the signal number to the pipe — and
/// takes the write fd from a process-wide slot that `run` installs on
/// entry and restores on exit.
#[cfg(not(target_os = "linux"))]
static SELF_PIPE_WFD: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(-1);

#[cfg(not(target_os = "linux"))]
extern "C" fn self_pipe_handler(signo: libc::c_int) {
    use std::sync::atomic::Ordering::Relaxed;
    let wfd = SELF_PIPE_WFD.load(Relaxed);
    if wfd >= 0 {
        let payload = signo;
        unsafe {
            libc::write(
                wfd,
                &payload as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>(),
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
struct SignalPath {
    rfd: RawFd,
    wfd: RawFd,
    prev_wfd: i32,
    /// Installed dispositions to put back on teardown.
    installed: Vec<(i32, libc::sigaction)>,
    /// Mask in effect during the wait: everything blocked except the
    /// registered signals, so their handlers can run only there.
    wait_mask: SigSet,
}

#[cfg(not(target_os = "linux"))]
impl SignalPath {
    fn new() -> Result<SignalPath> {
        use std::sync::atomic::Ordering::Relaxed;

        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::last_os());
        }
        for fd in fds {
            unsafe {
                let fl = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK);
                let fdfl = libc::fcntl(fd, libc::F_GETFD);
                libc::fcntl(fd, libc::F_SETFD, fdfl | libc::FD_CLOEXEC);
            }
        }
        let prev_wfd = SELF_PIPE_WFD.swap(fds[1], Relaxed);
        debug!(rfd = fds[0], wfd = fds[1], "signal delivery via self-pipe");
        Ok(SignalPath {
            rfd: fds[0],
            wfd: fds[1],
            prev_wfd,
            installed: Vec::new(),
            wait_mask: SigSet::full(),
        })
    }

    fn fd(&self) -> RawFd {
        self.rfd
    }

    fn rearm(&mut self, set: &SigSet) -> Result<()> {
        // Put back dispositions for signals no longer registered.
        self.installed.retain(|(signo, prev)| {
            if set.contains(*signo) {
                true
            } else {
                unsafe { libc::sigaction(*signo, prev, std::ptr::null_mut()) };
                false
            }
        });

        let mut wait_mask = SigSet::full();
        for signo in 1..libc::NSIG {
            if !set.contains(signo) {
                continue;
            }
            let _ = wait_mask.remove(signo);
            if self.installed.iter().any(|(s, _)| *s == signo) {
                continue;
            }
            let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
            action.sa_sigaction = self_pipe_handler as usize;
            unsafe { libc::sigfillset(&mut action.sa_mask) };
            let mut prev: libc::sigaction = unsafe { std::mem::zeroed() };
            if unsafe { libc::sigaction(signo, &action, &mut prev) } != 0 {
                return Err(Error::last_os());
            }
            self.installed.push((signo, prev));
        }
        self.wait_mask = wait_mask;
        Ok(())
    }

    fn wait(&mut self, pollset: &mut PollSet, timeout: Option<TimeSpec>) -> Result<i32> {
        loop {
            let ms = timeout.map_or(-1, |t| {
                (t.as_nanos() / 1_000_000).min(libc::c_int::MAX as i128) as libc::c_int
            });
            // Registered signals are deliverable only inside this window.
            let prev = self.wait_mask.swap_thread_mask()?;
            let rc = unsafe { libc::poll(pollset.as_mut_ptr(), pollset.nfds(), ms) };
            let _ = prev.swap_thread_mask();
            if rc < 0 {
                match std::io::Error::last_os_error().raw_os_error() {
                    Some(libc::EINTR) => continue,
                    _ => return Err(Error::last_os()),
                }
            }
            return Ok(rc);
        }
    }

    fn next_signal(&mut self) -> Option<i32> {
        let mut signo: libc::c_int = 0;
        let n = unsafe {
            libc::read(
                self.rfd,
                &mut signo as *mut libc::c_int as *mut libc::c_void,
                std::mem::size_of::<libc::c_int>(),
            )
        };
        if n == std::mem::size_of::<libc::c_int>() as isize {
            Some(signo)
        } else {
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl Drop for SignalPath {
    fn drop(&mut self) {
        use std::sync::atomic::Ordering::Relaxed;
        for (signo, prev) in self.installed.drain(..) {
            unsafe { libc::sigaction(signo, &prev, std::ptr::null_mut()) };
        }
        SELF_PIPE_WFD.store(self.prev_wfd, Relaxed);
        unsafe {
            libc::close(self.rfd);
            libc::close(self.wfd);
        }
    }
}
