//! Signal masking and the shell's signal handlers.
//!
//! Blocking SIGCHLD, SIGINT and SIGTSTP as a set is the only mutual
//! exclusion the shell has: the job table is touched either by the main
//! flow or by one of the handlers below, and every handler runs with the
//! whole set blocked. Code running inside a handler is limited to the job
//! table and [`Notice`]; it must not allocate, lock, or log.

use std::{
    fmt::{self, Write as _},
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
};

use libc::c_int;
use nix::{
    errno::Errno,
    sys::{
        signal::{
            killpg, sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow,
            Signal,
        },
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

use crate::{
    job::{JobState, JobTable},
    session::FOREGROUND_WAKE,
};

fn control_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTSTP);
    set
}

/// Block/unblock discipline around job table access.
pub struct Gate;

impl Gate {
    /// Block the control signals, remembering the mask that was active.
    pub fn block() -> nix::Result<Blocked> {
        let mut previous = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&control_signals()), Some(&mut previous))?;
        Ok(Blocked {
            previous,
            _not_send: PhantomData,
        })
    }

    /// Clear the whole mask, including signals blocked by whoever started
    /// the shell. Used in a freshly forked child before exec.
    pub fn unblock_all() -> nix::Result<()> {
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
    }
}

/// Proof that the control signals are blocked on this thread.
///
/// Dropping it restores exactly the mask that was in place before
/// [`Gate::block`], so nested guards unwind correctly.
pub struct Blocked {
    previous: SigSet,
    _not_send: PhantomData<*const ()>,
}

impl Blocked {
    /// Sleep with the pre-block mask installed until `wake` is set.
    ///
    /// `sigsuspend` swaps the mask and sleeps in one step, so a SIGCHLD
    /// that arrives after the flag check is delivered inside the suspend
    /// rather than lost. Returns with the signals blocked again and the
    /// flag cleared.
    pub fn suspend_until(&mut self, wake: &AtomicBool) {
        while !wake.swap(false, Ordering::SeqCst) {
            // EINTR is the normal return once a handler has run.
            let _ = self.previous.suspend();
        }
    }
}

impl Drop for Blocked {
    fn drop(&mut self) {
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

/// Async-signal-safe output: formats into a stack buffer and hands it to
/// `write(2)` in one call. Output longer than the buffer is cut.
pub struct Notice {
    buf: [u8; 256],
    len: usize,
}

impl Notice {
    pub fn new() -> Self {
        Notice { buf: [0; 256], len: 0 }
    }

    #[cfg(test)]
    fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }

    pub fn emit(&self, fd: c_int) {
        let mut rest = &self.buf[..self.len];
        while !rest.is_empty() {
            let n = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };
            match n {
                n if n > 0 => rest = &rest[n as usize..],
                -1 if Errno::last() == Errno::EINTR => continue,
                _ => break,
            }
        }
    }
}

impl fmt::Write for Notice {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

fn notify(args: fmt::Arguments<'_>) {
    let mut notice = Notice::new();
    let _ = notice.write_fmt(args);
    notice.emit(libc::STDOUT_FILENO);
}

/// Execution context of a handler: errno is saved on entry and the
/// control signals stay blocked until the scope ends.
struct HandlerScope {
    gate: Blocked,
    _errno: SavedErrno,
}

struct SavedErrno(i32);

impl Drop for SavedErrno {
    fn drop(&mut self) {
        Errno::set_raw(self.0);
    }
}

impl HandlerScope {
    fn enter() -> Option<Self> {
        let errno = SavedErrno(Errno::last_raw());
        let gate = Gate::block().ok()?;
        Some(HandlerScope {
            gate,
            _errno: errno,
        })
    }

    fn jobs(&mut self) -> &mut JobTable {
        self.gate.jobs()
    }
}

/// Update the table for one reported child state change.
///
/// Returns true when the child was the foreground job.
fn record_status(jobs: &mut JobTable, status: WaitStatus) -> bool {
    let Some(pid) = status.pid() else {
        return false;
    };
    let was_foreground = jobs.foreground_pid() == Some(pid);

    match status {
        WaitStatus::Exited(..) => {
            jobs.remove(pid);
        }
        WaitStatus::Signaled(_, signal, _) => {
            if let Some(job) = jobs.find_by_pid(pid) {
                notify(format_args!(
                    "Job [{}] ({}) terminated by signal {}\n",
                    job.id, pid, signal as i32
                ));
            }
            jobs.remove(pid);
        }
        WaitStatus::Stopped(_, signal) => {
            if let Some(job) = jobs.find_by_pid_mut(pid) {
                job.state = JobState::Stopped;
                notify(format_args!(
                    "Job [{}] ({}) stopped by signal {}\n",
                    job.id, pid, signal as i32
                ));
            }
        }
        _ => return false,
    }
    was_foreground
}

extern "C" fn on_sigchld(_: c_int) {
    let Some(mut scope) = HandlerScope::enter() else {
        return;
    };
    let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED;

    // One delivery may stand for several children; drain them all.
    loop {
        match waitpid(Pid::from_raw(-1), Some(flags)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(status) => {
                if record_status(scope.jobs(), status) {
                    FOREGROUND_WAKE.store(true, Ordering::SeqCst);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(_) => {
                notify(format_args!("waitpid error\n"));
                unsafe { libc::_exit(1) };
            }
        }
    }
}

/// Relay a keyboard signal to the foreground job's process group.
fn forward(signal: Signal) {
    let Some(mut scope) = HandlerScope::enter() else {
        return;
    };
    if let Some(pid) = scope.jobs().foreground_pid() {
        let _ = killpg(pid, signal);
    }
}

extern "C" fn on_sigint(_: c_int) {
    forward(Signal::SIGINT);
}

extern "C" fn on_sigtstp(_: c_int) {
    forward(Signal::SIGTSTP);
}

extern "C" fn on_sigquit(_: c_int) {
    notify(format_args!("Terminating after receipt of SIGQUIT signal\n"));
    unsafe { libc::_exit(1) };
}

/// Install the shell's handlers. Each runs with the control signals
/// blocked and interrupted system calls restarted.
pub fn install_handlers() -> nix::Result<()> {
    let handled: [(Signal, extern "C" fn(c_int)); 4] = [
        (Signal::SIGCHLD, on_sigchld),
        (Signal::SIGINT, on_sigint),
        (Signal::SIGTSTP, on_sigtstp),
        (Signal::SIGQUIT, on_sigquit),
    ];
    for (signal, handler) in handled {
        let action = SigAction::new(
            SigHandler::Handler(handler),
            SaFlags::SA_RESTART,
            control_signals(),
        );
        unsafe { sigaction(signal, &action) }?;
    }

    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGTTIN, &ignore)?;
        sigaction(Signal::SIGTTOU, &ignore)?;
    }
    Ok(())
}

/// Put every signal the shell touches back to its default disposition.
pub fn restore_defaults() -> nix::Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in [
        Signal::SIGCHLD,
        Signal::SIGINT,
        Signal::SIGTSTP,
        Signal::SIGQUIT,
        Signal::SIGTTIN,
        Signal::SIGTTOU,
    ] {
        unsafe { sigaction(signal, &default) }?;
    }
    Ok(())
}
