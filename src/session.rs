use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
};

use nix::errno::Errno;
use tracing::debug;

use crate::{
    error::{Result, ShellError},
    job::JobTable,
    signals::{self, Blocked, Gate},
};

struct TableCell(UnsafeCell<JobTable>);

// Only reached through `Blocked`, and the shell never spawns threads.
unsafe impl Sync for TableCell {}

static JOBS: TableCell = TableCell(UnsafeCell::new(JobTable::new()));

/// Set by the SIGCHLD handler when the foreground job exits or stops.
pub(crate) static FOREGROUND_WAKE: AtomicBool = AtomicBool::new(false);

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// The running shell: owns the job table and the signal handlers for the
/// lifetime of the process.
///
/// Signal handlers cannot carry context, so the table itself lives in a
/// static; `Session` is the only way the main flow reaches it.
pub struct Session {
    _single_threaded: PhantomData<*const ()>,
}

impl Session {
    pub fn install() -> Result<Self> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(ShellError::Signal(Errno::EBUSY));
        }
        signals::install_handlers().map_err(ShellError::Signal)?;
        debug!("signal handlers installed");
        Ok(Session {
            _single_threaded: PhantomData,
        })
    }

    /// Take the gate. Released when the returned guard drops.
    pub fn block(&self) -> Result<Blocked> {
        Gate::block().map_err(ShellError::Signal)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = signals::restore_defaults();
        INSTALLED.store(false, Ordering::SeqCst);
    }
}

impl Blocked {
    /// The job table. Borrowing through the guard keeps the access inside
    /// the blocked region.
    pub fn jobs(&mut self) -> &mut JobTable {
        // SAFETY: with the control signals blocked no handler can run, and
        // handlers only touch the table under their own guard. The borrow
        // ends before any `sigsuspend`, which needs `&mut self`.
        unsafe { &mut *JOBS.0.get() }
    }

    /// Block until the foreground job exits or stops.
    pub fn wait_foreground(&mut self) {
        FOREGROUND_WAKE.store(false, Ordering::SeqCst);
        if self.jobs().foreground_pid().is_none() {
            return;
        }
        self.suspend_until(&FOREGROUND_WAKE);
    }
}
