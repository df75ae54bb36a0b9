use std::{
    fs::File,
    io::{self, Write},
};

use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
};
use tracing::debug;

use crate::{
    error::{Result, ShellError},
    executor::open_output,
    job::{Job, JobState, JobTable},
    parser::{CommandLine, JobRef},
    signals::Blocked,
};

/// `jobs [> file]`
pub fn jobs(gate: &mut Blocked, cmd: &CommandLine) -> Result<()> {
    let listing = render_jobs(gate.jobs());
    match &cmd.outfile {
        Some(path) => File::from(open_output(path)?).write_all(listing.as_bytes())?,
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(listing.as_bytes())?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn render_jobs(jobs: &JobTable) -> String {
    jobs.list().iter().map(|job| format!("{job}\n")).collect()
}

/// `fg %N|PID`: resume the job in the foreground and wait for it.
pub fn fg(gate: &mut Blocked, cmd: &CommandLine) -> Result<()> {
    resume(gate, cmd, "fg", JobState::Foreground)?;
    gate.wait_foreground();
    Ok(())
}

/// `bg %N|PID`: resume the job in the background.
pub fn bg(gate: &mut Blocked, cmd: &CommandLine) -> Result<()> {
    let job = resume(gate, cmd, "bg", JobState::Background)?;
    println!("[{}] ({}) {}", job.id, job.pid, job.cmdline());
    Ok(())
}

fn resume(gate: &mut Blocked, cmd: &CommandLine, name: &'static str, state: JobState) -> Result<Job> {
    let job_ref = JobRef::parse(name, cmd.argv.get(1).map(String::as_str))?;
    let jobs = gate.jobs();
    let job = match job_ref {
        JobRef::Job(id) => jobs.find_by_id_mut(id),
        JobRef::Pid(pid) => jobs.find_by_pid_mut(pid),
    }
    .ok_or(ShellError::NoSuchJob(job_ref))?;

    job.state = state;
    let job = *job;
    debug!(id = job.id, pid = %job.pid, ?state, "resuming job");

    // The group may already be gone; its exit is still pending for the reaper.
    match killpg(job.pid, Signal::SIGCONT) {
        Ok(()) | Err(Errno::ESRCH) => Ok(job),
        Err(e) => Err(ShellError::Signal(e)),
    }
}
