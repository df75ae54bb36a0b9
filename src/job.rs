use std::fmt;

use nix::unistd::Pid;

use crate::error::{Result, ShellError};

pub type JobId = usize;

/// Maximum number of jobs tracked at once.
pub const MAX_JOBS: usize = 16;
/// Stored command lines are cut to this many bytes.
pub const MAX_CMDLINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Foreground,
    Background,
    Stopped,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Foreground => "Foreground",
            JobState::Background => "Running",
            JobState::Stopped => "Stopped",
        })
    }
}

/// Inline copy of a command line.
///
/// Jobs are removed from inside the SIGCHLD handler, so nothing in the
/// table may own heap memory.
#[derive(Clone, Copy)]
struct CmdLine {
    buf: [u8; MAX_CMDLINE],
    len: usize,
}

impl CmdLine {
    fn new(s: &str) -> Self {
        let mut len = s.len().min(MAX_CMDLINE);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        let mut buf = [0; MAX_CMDLINE];
        buf[..len].copy_from_slice(&s.as_bytes()[..len]);
        CmdLine { buf, len }
    }

    fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }
}

impl fmt::Debug for CmdLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Job {
    pub id: JobId,
    /// Also the job's process group id.
    pub pid: Pid,
    pub state: JobState,
    cmdline: CmdLine,
}

impl Job {
    pub fn cmdline(&self) -> &str {
        self.cmdline.as_str()
    }
}

/// Formats the `jobs` listing line: `[1] (4242) Running sleep 10 &`
impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ({}) {} {}", self.id, self.pid, self.state, self.cmdline())
    }
}

/// Fixed-capacity registry of live jobs.
///
/// Callers are expected to hold the signal gate (see `signals::Gate`)
/// whenever a handler could race the access.
pub struct JobTable {
    slots: [Option<Job>; MAX_JOBS],
}

impl JobTable {
    pub const fn new() -> Self {
        const EMPTY: Option<Job> = None;
        Self { slots: [EMPTY; MAX_JOBS] }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    fn iter(&self) -> impl Iterator<Item = &Job> {
        self.slots.iter().flatten()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.slots.iter_mut().flatten()
    }

    /// Register a new job under the smallest free job id.
    pub fn add(&mut self, pid: Pid, state: JobState, cmdline: &str) -> Result<JobId> {
        debug_assert!(self.find_by_pid(pid).is_none(), "pid {pid} already tracked");
        debug_assert!(
            state != JobState::Foreground || self.foreground_pid().is_none(),
            "second foreground job"
        );

        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ShellError::TableFull)?;
        // With a free slot, at most MAX_JOBS - 1 ids are taken.
        let id = (1..=MAX_JOBS)
            .find(|id| self.find_by_id(*id).is_none())
            .ok_or(ShellError::TableFull)?;
        self.slots[index] = Some(Job {
            id,
            pid,
            state,
            cmdline: CmdLine::new(cmdline),
        });
        Ok(id)
    }

    /// Drop the job whose leader is `pid`. Returns whether one was tracked.
    pub fn remove(&mut self, pid: Pid) -> bool {
        match self.slots.iter_mut().find(|s| matches!(s, Some(job) if job.pid == pid)) {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    pub fn find_by_pid(&self, pid: Pid) -> Option<&Job> {
        self.iter().find(|job| job.pid == pid)
    }

    pub fn find_by_pid_mut(&mut self, pid: Pid) -> Option<&mut Job> {
        self.iter_mut().find(|job| job.pid == pid)
    }

    pub fn find_by_id(&self, id: JobId) -> Option<&Job> {
        self.iter().find(|job| job.id == id)
    }

    pub fn find_by_id_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.iter_mut().find(|job| job.id == id)
    }

    pub fn foreground_pid(&self) -> Option<Pid> {
        self.iter()
            .find(|job| job.state == JobState::Foreground)
            .map(|job| job.pid)
    }

    /// All live jobs in job id order.
    pub fn list(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.iter().collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    #[test]
    fn ids_start_at_one_and_reuse_the_smallest_gap() {
        let mut table = JobTable::new();
        assert_eq!(table.add(pid(100), JobState::Background, "a &").unwrap(), 1);
        assert_eq!(table.add(pid(101), JobState::Background, "b &").unwrap(), 2);
        assert_eq!(table.add(pid(102), JobState::Background, "c &").unwrap(), 3);

        assert!(table.remove(pid(101)));
        assert!(table.remove(pid(100)));
        assert_eq!(table.add(pid(103), JobState::Foreground, "d").unwrap(), 1);
        assert_eq!(table.add(pid(104), JobState::Background, "e &").unwrap(), 2);
    }

    #[test]
    fn lookups_report_not_found() {
        let mut table = JobTable::new();
        table.add(pid(7), JobState::Background, "sleep 1 &").unwrap();

        assert_eq!(table.find_by_id(1).map(|j| j.pid), Some(pid(7)));
        assert_eq!(table.find_by_pid(pid(7)).map(|j| j.id), Some(1));
        assert!(table.find_by_id(2).is_none());
        assert!(table.find_by_pid(pid(8)).is_none());
        assert!(!table.remove(pid(8)));
    }

    #[test]
    fn foreground_pid_follows_state_changes() {
        let mut table = JobTable::new();
        table.add(pid(10), JobState::Background, "bg &").unwrap();
        assert_eq!(table.foreground_pid(), None);

        table.add(pid(11), JobState::Foreground, "fg").unwrap();
        assert_eq!(table.foreground_pid(), Some(pid(11)));

        table.find_by_pid_mut(pid(11)).unwrap().state = JobState::Stopped;
        assert_eq!(table.foreground_pid(), None);

        table.find_by_id_mut(1).unwrap().state = JobState::Foreground;
        assert_eq!(table.foreground_pid(), Some(pid(10)));
    }

    #[test]
    fn add_fails_when_full_without_touching_entries() {
        let mut table = JobTable::new();
        for n in 0..MAX_JOBS {
            table.add(pid(1000 + n as i32), JobState::Background, "x &").unwrap();
        }
        assert!(table.is_full());
        assert!(matches!(
            table.add(pid(5000), JobState::Background, "y &"),
            Err(ShellError::TableFull)
        ));
        assert_eq!(table.len(), MAX_JOBS);
        assert!(table.find_by_pid(pid(5000)).is_none());
    }

    #[test]
    fn list_is_ordered_by_job_id() {
        let mut table = JobTable::new();
        for raw in [20, 21, 22] {
            table.add(pid(raw), JobState::Background, "job &").unwrap();
        }
        table.remove(pid(20));
        // Lands in the first slot but takes id 1 again.
        table.add(pid(23), JobState::Stopped, "late").unwrap();
        table.remove(pid(21));
        table.add(pid(24), JobState::Background, "later &").unwrap();

        let ids: Vec<JobId> = table.list().iter().map(|j| j.id).collect();
        assert_eq!(ids, [1, 2, 3]);
        assert_eq!(table.list()[0].to_string(), "[1] (23) Stopped late");
        assert_eq!(table.list()[1].to_string(), "[2] (24) Running later &");
    }

    #[test]
    fn long_command_lines_are_truncated_on_a_char_boundary() {
        let mut table = JobTable::new();
        let line = "é".repeat(MAX_CMDLINE);
        table.add(pid(1), JobState::Background, &line).unwrap();
        let stored = table.find_by_pid(pid(1)).unwrap().cmdline();
        assert!(stored.len() <= MAX_CMDLINE);
        assert!(line.starts_with(stored));
        assert_eq!(stored.len(), MAX_CMDLINE);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add { background: bool },
        Remove(usize),
        Stop(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(|background| Op::Add { background }),
            (0..MAX_JOBS * 2).prop_map(Op::Remove),
            (0..MAX_JOBS * 2).prop_map(Op::Stop),
        ]
    }

    proptest! {
        #[test]
        fn table_invariants_hold(ops in proptest::collection::vec(op(), 1..200)) {
            let mut table = JobTable::new();
            let mut next_pid = 1;

            for op in ops {
                match op {
                    Op::Add { background } => {
                        let state = if background || table.foreground_pid().is_some() {
                            JobState::Background
                        } else {
                            JobState::Foreground
                        };
                        let expected = (1..=MAX_JOBS).find(|id| table.find_by_id(*id).is_none());
                        let was_full = table.is_full();
                        match table.add(pid(next_pid), state, "cmd") {
                            Ok(id) => prop_assert_eq!(Some(id), expected),
                            Err(_) => prop_assert!(was_full),
                        }
                        next_pid += 1;
                    }
                    Op::Remove(n) => {
                        let target = table.list().get(n).map(|j| j.pid);
                        if let Some(job) = target {
                            prop_assert!(table.remove(job));
                        }
                    }
                    Op::Stop(n) => {
                        let target = table.list().get(n).map(|j| j.pid);
                        if let Some(job) = target {
                            table.find_by_pid_mut(job).unwrap().state = JobState::Stopped;
                        }
                    }
                }

                let jobs = table.list();
                let foreground = jobs.iter().filter(|j| j.state == JobState::Foreground).count();
                prop_assert!(foreground <= 1);
                for (i, a) in jobs.iter().enumerate() {
                    for b in &jobs[i + 1..] {
                        prop_assert_ne!(a.pid, b.pid);
                        prop_assert!(a.id < b.id);
                    }
                }
            }
        }
    }
}
