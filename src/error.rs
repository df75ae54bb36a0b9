use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

use crate::parser::{JobRef, JobRefError, ParseError};

/// Everything `eval` can report back to the read loop.
///
/// None of these are fatal to the shell; the loop prints them and
/// re-issues the prompt.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    JobRef(#[from] JobRefError),

    #[error("{job_ref}: No such {noun}", job_ref = .0, noun = noun(.0))]
    NoSuchJob(JobRef),

    #[error("tried to create too many jobs")]
    TableFull,

    #[error("fork error: {0}")]
    Fork(Errno),

    #[error("{}: {source}", path.display())]
    Redirect {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("signal error: {0}")]
    Signal(Errno),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn noun(job_ref: &JobRef) -> &'static str {
    match job_ref {
        JobRef::Job(_) => "job",
        JobRef::Pid(_) => "process",
    }
}

pub type Result<T, E = ShellError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn no_such_job_names_the_reference() {
        let err = ShellError::NoSuchJob(JobRef::Job(3));
        assert_eq!(err.to_string(), "%3: No such job");

        let err = ShellError::NoSuchJob(JobRef::Pid(Pid::from_raw(4242)));
        assert_eq!(err.to_string(), "(4242): No such process");
    }

    #[test]
    fn redirect_error_mentions_path() {
        let err = ShellError::Redirect {
            path: PathBuf::from("/nope/out.txt"),
            source: Errno::ENOENT,
        };
        assert!(err.to_string().starts_with("/nope/out.txt: "));
    }
}
