use std::{
    env,
    ffi::{CStr, CString},
    io::{self, Write},
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd},
        unix::ffi::OsStringExt,
    },
    path::{Path, PathBuf},
};

use libc::{STDIN_FILENO, STDOUT_FILENO};
use nix::{
    errno::Errno,
    fcntl::{open, OFlag},
    sys::{
        signal::{kill, Signal},
        stat::Mode,
    },
    unistd::{dup2, execv, fork, setpgid, ForkResult, Pid},
};
use tracing::{debug, warn};

use crate::{
    builtins,
    error::{Result, ShellError},
    job::JobState,
    parser::{parse_line, Builtin, CommandLine, Parsed},
    session::Session,
    signals::{self, Blocked, Gate},
};

/// What the read loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Quit,
}

/// Evaluate one command line.
///
/// The gate is taken before anything else and released when this returns,
/// on every path. A foreground command (or `fg`) returns only once its job
/// has exited or stopped. Command errors are reported before the gate is
/// released, so no handler notice lands in the middle of one; the error
/// is still returned to the caller.
pub fn eval(session: &Session, cmdline: &str) -> Result<Control> {
    let mut gate = session.block().inspect_err(|e| println!("{e}"))?;

    let result = dispatch(&mut gate, cmdline);
    if let Err(e) = &result {
        report(&gate, e, &mut io::stdout().lock())?;
    }
    result
}

/// Print a command error. Parse errors are silent.
fn report(_gate: &Blocked, err: &ShellError, out: &mut impl Write) -> io::Result<()> {
    if let ShellError::Parse(e) = err {
        debug!(%e, "ignoring command line");
        return Ok(());
    }
    writeln!(out, "{err}")?;
    out.flush()
}

fn dispatch(gate: &mut Blocked, cmdline: &str) -> Result<Control> {
    let cmd = match parse_line(cmdline)? {
        Parsed::Empty => return Ok(Control::Continue),
        Parsed::Command(cmd) => cmd,
    };

    match cmd.builtin {
        Builtin::Quit => return Ok(Control::Quit),
        Builtin::Jobs => builtins::jobs(gate, &cmd)?,
        Builtin::Fg => builtins::fg(gate, &cmd)?,
        Builtin::Bg => builtins::bg(gate, &cmd)?,
        Builtin::None => launch(gate, &cmd, cmdline)?,
    }
    Ok(Control::Continue)
}

/// Descriptors a command's stdin/stdout are redirected to.
pub struct Redirect {
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
}

impl Redirect {
    pub fn open(cmd: &CommandLine) -> Result<Self> {
        Ok(Redirect {
            stdin: cmd.infile.as_deref().map(open_input).transpose()?,
            stdout: cmd.outfile.as_deref().map(open_output).transpose()?,
        })
    }

    fn apply(&self) -> nix::Result<()> {
        if let Some(fd) = &self.stdin {
            dup2(fd.as_raw_fd(), STDIN_FILENO)?;
        }
        if let Some(fd) = &self.stdout {
            dup2(fd.as_raw_fd(), STDOUT_FILENO)?;
        }
        Ok(())
    }
}

fn open_fd(path: &Path, flags: OFlag) -> Result<OwnedFd> {
    let mode = Mode::from_bits_truncate(0o644);
    let fd = open(path, flags | OFlag::O_CLOEXEC, mode).map_err(|source| ShellError::Redirect {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), fd, "opened redirection target");
    // SAFETY: `open` just returned this descriptor and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn open_input(path: &Path) -> Result<OwnedFd> {
    open_fd(path, OFlag::O_RDONLY)
}

pub fn open_output(path: &Path) -> Result<OwnedFd> {
    open_fd(path, OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC)
}

/// Search PATH for `program` unless it already names a path.
fn resolve_program(program: &str) -> PathBuf {
    if program.contains('/') {
        return PathBuf::from(program);
    }
    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            let candidate = dir.join(program);
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from(program)
}

fn c_string(bytes: impl Into<Vec<u8>>) -> Result<CString> {
    CString::new(bytes).map_err(|e| ShellError::Io(io::Error::from(e)))
}

fn launch(gate: &mut Blocked, cmd: &CommandLine, cmdline: &str) -> Result<()> {
    if gate.jobs().is_full() {
        return Err(ShellError::TableFull);
    }

    let program = c_string(resolve_program(&cmd.argv[0]).into_os_string().into_vec())?;
    let argv = cmd
        .argv
        .iter()
        .map(|arg| c_string(arg.as_bytes()))
        .collect::<Result<Vec<_>>>()?;
    let redirect = Redirect::open(cmd)?;

    // Nothing buffered may be duplicated into the child.
    io::stdout().flush()?;

    // SAFETY: the shell is single-threaded.
    match unsafe { fork() }.map_err(ShellError::Fork)? {
        ForkResult::Child => exec_child(&program, &argv, &redirect),
        ForkResult::Parent { child } => {
            // Also done by the child; whichever runs first wins, the other
            // may see EACCES after exec.
            let _ = setpgid(child, child);
            drop(redirect);

            let state = if cmd.background {
                JobState::Background
            } else {
                JobState::Foreground
            };
            let id = match gate.jobs().add(child, state, cmdline) {
                Ok(id) => id,
                Err(e) => {
                    warn!(%child, "could not register job, killing it");
                    let _ = kill(child, Signal::SIGKILL);
                    return Err(e);
                }
            };
            debug!(id, %child, ?state, live = gate.jobs().len(), "started job");

            if cmd.background {
                println!("[{id}] ({child}) {cmdline}");
            } else {
                gate.wait_foreground();
            }
            Ok(())
        }
    }
}

/// Child side of `launch`. Never returns.
fn exec_child(program: &CStr, argv: &[CString], redirect: &Redirect) -> ! {
    if let Err(e) = prepare_child(redirect) {
        eprintln!("tsh: {}", e.desc());
        unsafe { libc::_exit(1) };
    }

    let err = match execv(program, argv) {
        Ok(never) => match never {},
        Err(err) => err,
    };
    let name = argv[0].to_string_lossy();
    if err == Errno::ENOENT {
        eprintln!("{name}: Command not found");
    } else {
        eprintln!("{name}: {}", err.desc());
    }
    unsafe { libc::_exit(1) }
}

fn prepare_child(redirect: &Redirect) -> nix::Result<()> {
    // Defaults go back first so nothing pending can reach the shell's
    // handlers in the child.
    signals::restore_defaults()?;
    Gate::unblock_all()?;
    setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
    redirect.apply()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::JobRef;
    use std::fs;

    #[test]
    fn resolve_program_keeps_paths_and_searches_path() {
        assert_eq!(resolve_program("./run"), PathBuf::from("./run"));
        assert_eq!(resolve_program("/bin/echo"), PathBuf::from("/bin/echo"));
        assert_eq!(
            resolve_program("surely-not-a-real-program-name"),
            PathBuf::from("surely-not-a-real-program-name")
        );
        let sh = resolve_program("sh");
        assert!(sh.is_absolute(), "{}", sh.display());
    }

    #[test]
    fn redirect_reports_unopenable_input() {
        let cmd = match parse_line("/bin/cat < /definitely/missing/file").unwrap() {
            Parsed::Command(cmd) => cmd,
            Parsed::Empty => unreachable!(),
        };
        let err = Redirect::open(&cmd).err().unwrap();
        assert!(matches!(
            err,
            ShellError::Redirect { source: Errno::ENOENT, .. }
        ));
    }

    #[test]
    fn output_redirect_creates_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        fs::write(&path, "old contents").unwrap();

        let fd = open_output(&path).unwrap();
        drop(fd);
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn errors_are_reported_while_blocked() {
        let gate = Gate::block().unwrap();
        let mut out = Vec::new();

        report(&gate, &ShellError::NoSuchJob(JobRef::Job(3)), &mut out).unwrap();
        let parse = parse_line("cat <").unwrap_err();
        report(&gate, &ShellError::Parse(parse), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "%3: No such job\n");
    }

    #[test]
    fn interior_nul_is_an_error() {
        assert!(matches!(c_string("a\0b"), Err(ShellError::Io(_))));
    }
}
