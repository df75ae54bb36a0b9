use std::{fmt, path::PathBuf};

use nix::unistd::Pid;
use thiserror::Error;

use crate::job::JobId;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    RedirOut,
    RedirIn,
    Background,
}

/// Built-in commands the dispatcher runs without forking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    None,
    Quit,
    Jobs,
    Fg,
    Bg,
}

impl Builtin {
    fn from_argv0(word: &str) -> Self {
        match word {
            "quit" => Builtin::Quit,
            "jobs" => Builtin::Jobs,
            "fg" => Builtin::Fg,
            "bg" => Builtin::Bg,
            _ => Builtin::None,
        }
    }
}

/// A single parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub builtin: Builtin,
    pub argv: Vec<String>,
    pub infile: Option<PathBuf>,
    pub outfile: Option<PathBuf>,
    pub background: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Empty,
    Command(CommandLine),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Error: unmatched {0}")]
    UnterminatedQuote(char),
    #[error("Error: missing filename after {0}")]
    MissingFilename(char),
    #[error("Error: ambiguous I/O redirection")]
    AmbiguousRedirect,
    #[error("Error: & must end the command line")]
    MisplacedBackground,
    #[error("Error: missing command")]
    MissingCommand,
}

/// Split a raw line into words and operators.
///
/// `<`, `>` and `&` are operators wherever they appear outside quotes, so
/// `sleep 1&` and `cat <in` tokenize the same as their spaced forms.
fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut word: Option<String> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                let buf = word.get_or_insert_with(String::new);
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some(other) => buf.push(other),
                        None => return Err(ParseError::UnterminatedQuote(c)),
                    }
                }
            }
            '<' | '>' | '&' => {
                if let Some(w) = word.take() {
                    tokens.push(Token::Word(w));
                }
                tokens.push(match c {
                    '<' => Token::RedirIn,
                    '>' => Token::RedirOut,
                    _ => Token::Background,
                });
            }
            c if c.is_whitespace() => {
                if let Some(w) = word.take() {
                    tokens.push(Token::Word(w));
                }
            }
            c => word.get_or_insert_with(String::new).push(c),
        }
    }
    if let Some(w) = word.take() {
        tokens.push(Token::Word(w));
    }
    Ok(tokens)
}

/// Parse one command line into its argument vector, redirections and
/// background flag.
pub fn parse_line(line: &str) -> Result<Parsed, ParseError> {
    let tokens = tokenize(line)?;
    if tokens.is_empty() {
        return Ok(Parsed::Empty);
    }

    let mut argv = Vec::new();
    let mut infile = None;
    let mut outfile = None;
    let mut background = false;

    let mut iter = tokens.into_iter();
    while let Some(token) = iter.next() {
        if background {
            return Err(ParseError::MisplacedBackground);
        }
        match token {
            Token::Word(w) => argv.push(w),
            Token::RedirIn | Token::RedirOut => {
                let (slot, op) = if token == Token::RedirIn {
                    (&mut infile, '<')
                } else {
                    (&mut outfile, '>')
                };
                let Some(Token::Word(target)) = iter.next() else {
                    return Err(ParseError::MissingFilename(op));
                };
                if slot.is_some() {
                    return Err(ParseError::AmbiguousRedirect);
                }
                *slot = Some(PathBuf::from(target));
            }
            Token::Background => background = true,
        }
    }

    let Some(argv0) = argv.first() else {
        return Err(ParseError::MissingCommand);
    };

    Ok(Parsed::Command(CommandLine {
        builtin: Builtin::from_argv0(argv0),
        argv,
        infile,
        outfile,
        background,
    }))
}

/// The argument of `fg`/`bg`: `%N` names a job, a bare number a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRef {
    Job(JobId),
    Pid(Pid),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobRefError {
    #[error("{cmd} command requires PID or %jobid argument")]
    Missing { cmd: &'static str },
    #[error("{cmd}: argument must be a PID or %jobid")]
    Malformed { cmd: &'static str },
}

impl JobRef {
    pub fn parse(cmd: &'static str, arg: Option<&str>) -> Result<Self, JobRefError> {
        let arg = arg.ok_or(JobRefError::Missing { cmd })?;
        let malformed = JobRefError::Malformed { cmd };
        match arg.strip_prefix('%') {
            Some(id) => match id.parse::<JobId>() {
                Ok(id) if id > 0 => Ok(JobRef::Job(id)),
                _ => Err(malformed),
            },
            None => match arg.parse::<i32>() {
                Ok(pid) if pid > 0 => Ok(JobRef::Pid(Pid::from_raw(pid))),
                _ => Err(malformed),
            },
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobRef::Job(id) => write!(f, "%{id}"),
            JobRef::Pid(pid) => write!(f, "({pid})"),
        }
    }
}
