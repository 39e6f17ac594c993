use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::ffi::OsString;
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("child handle already taken")]
    ChildTaken,
}

/// Initial size for terminals created without a viewer attached.
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// What a terminal runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// A host command line, handed to `sh -c`.
    Shell(String),
    /// A program and its arguments, spawned directly with no shell.
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn shell(line: impl Into<String>) -> Self {
        CommandLine::Shell(line.into())
    }

    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::Argv(args.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandLine::Shell(line) => f.write_str(line),
            CommandLine::Argv(args) => f.write_str(&args.join(" ")),
        }
    }
}

/// Build the command for a terminal.
///
/// The child leads its own process group (portable_pty calls setsid), so
/// signals aimed at `-pid` reach everything it started.
pub fn build_command(command: &CommandLine) -> CommandBuilder {
    let mut cmd = match command {
        CommandLine::Shell(line) => {
            let mut cmd = CommandBuilder::new("sh");
            cmd.arg("-c");
            cmd.arg(line);
            cmd
        }
        CommandLine::Argv(args) => CommandBuilder::from_argv(args.iter().map(OsString::from).collect()),
    };
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    if let Some(home) = dirs::home_dir() {
        cmd.cwd(home);
    }
    cmd
}

pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn portable_pty::Child + Send + Sync>>,
}

impl Pty {
    pub fn spawn(command: &CommandLine, rows: u16, cols: u16) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;
        let child = pair
            .slave
            .spawn_command(build_command(command))
            .map_err(PtyError::SpawnCommand)?;
        // Only the child keeps the slave open, so the reader sees EOF once
        // it exits.
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child: Some(child),
        })
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Take ownership of the child handle so it can be waited on from a
    /// blocking thread.
    pub fn take_child(&mut self) -> Result<Box<dyn portable_pty::Child + Send + Sync>, PtyError> {
        self.child.take().ok_or(PtyError::ChildTaken)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_command_output_is_readable() {
        let mut pty = Pty::spawn(&CommandLine::shell("echo pty-ok"), DEFAULT_ROWS, DEFAULT_COLS).unwrap();
        let mut reader = pty.take_reader().unwrap();
        let mut child = pty.take_child().unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        while let Ok(n) = reader.read(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
            if String::from_utf8_lossy(&out).contains("pty-ok") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&out).contains("pty-ok"));
        assert!(child.wait().unwrap().success());
    }

    #[test]
    fn argv_is_not_interpreted_by_a_shell() {
        let mut pty = Pty::spawn(
            &CommandLine::argv(["echo", "a;echo", "$(id)"]),
            DEFAULT_ROWS,
            DEFAULT_COLS,
        )
        .unwrap();
        let mut reader = pty.take_reader().unwrap();
        let mut child = pty.take_child().unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        while let Ok(n) = reader.read(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
            if String::from_utf8_lossy(&out).contains("$(id)") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&out).contains("a;echo $(id)"));
        assert!(child.wait().unwrap().success());
    }

    #[test]
    fn argv_displays_space_joined() {
        let cmd = CommandLine::argv(["docker", "exec", "-it", "web", "sh"]);
        assert_eq!(cmd.to_string(), "docker exec -it web sh");
        assert_eq!(CommandLine::shell("htop").to_string(), "htop");
    }

    #[test]
    fn child_can_only_be_taken_once() {
        let mut pty = Pty::spawn(&CommandLine::argv(["true"]), DEFAULT_ROWS, DEFAULT_COLS).unwrap();
        let mut child = pty.take_child().unwrap();
        assert!(matches!(pty.take_child(), Err(PtyError::ChildTaken)));
        child.wait().unwrap();
    }

    #[test]
    fn resize_succeeds_on_live_pty() {
        let mut pty = Pty::spawn(&CommandLine::argv(["sleep", "1"]), DEFAULT_ROWS, DEFAULT_COLS).unwrap();
        pty.resize(40, 120).unwrap();
        let mut child = pty.take_child().unwrap();
        child.kill().unwrap();
        let _ = child.wait();
    }
}
