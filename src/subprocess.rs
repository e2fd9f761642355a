//! Child process execution with a controlled environment and explicit
//! descriptor redirections.

use std::io;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirection {
    Inherit,
    Null,
    Pipe,
}

impl Redirection {
    fn stdio(self) -> Stdio {
        match self {
            Redirection::Inherit => Stdio::inherit(),
            Redirection::Null => Stdio::null(),
            Redirection::Pipe => Stdio::piped(),
        }
    }
}

pub struct Subprocess {
    command: Command,
    stdin: Redirection,
    stdout: Redirection,
    stderr: Redirection,
}

impl Subprocess {
    pub fn new(program: &str) -> Subprocess {
        Subprocess {
            command: Command::new(program),
            stdin: Redirection::Inherit,
            stdout: Redirection::Inherit,
            stderr: Redirection::Inherit,
        }
    }

    pub fn arg(&mut self, arg: &str) -> &mut Subprocess {
        self.command.arg(arg);
        self
    }

    /// Start from an empty environment instead of inheriting.
    pub fn env_clear(&mut self) -> &mut Subprocess {
        self.command.env_clear();
        self
    }

    pub fn env(&mut self, key: &str, value: &str) -> &mut Subprocess {
        self.command.env(key, value);
        self
    }

    pub fn stdin(&mut self, redirection: Redirection) -> &mut Subprocess {
        self.stdin = redirection;
        self
    }

    pub fn stdout(&mut self, redirection: Redirection) -> &mut Subprocess {
        self.stdout = redirection;
        self
    }

    pub fn stderr(&mut self, redirection: Redirection) -> &mut Subprocess {
        self.stderr = redirection;
        self
    }

    pub fn start(&mut self) -> io::Result<SubprocessHandle> {
        let child = self
            .command
            .stdin(self.stdin.stdio())
            .stdout(self.stdout.stdio())
            .stderr(self.stderr.stdio())
            .spawn()?;
        Ok(SubprocessHandle { child })
    }
}

pub struct SubprocessHandle {
    child: Child,
}

/// Exit codes are non-negative; termination by signal N maps to -N.
fn encode_status(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

impl SubprocessHandle {
    pub fn wait(&mut self) -> io::Result<i32> {
        Ok(encode_status(self.child.wait()?))
    }

    pub fn stdout_pipe(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}
