// A started child process, independent of how it was created

use spawnline_core::Result;
use std::process::ExitStatus;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

pub type ChildInput = Box<dyn AsyncWrite + Send + Unpin>;
pub type ChildOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Handle to a running child with its redirected streams, if any.
///
/// Dropping it never kills the child.
pub struct RunningProcess {
    pub stdin: Option<ChildInput>,
    pub stdout: Option<ChildOutput>,
    pub stderr: Option<ChildOutput>,
    handle: ProcessHandle,
}

enum ProcessHandle {
    Spawned(Child),
    #[cfg(windows)]
    Logon(crate::logon::LogonProcess),
}

impl RunningProcess {
    pub(crate) fn from_child(mut child: Child) -> Self {
        Self {
            stdin: child.stdin.take().map(|s| Box::new(s) as ChildInput),
            stdout: child.stdout.take().map(|s| Box::new(s) as ChildOutput),
            stderr: child.stderr.take().map(|s| Box::new(s) as ChildOutput),
            handle: ProcessHandle::Spawned(child),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_logon(
        process: crate::logon::LogonProcess,
        stdin: Option<ChildInput>,
        stdout: Option<ChildOutput>,
        stderr: Option<ChildOutput>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            handle: ProcessHandle::Logon(process),
        }
    }

    pub fn id(&self) -> Option<u32> {
        match &self.handle {
            ProcessHandle::Spawned(child) => child.id(),
            #[cfg(windows)]
            ProcessHandle::Logon(process) => Some(process.id()),
        }
    }

    /// Wait for exit and return the exit code.
    pub async fn wait(&mut self) -> Result<i32> {
        match &mut self.handle {
            ProcessHandle::Spawned(child) => Ok(exit_code_of(child.wait().await?)),
            #[cfg(windows)]
            ProcessHandle::Logon(process) => process.wait().await,
        }
    }

    pub fn start_kill(&mut self) -> Result<()> {
        match &mut self.handle {
            ProcessHandle::Spawned(child) => Ok(child.start_kill()?),
            #[cfg(windows)]
            ProcessHandle::Logon(process) => process.start_kill(),
        }
    }
}

/// Exit code of a finished process; death by signal `n` reads as `128 + n`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
