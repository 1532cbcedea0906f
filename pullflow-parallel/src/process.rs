//! Child-process workers
//!
//! Each pool thread owns one long-lived child. Elements travel as one JSON
//! document per line on the child's stdin, results come back the same way on
//! its stdout. Stderr is inherited.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace, warn};

use pullflow_core::{Error, Result};

use crate::worker::{ExecutionMode, Worker, WorkerSpawner};

/// Program and environment used to start each worker process
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
}

impl ProcessCommand {
    /// Run `program`, looked up on `PATH` like [`Command::new`]
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    /// Append one argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<A>(mut self, args: impl IntoIterator<Item = A>) -> Self
    where
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Working directory of the child
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

/// Starts one child process per pool thread
pub struct ProcessSpawner<O> {
    command: ProcessCommand,
    _output: PhantomData<fn() -> O>,
}

impl<O> ProcessSpawner<O> {
    /// Spawner for `command`
    pub fn new(command: ProcessCommand) -> Self {
        Self {
            command,
            _output: PhantomData,
        }
    }
}

impl<I, O> WorkerSpawner<I> for ProcessSpawner<O>
where
    I: Serialize,
    O: DeserializeOwned + Send + 'static,
{
    type Output = O;
    type Worker = ProcessWorker<O>;

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Processes
    }

    fn spawn(&self, id: usize) -> Result<Self::Worker> {
        let mut child = self.command.to_command().spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::WorkerExited(format!("worker {id} has no stdio pipes")));
        };
        debug!(worker = id, pid = child.id(), "worker process started");
        Ok(ProcessWorker {
            id,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            line: String::new(),
            _output: PhantomData,
        })
    }
}

/// Worker forwarding elements to a child process
pub struct ProcessWorker<O> {
    id: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    line: String,
    _output: PhantomData<fn() -> O>,
}

impl<O> ProcessWorker<O> {
    fn exited(&self, reason: impl fmt::Display) -> Error {
        Error::WorkerExited(format!("worker {} (pid {}): {reason}", self.id, self.child.id()))
    }
}

impl<I, O> Worker<I> for ProcessWorker<O>
where
    I: Serialize,
    O: DeserializeOwned,
{
    type Output = O;

    fn call(&mut self, input: I) -> Result<O> {
        let mut request = serde_json::to_vec(&input)?;
        request.push(b'\n');
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(self.exited("input already closed"));
        };
        if let Err(err) = stdin.write_all(&request).and_then(|()| stdin.flush()) {
            return Err(match err.kind() {
                io::ErrorKind::BrokenPipe => self.exited("stopped reading input"),
                _ => Error::Io(err),
            });
        }

        self.line.clear();
        if self.stdout.read_line(&mut self.line)? == 0 {
            return Err(self.exited("closed its output"));
        }
        trace!(worker = self.id, "worker process replied");
        Ok(serde_json::from_str(self.line.trim_end())?)
    }
}

impl<O> Drop for ProcessWorker<O> {
    fn drop(&mut self) {
        // Closing stdin lets well-behaved children exit on their own.
        self.stdin.take();
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if let Err(err) = self.child.kill() {
                    trace!(worker = self.id, error = %err, "kill failed, child already gone");
                }
            }
        }
        match self.child.wait() {
            Ok(status) => debug!(worker = self.id, %status, "worker process reaped"),
            Err(err) => warn!(worker = self.id, error = %err, "failed to reap worker process"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn squarer() -> ProcessCommand {
        ProcessCommand::new("sh").arg("-c").arg("while read line; do echo $((line * line)); done")
    }

    #[test]
    fn test_round_trip_through_child() {
        let spawner = ProcessSpawner::<i64>::new(squarer());
        assert_eq!(WorkerSpawner::<i64>::mode(&spawner), ExecutionMode::Processes);
        let mut worker = WorkerSpawner::<i64>::spawn(&spawner, 0).unwrap();
        assert_eq!(worker.call(3).unwrap(), 9);
        assert_eq!(worker.call(-4).unwrap(), 16);
    }

    #[test]
    fn test_child_exit_fails_element() {
        let spawner = ProcessSpawner::<i64>::new(ProcessCommand::new("sh").args(["-c", "read line; exit 0"]));
        let mut worker = WorkerSpawner::<i64>::spawn(&spawner, 1).unwrap();
        assert!(matches!(worker.call(1), Err(Error::WorkerExited(_))));
    }

    #[test]
    fn test_undecodable_reply_is_json_error() {
        let spawner =
            ProcessSpawner::<i64>::new(ProcessCommand::new("sh").args(["-c", "while read line; do echo nope; done"]));
        let mut worker = WorkerSpawner::<i64>::spawn(&spawner, 2).unwrap();
        assert!(matches!(worker.call(1), Err(Error::Json(_))));
        // The child is still alive and answering.
        assert!(matches!(worker.call(2), Err(Error::Json(_))));
    }

    #[test]
    fn test_missing_program_fails_spawn() {
        let spawner = ProcessSpawner::<i64>::new(ProcessCommand::new("/nonexistent/pullflow-worker"));
        assert!(matches!(WorkerSpawner::<i64>::spawn(&spawner, 0), Err(Error::Io(_))));
    }
}
