//! Child-process supervision for persistent-mode execution.
//!
//! This module implements the parent side of the REPRL protocol: a single
//! instrumented JS shell is kept alive across many script executions and
//! talks to us over two control pipes plus memory-mapped data channels. The
//! child side of the protocol addresses its descriptors by well-known
//! numbers (see [`child_fd`]), which the supervisor wires up between fork
//! and exec.

use std::{
    ffi::OsString,
    io::{self, Read, Write},
    os::{
        fd::{AsRawFd, BorrowedFd},
        unix::process::{CommandExt, ExitStatusExt},
    },
    process::{Child, Command, Stdio},
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::signal::{SigHandler, Signal, signal},
};
use os_pipe::{PipeReader, PipeWriter};
use tracing::{debug, info, warn};

pub mod data_channel;
pub mod status;

pub use data_channel::{DataChannel, MAX_DATA_SIZE};
use status::ExecutionStatus;

/// Well-known descriptor numbers on the child side, fixed by the protocol.
pub mod child_fd {
    /// Control pipe the child reads commands from.
    pub const CTRL_IN: i32 = 100;
    /// Control pipe the child writes status words to.
    pub const CTRL_OUT: i32 = 101;
    /// Data channel carrying the script.
    pub const DATA_IN: i32 = 102;
    /// Data channel carrying fuzzer output.
    pub const DATA_OUT: i32 = 103;

    pub const ALL: [i32; 4] = [CTRL_IN, CTRL_OUT, DATA_IN, DATA_OUT];
}

/// Four-byte greeting exchanged in both directions at child startup.
pub const HANDSHAKE: &[u8; 4] = b"HELO";

/// Command tag announcing a script execution, followed by the script length
/// as a little-endian `u64`.
pub const EXECUTE_COMMAND: &[u8; 4] = b"cexe";

/// Upper bound on the per-execution timeout; the poll interface measures in
/// 32-bit milliseconds.
pub const MAX_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

#[derive(Debug, thiserror::Error)]
pub enum ReprlError {
    #[error("argv must at least name the target binary")]
    EmptyArgv,
    #[error("script of {0} bytes does not fit the data channel")]
    ScriptTooLarge(usize),
    #[error("no child process is running")]
    NotRunning,
    #[error("failed to spawn the target: {0}")]
    Spawn(#[source] io::Error),
    #[error("child failed the startup handshake: {0}")]
    Handshake(String),
    #[error("child exited with status {0} between executions")]
    ExitedBetweenExecutions(i32),
    #[error("child was terminated by signal {0} between executions")]
    SignaledBetweenExecutions(i32),
    #[error("lost contact with the child and could not reap it")]
    ChildLost,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sys(#[from] Errno),
}

/// Result of one script execution.
#[derive(Debug, Clone, Copy)]
pub struct Execution {
    pub status: ExecutionStatus,
    /// Wall-clock time spent waiting on the child, recorded regardless of
    /// the outcome.
    pub execution_time: Duration,
}

/// Configuration for a [`ReprlSession`].
#[derive(Debug)]
pub struct ReprlOptions {
    pub worker_id: usize,
    /// Target binary and its arguments.
    pub argv: Vec<OsString>,
    /// Complete child environment, including `SHM_ID`.
    pub envs: Vec<(OsString, OsString)>,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
    /// Leave the child's stdout/stderr attached to ours instead of
    /// redirecting them, for debugging the target.
    pub debug_output: bool,
}

/// A live child plus the pipe ends that are only valid while it runs.
#[derive(Debug)]
struct ChildHandle {
    process: Child,
    ctrl_in: PipeReader,
    ctrl_out: PipeWriter,
}

/// The per-worker supervisor: owns the data channels, argv/envp, and at most
/// one live child at a time. Children are spawned lazily and replaced
/// whenever one dies, times out, or a fresh instance is requested.
#[derive(Debug)]
pub struct ReprlSession {
    worker_id: usize,
    argv: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    debug_output: bool,
    data_in: DataChannel,
    data_out: DataChannel,
    stdout: Option<DataChannel>,
    stderr: Option<DataChannel>,
    child: Option<ChildHandle>,
    last_error: Option<String>,
}

impl ReprlSession {
    /// Allocates the session and its data channels. No child is spawned yet.
    pub fn new(options: ReprlOptions) -> Result<Self, ReprlError> {
        if options.argv.is_empty() {
            return Err(ReprlError::EmptyArgv);
        }
        init_process_state()?;

        let worker_id = options.worker_id;
        let data_in = DataChannel::new(worker_id, "in")?;
        let data_out = DataChannel::new(worker_id, "out")?;
        let stdout = options
            .capture_stdout
            .then(|| DataChannel::new(worker_id, "stdout"))
            .transpose()?;
        let stderr = options
            .capture_stderr
            .then(|| DataChannel::new(worker_id, "stderr"))
            .transpose()?;

        Ok(Self {
            worker_id,
            argv: options.argv,
            envs: options.envs,
            debug_output: options.debug_output,
            data_in,
            data_out,
            stdout,
            stderr,
            child: None,
            last_error: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child.as_ref().map(|child| child.process.id())
    }

    /// Most recent supervisor failure, rendered for diagnostics.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Spawns a new child and completes the startup handshake.
    pub fn spawn(&mut self) -> Result<(), ReprlError> {
        let result = self.spawn_inner();
        self.record(result)
    }

    fn spawn_inner(&mut self) -> Result<(), ReprlError> {
        self.terminate();
        for channel in self.channels() {
            channel.truncate()?;
        }

        // crpipe: child writes, parent reads. cwpipe: parent writes, child reads.
        let (ctrl_in, child_ctrl_out) = os_pipe::pipe()?;
        let (child_ctrl_in, ctrl_out) = os_pipe::pipe()?;

        let mut command = Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .env_clear()
            .envs(self.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(child_output(self.debug_output, self.stdout.as_ref())?)
            .stderr(child_output(self.debug_output, self.stderr.as_ref())?);

        let bind_fds = {
            let ctrl_in_fd = child_ctrl_in.as_raw_fd();
            let ctrl_out_fd = child_ctrl_out.as_raw_fd();
            let data_in_fd = self.data_in.file().as_raw_fd();
            let data_out_fd = self.data_out.file().as_raw_fd();
            move || {
                raw_dup2(ctrl_in_fd, child_fd::CTRL_IN).map_err(io::Error::from)?;
                raw_dup2(ctrl_out_fd, child_fd::CTRL_OUT).map_err(io::Error::from)?;
                raw_dup2(data_in_fd, child_fd::DATA_IN).map_err(io::Error::from)?;
                raw_dup2(data_out_fd, child_fd::DATA_OUT).map_err(io::Error::from)?;
                close_inherited_fds();
                Ok(())
            }
        };
        // SAFETY: the closure only calls async-signal-safe functions
        // (dup2, close_range, close).
        unsafe { command.pre_exec(bind_fds) };

        let process = command.spawn().map_err(ReprlError::Spawn)?;
        drop(child_ctrl_in);
        drop(child_ctrl_out);

        // Give the child a moment to set up its side of the protocol.
        thread::sleep(Duration::from_millis(10));

        let mut child = ChildHandle {
            process,
            ctrl_in,
            ctrl_out,
        };
        let mut greeting = [0u8; 4];
        if let Err(err) = child.ctrl_in.read_exact(&mut greeting) {
            kill_and_reap(&mut child);
            return Err(ReprlError::Handshake(format!("no greeting: {err}")));
        }
        if &greeting != HANDSHAKE {
            kill_and_reap(&mut child);
            return Err(ReprlError::Handshake(format!(
                "unexpected greeting {greeting:?}"
            )));
        }
        if let Err(err) = child.ctrl_out.write_all(HANDSHAKE) {
            kill_and_reap(&mut child);
            return Err(ReprlError::Handshake(format!("reply not accepted: {err}")));
        }

        info!(
            worker = self.worker_id,
            pid = child.process.id(),
            "Target child ready"
        );
        self.child = Some(child);
        Ok(())
    }

    /// Kills and reaps the current child, if any. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            kill_and_reap(&mut child);
            debug!(worker = self.worker_id, "Child terminated");
        }
    }

    /// Rewinds all data channels, the first step of every execution.
    pub fn reset_channels(&mut self) -> Result<(), ReprlError> {
        for channel in self.channels() {
            channel.reset()?;
        }
        Ok(())
    }

    /// Places the script at the start of the input channel.
    pub fn stage_script(&mut self, script: &[u8]) -> Result<(), ReprlError> {
        if script.len() > MAX_DATA_SIZE {
            let err = Err(ReprlError::ScriptTooLarge(script.len()));
            return self.record(err);
        }
        self.data_in.stage(script);
        Ok(())
    }

    /// Sends the execute command and waits for the child's verdict.
    ///
    /// A timeout and a child death are both ordinary results, encoded in the
    /// returned status word; errors mean the command could not be delivered
    /// or the child vanished without a reapable status.
    pub fn dispatch(&mut self, script_len: u64, timeout: Duration) -> Result<Execution, ReprlError> {
        let result = self.dispatch_inner(script_len, timeout);
        self.record(result)
    }

    fn dispatch_inner(
        &mut self,
        script_len: u64,
        timeout: Duration,
    ) -> Result<Execution, ReprlError> {
        let timeout = timeout.min(MAX_TIMEOUT);
        if self.child.is_none() {
            return Err(ReprlError::NotRunning);
        }

        let mut frame = [0u8; 12];
        frame[..4].copy_from_slice(EXECUTE_COMMAND);
        frame[4..].copy_from_slice(&script_len.to_le_bytes());
        if let Err(err) = self.write_command(&frame) {
            return Err(self.classify_command_failure(err));
        }

        let started = Instant::now();
        let ready = self.poll_ctrl_in(timeout);
        let execution_time = started.elapsed();
        if !ready? {
            info!(worker = self.worker_id, ?timeout, "Execution timed out");
            self.terminate();
            return Ok(Execution {
                status: ExecutionStatus::TIMEOUT,
                execution_time,
            });
        }

        let mut status_bytes = [0u8; 4];
        match self.read_status(&mut status_bytes) {
            Ok(()) => Ok(Execution {
                status: ExecutionStatus::from_raw(u32::from_ne_bytes(status_bytes)),
                execution_time,
            }),
            // A short read means the pipe closed under us; the child is
            // almost certainly dead and its wait status is the real result.
            Err(_) => self.reap_as_result(timeout, execution_time),
        }
    }

    pub fn fetch_fuzzout(&mut self) -> Result<&[u8], ReprlError> {
        Ok(self.data_out.fetch()?)
    }

    pub fn fetch_stdout(&mut self) -> Result<&[u8], ReprlError> {
        match self.stdout.as_mut() {
            Some(channel) => Ok(channel.fetch()?),
            None => Ok(&[]),
        }
    }

    pub fn fetch_stderr(&mut self) -> Result<&[u8], ReprlError> {
        match self.stderr.as_mut() {
            Some(channel) => Ok(channel.fetch()?),
            None => Ok(&[]),
        }
    }

    fn channels(&mut self) -> impl Iterator<Item = &mut DataChannel> {
        [Some(&mut self.data_in), Some(&mut self.data_out)]
            .into_iter()
            .chain([self.stdout.as_mut(), self.stderr.as_mut()])
            .flatten()
    }

    fn write_command(&mut self, frame: &[u8]) -> io::Result<()> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        child.ctrl_out.write_all(frame)
    }

    /// A failed command write usually means the child died since the last
    /// execution; reap it to tell the caller exactly how.
    fn classify_command_failure(&mut self, err: io::Error) -> ReprlError {
        let wait_status = self
            .child
            .as_mut()
            .and_then(|child| child.process.try_wait().ok().flatten());
        match wait_status {
            Some(status) => {
                self.child = None;
                match status.signal() {
                    Some(signal) => ReprlError::SignaledBetweenExecutions(signal),
                    None => ReprlError::ExitedBetweenExecutions(status.code().unwrap_or(-1)),
                }
            }
            None => {
                self.terminate();
                ReprlError::Io(err)
            }
        }
    }

    fn poll_ctrl_in(&mut self, timeout: Duration) -> Result<bool, ReprlError> {
        let child = self.child.as_mut().ok_or(ReprlError::NotRunning)?;
        // SAFETY: the descriptor is owned by the pipe reader borrowed above.
        let fd = unsafe { BorrowedFd::borrow_raw(child.ctrl_in.as_raw_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let poll_timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        let ready = poll(&mut fds, poll_timeout)?;
        Ok(ready > 0)
    }

    fn read_status(&mut self, buffer: &mut [u8; 4]) -> io::Result<()> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        child.ctrl_in.read_exact(buffer)
    }

    /// Waits out the child's death and converts its wait status into an
    /// execution result, killing it for real if it refuses to go.
    fn reap_as_result(
        &mut self,
        timeout: Duration,
        execution_time: Duration,
    ) -> Result<Execution, ReprlError> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait_status = self
                .child
                .as_mut()
                .and_then(|child| child.process.try_wait().ok().flatten());
            if let Some(status) = wait_status {
                self.child = None;
                let status = match status.signal() {
                    Some(signal) => ExecutionStatus::from_signal(signal),
                    None => ExecutionStatus::from_exit_code(status.code().unwrap_or(0)),
                };
                debug!(worker = self.worker_id, %status, "Child died during execution");
                return Ok(Execution {
                    status,
                    execution_time,
                });
            }
            if Instant::now() >= deadline {
                self.terminate();
                return Err(ReprlError::ChildLost);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn record<T>(&mut self, result: Result<T, ReprlError>) -> Result<T, ReprlError> {
        if let Err(err) = &result {
            self.last_error = Some(err.to_string());
        }
        result
    }
}

impl Drop for ReprlSession {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn child_output(debug_output: bool, channel: Option<&DataChannel>) -> io::Result<Stdio> {
    if debug_output {
        return Ok(Stdio::inherit());
    }
    match channel {
        Some(channel) => Ok(Stdio::from(channel.file().try_clone()?)),
        None => Ok(Stdio::null()),
    }
}

fn kill_and_reap(child: &mut ChildHandle) {
    if let Err(err) = child.process.kill() {
        warn!(%err, "Failed to kill child");
    }
    if let Err(err) = child.process.wait() {
        warn!(%err, "Failed to reap child");
    }
}

static PROCESS_STATE: OnceLock<Result<(), Errno>> = OnceLock::new();

/// One-shot process-wide setup shared by every worker.
///
/// The well-known child descriptors are reserved with `/dev/null` duplicates
/// so no later allocation can collide with them before the child's `dup2`s,
/// and SIGPIPE is ignored so a write to a dead child surfaces as `EPIPE`
/// instead of killing the fuzzer.
fn init_process_state() -> Result<(), Errno> {
    *PROCESS_STATE.get_or_init(|| {
        // SAFETY: replacing the disposition of SIGPIPE with SIG_IGN does not
        // race any handler logic; this runs before the first child exists.
        unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;

        let devnull = std::fs::File::open("/dev/null")
            .map_err(|err| Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO)))?;
        for fd in child_fd::ALL {
            raw_dup2(devnull.as_raw_fd(), fd)?;
        }
        Ok(())
    })
}

/// `dup2` via a direct libc call, since `nix::unistd::dup2` requires the
/// target descriptor to be an owned `OwnedFd` rather than a fixed raw number.
/// Async-signal-safe.
fn raw_dup2(oldfd: i32, newfd: i32) -> nix::Result<()> {
    // SAFETY: dup2 is async-signal-safe and both descriptors are valid for
    // the lifetime of this call.
    let res = unsafe { libc::dup2(oldfd, newfd) };
    if res == -1 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

/// Closes every descriptor the child inherited except stdio and the four
/// well-known ones. Runs between fork and exec.
fn close_inherited_fds() {
    const FIRST: i32 = 3;
    #[cfg(target_os = "linux")]
    {
        // SAFETY: plain syscalls on descriptor ranges we own in the child.
        let below = unsafe { libc::close_range(FIRST as u32, (child_fd::CTRL_IN - 1) as u32, 0) };
        let above =
            unsafe { libc::close_range((child_fd::DATA_OUT + 1) as u32, libc::c_uint::MAX, 0) };
        if below == 0 && above == 0 {
            return;
        }
    }

    // SAFETY: closing stray descriptors in the forked child cannot affect
    // the parent.
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) }.max(1024) as i32;
    for fd in FIRST..limit {
        if !child_fd::ALL.contains(&fd) {
            // SAFETY: see above.
            unsafe { libc::close(fd) };
        }
    }
}
