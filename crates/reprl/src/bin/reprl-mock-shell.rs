//! A minimal REPRL-aware stand-in for an instrumented JS shell.
//!
//! The integration tests drive the real supervisor against this binary: it
//! performs the startup handshake on the well-known descriptors, attaches to
//! the coverage shared memory named by `SHM_ID`, and then interprets each
//! "script" as one directive per line:
//!
//! - `edges:5,9`: mark the given edge indices as hit
//! - `stdout:msg` / `stderr:msg`: write a line of output
//! - `fuzzout:msg`: write to the fuzzer-output channel
//! - `sleep:ms`: stall, to trigger the execution timeout
//! - `segv`: die from SIGSEGV mid-execution
//! - `exit:code`: exit without reporting a status
//! - `status:code`: report a nonzero script exit status
//! - `listfds`: print the descriptors that were open at startup
//!
//! Unknown or empty lines are ignored and the execution reports status 0.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::{fd::FromRawFd, unix::fs::FileExt},
    thread,
    time::Duration,
};

use anyhow::{Context, bail, ensure};
use reprl::execution::{EXECUTE_COMMAND, HANDSHAKE, child_fd};

fn main() -> anyhow::Result<()> {
    // Snapshot before any file is opened, so `listfds` reflects what the
    // parent actually left us.
    let startup_fds = list_open_fds()?;

    let shm = Coverage::attach().context("Attaching coverage shared memory")?;

    // SAFETY: the parent wired the well-known descriptors up before exec;
    // nothing else in this process owns them.
    let mut ctrl_in = unsafe { File::from_raw_fd(child_fd::CTRL_IN) };
    let mut ctrl_out = unsafe { File::from_raw_fd(child_fd::CTRL_OUT) };
    let mut data_in = unsafe { File::from_raw_fd(child_fd::DATA_IN) };
    let mut data_out = unsafe { File::from_raw_fd(child_fd::DATA_OUT) };

    ctrl_out.write_all(HANDSHAKE).context("Sending greeting")?;
    let mut reply = [0u8; 4];
    ctrl_in
        .read_exact(&mut reply)
        .context("Reading greeting reply")?;
    ensure!(&reply == HANDSHAKE, "unexpected greeting reply {reply:?}");

    loop {
        let mut frame = [0u8; 12];
        if ctrl_in.read_exact(&mut frame).is_err() {
            // The fuzzer went away; nothing left to do.
            return Ok(());
        }
        ensure!(
            &frame[..4] == EXECUTE_COMMAND,
            "unknown command {:?}",
            &frame[..4]
        );
        let mut length = [0u8; 8];
        length.copy_from_slice(&frame[4..]);
        let length = u64::from_le_bytes(length) as usize;

        let mut script = vec![0u8; length];
        data_in.read_exact(&mut script).context("Reading script")?;
        let script = String::from_utf8(script).context("Script is not UTF-8")?;

        let mut status = 0u32;
        for line in script.lines() {
            if let Some(reported) = run_directive(line, &shm, &mut data_out, &startup_fds)? {
                status = reported;
            }
        }
        io::stdout().flush().context("Flushing stdout")?;
        io::stderr().flush().context("Flushing stderr")?;
        ctrl_out
            .write_all(&status.to_ne_bytes())
            .context("Reporting status")?;
    }
}

fn run_directive(
    line: &str,
    shm: &Coverage,
    data_out: &mut File,
    startup_fds: &[i32],
) -> anyhow::Result<Option<u32>> {
    if line.is_empty() {
        return Ok(None);
    }
    if line == "segv" {
        // `raise(SIGSEGV)` doesn't actually kill a Rust process: std installs
        // a SIGSEGV handler to detect stack overflows, and for a
        // synthetic (non-fault) signal it just returns, leaving execution to
        // continue past the raise. A genuine invalid memory access is a real
        // CPU trap, which the handler correctly forwards to the default
        // disposition and terminates the process with SIGSEGV.
        // SAFETY: deliberately dying is this directive's whole purpose.
        unsafe { std::ptr::write_volatile(0x1000 as *mut i32, 42) };
        unreachable!("SIGSEGV did not terminate the process");
    }
    if line == "listfds" {
        for fd in startup_fds {
            println!("{fd}");
        }
        return Ok(None);
    }

    let Some((directive, argument)) = line.split_once(':') else {
        return Ok(None);
    };
    match directive {
        "edges" => {
            for index in argument.split(',') {
                let index: u32 = index.trim().parse().context("Bad edge index")?;
                shm.hit(index)?;
            }
        }
        "stdout" => println!("{argument}"),
        "stderr" => eprintln!("{argument}"),
        "fuzzout" => data_out
            .write_all(argument.as_bytes())
            .context("Writing fuzzer output")?,
        "sleep" => {
            let millis: u64 = argument.parse().context("Bad sleep duration")?;
            thread::sleep(Duration::from_millis(millis));
        }
        "exit" => {
            let code: i32 = argument.parse().context("Bad exit code")?;
            std::process::exit(code);
        }
        "status" => {
            let code: u32 = argument.parse().context("Bad status code")?;
            return Ok(Some((code & 0xff) << 8));
        }
        other => bail!("unknown directive {other:?}"),
    }
    Ok(None)
}

/// The child half of the coverage map: the shared-memory object the parent
/// created, re-opened by name.
struct Coverage {
    file: File,
}

impl Coverage {
    fn attach() -> anyhow::Result<Self> {
        let name = std::env::var("SHM_ID").context("SHM_ID is not set")?;
        let path = format!("/dev/shm/{}", name.trim_start_matches('/'));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Opening {path}"))?;

        // A real engine reports its instrumentation size here.
        let num_edges: u32 = std::env::var("MOCK_NUM_EDGES")
            .ok()
            .map(|value| value.parse())
            .transpose()
            .context("Bad MOCK_NUM_EDGES")?
            .unwrap_or(1000);
        file.write_all_at(&num_edges.to_ne_bytes(), 0)
            .context("Reporting edge count")?;
        Ok(Self { file })
    }

    fn hit(&self, index: u32) -> anyhow::Result<()> {
        let offset = 4 + u64::from(index / 8);
        let mut byte = [0u8];
        self.file.read_exact_at(&mut byte, offset)?;
        byte[0] |= 1 << (index % 8);
        self.file.write_all_at(&byte, offset)?;
        Ok(())
    }
}

fn list_open_fds() -> anyhow::Result<Vec<i32>> {
    let mut fds = Vec::new();
    for entry in std::fs::read_dir("/proc/self/fd").context("Listing /proc/self/fd")? {
        let name = entry?.file_name();
        if let Some(fd) = name.to_str().and_then(|name| name.parse().ok()) {
            fds.push(fd);
        }
    }
    fds.sort_unstable();
    Ok(fds)
}
