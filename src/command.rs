//! Shell-out facade and mount RAII guards.
//!
//! Every external binary this crate touches (`sgdisk`, `parted`, `mdadm`,
//! `efibootmgr`, `qemu-img`, `mount`, `blkid`, `lsblk`, `partprobe`,
//! `udevadm`, `grub-install`, `grub-mkconfig`, ...) is invoked through
//! [`run`], the single chokepoint that logs argv, captures stderr, and
//! applies the retry/locale/env policy described in the options struct.
use std::{
	collections::HashMap,
	io::Read,
	process::{Command, Stdio},
	thread,
	time::{Duration, Instant},
};

use log::{debug, warn};

use crate::error::{CommandFailure, Error};

/// Options accepted by [`run`]. Mirrors the single knob set the original
/// source threads through `processutils.execute`.
#[derive(Debug, Clone)]
pub struct RunOptions {
	/// Number of attempts before giving up. 1 means "no retry".
	pub attempts: u32,
	/// Sleep between retries, linearly scaled by attempt number.
	pub delay_on_retry: Duration,
	/// Force `LC_ALL=C` so that parsers relying on English tool output
	/// aren't tripped up by a localized environment.
	pub use_standard_locale: bool,
	/// Capture stdout as raw bytes rather than assuming UTF-8.
	pub binary: bool,
	/// Exit codes other than 0 that should be treated as success.
	pub check_exit_code: Vec<i32>,
	/// Extra environment variables merged on top of the inherited ones.
	pub env_variables: HashMap<String, String>,
	/// Run `argv[0]` as a string passed to `sh -c` instead of exec'ing it
	/// directly. `argv` is still logged and reported on failure, but only
	/// this string is actually executed.
	pub shell: Option<String>,
	/// Wall-clock budget for the whole invocation, including retries. A
	/// child that hasn't exited by the deadline is killed and the attempt
	/// is treated as a failure.
	pub timeout: Duration,
}

impl Default for RunOptions {
	fn default() -> Self {
		RunOptions {
			attempts: 1,
			delay_on_retry: Duration::from_secs(1),
			use_standard_locale: true,
			binary: false,
			check_exit_code: vec![0],
			env_variables: HashMap::new(),
			shell: None,
			timeout: Duration::from_secs(300),
		}
	}
}

impl RunOptions {
	pub fn with_attempts(mut self, attempts: u32) -> Self {
		self.attempts = attempts;
		self
	}

	pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.env_variables.insert(key.into(), value.into());
		self
	}

	/// Run `command` via `sh -c` rather than exec'ing `argv` directly.
	pub fn with_shell(mut self, command: impl Into<String>) -> Self {
		self.shell = Some(command.into());
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}
}

/// Outcome of a successful [`run`] call.
pub struct RunOutput {
	pub stdout: Vec<u8>,
	pub stderr: Vec<u8>,
}

impl RunOutput {
	pub fn stdout_str(&self) -> String {
		String::from_utf8_lossy(&self.stdout).into_owned()
	}

	pub fn stderr_str(&self) -> String {
		String::from_utf8_lossy(&self.stderr).into_owned()
	}
}

/// Run `argv[0] argv[1..]` (or, with `opts.shell` set, `sh -c <shell>`),
/// retrying according to `opts`.
///
/// Every attempt is logged at debug level before it runs; a failing final
/// attempt is turned into [`Error::CommandExecution`] carrying the argv,
/// captured stderr and exit code, the way the source wraps shell-out
/// failures before they reach the conductor. Every attempt is bounded by
/// `opts.timeout`: a child still running at the deadline is killed and the
/// attempt counts as a failure, the way `wait_timeout` semantics layered
/// over a plain `std::process::Child` would enforce it.
pub fn run(argv: &[&str], opts: &RunOptions) -> Result<RunOutput, Error> {
	let mut last_err: Option<Error> = None;
	for attempt in 1..=opts.attempts.max(1) {
		let mut cmd = match &opts.shell {
			Some(shell_cmd) => {
				let mut cmd = Command::new("sh");
				cmd.arg("-c").arg(shell_cmd);
				cmd
			}
			None => {
				let mut cmd = Command::new(argv[0]);
				cmd.args(&argv[1..]);
				cmd
			}
		};
		cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
		if opts.use_standard_locale {
			cmd.env("LC_ALL", "C");
		}
		for (k, v) in &opts.env_variables {
			cmd.env(k, v);
		}
		debug!("Running command (attempt {}): {:?}", attempt, cmd);
		match spawn_with_timeout(cmd, opts.timeout) {
			Ok(WaitOutcome::Exited { status, stdout, stderr }) => {
				let code = status.code();
				if code.map(|c| opts.check_exit_code.contains(&c)).unwrap_or(false) {
					return Ok(RunOutput { stdout, stderr });
				}
				let failure = CommandFailure {
					argv: argv.iter().map(|s| s.to_string()).collect(),
					stdout: String::from_utf8_lossy(&stdout).into_owned(),
					stderr: String::from_utf8_lossy(&stderr).into_owned(),
					exit_code: code,
				};
				warn!("Command failed on attempt {}: {}", attempt, failure);
				last_err = Some(Error::command("command execution failed", failure));
			}
			Ok(WaitOutcome::TimedOut { stdout, stderr }) => {
				let failure = CommandFailure {
					argv: argv.iter().map(|s| s.to_string()).collect(),
					stdout: String::from_utf8_lossy(&stdout).into_owned(),
					stderr: String::from_utf8_lossy(&stderr).into_owned(),
					exit_code: None,
				};
				warn!("Command timed out after {:?} on attempt {}: {}", opts.timeout, attempt, failure);
				last_err = Some(Error::command(format!("command timed out after {:?}", opts.timeout), failure));
			}
			Err(e) => {
				last_err = Some(Error::command(
					format!("failed to spawn {:?}", argv[0]),
					CommandFailure {
						argv: argv.iter().map(|s| s.to_string()).collect(),
						stdout: String::new(),
						stderr: e.to_string(),
						exit_code: None,
					},
				));
			}
		}
		if attempt < opts.attempts {
			thread::sleep(opts.delay_on_retry * attempt);
		}
	}
	Err(last_err.expect("attempts is always >= 1"))
}

enum WaitOutcome {
	Exited {
		status: std::process::ExitStatus,
		stdout: Vec<u8>,
		stderr: Vec<u8>,
	},
	TimedOut {
		stdout: Vec<u8>,
		stderr: Vec<u8>,
	},
}

/// Spawn `cmd` and poll `try_wait` until it exits or `timeout` elapses, in
/// which case the child is killed. stdout/stderr are drained concurrently
/// on reader threads so a chatty child can't deadlock on a full pipe while
/// the poll loop waits.
fn spawn_with_timeout(mut cmd: Command, timeout: Duration) -> std::io::Result<WaitOutcome> {
	let mut child = cmd.spawn()?;
	let mut stdout_pipe = child.stdout.take().expect("stdout is piped");
	let mut stderr_pipe = child.stderr.take().expect("stderr is piped");
	let stdout_handle = thread::spawn(move || {
		let mut buf = Vec::new();
		let _ = stdout_pipe.read_to_end(&mut buf);
		buf
	});
	let stderr_handle = thread::spawn(move || {
		let mut buf = Vec::new();
		let _ = stderr_pipe.read_to_end(&mut buf);
		buf
	});

	let start = Instant::now();
	let status = loop {
		match child.try_wait()? {
			Some(status) => break Some(status),
			None => {
				if start.elapsed() >= timeout {
					let _ = child.kill();
					let _ = child.wait();
					break None;
				}
				thread::sleep(Duration::from_millis(50));
			}
		}
	};
	let stdout = stdout_handle.join().unwrap_or_default();
	let stderr = stderr_handle.join().unwrap_or_default();
	Ok(match status {
		Some(status) => WaitOutcome::Exited { status, stdout, stderr },
		None => WaitOutcome::TimedOut { stdout, stderr },
	})
}

/// Convenience wrapper for the common "just run it once, don't retry" case.
pub fn run_once(argv: &[&str]) -> Result<RunOutput, Error> {
	run(argv, &RunOptions::default())
}

/// Best-effort variant: logs and swallows failure, returning `None`.
/// Mirrors the original source's `try_execute`.
pub fn try_run(argv: &[&str], opts: &RunOptions) -> Option<RunOutput> {
	match run(argv, opts) {
		Ok(out) => Some(out),
		Err(e) => {
			debug!("Command failed (ignored): {}", e);
			None
		}
	}
}

/// RAII guard over an active mount point.
///
/// On drop, attempts `umount` up to `retries` times with linear back-off
/// before the caller's temp directory is removed; this is the scoped-
/// release discipline the partitioner and bootloader installer stack up
/// as they bind-mount `/dev`, `/proc`, `/run`, `/sys` and the ESP.
pub struct MountGuard {
	mountpoint: std::path::PathBuf,
	retries: u32,
	/// If true, a failure to unmount on drop is only logged; if false
	/// (used for the ESP) it is promoted to a panic-free but loud error
	/// since content integrity past this point is unknown.
	pub best_effort: bool,
}

impl MountGuard {
	/// Mount `source` at `target` with the given filesystem type and
	/// extra mount(8) options (e.g. `["bind"]`, `["defaults"]`).
	pub fn mount(
		source: &std::path::Path,
		target: &std::path::Path,
		fstype: Option<&str>,
		options: &[&str],
	) -> Result<Self, Error> {
		std::fs::create_dir_all(target).map_err(|e| {
			Error::InstanceDeployFailure(format!(
				"failed to create mountpoint {}: {e}",
				target.display()
			))
		})?;
		let mut argv: Vec<&str> = vec!["mount"];
		if let Some(t) = fstype {
			argv.push("-t");
			argv.push(t);
		}
		let opt_str;
		if !options.is_empty() {
			opt_str = options.join(",");
			argv.push("-o");
			argv.push(&opt_str);
		}
		let source_str = source.to_string_lossy().into_owned();
		let target_str = target.to_string_lossy().into_owned();
		argv.push(&source_str);
		argv.push(&target_str);
		run_once(&argv)?;
		Ok(MountGuard {
			mountpoint: target.to_path_buf(),
			retries: 3,
			best_effort: true,
		})
	}

	pub fn path(&self) -> &std::path::Path {
		&self.mountpoint
	}

	/// Mark this guard as non-best-effort: a failed unmount is surfaced as
	/// an error instead of logged and swallowed. Used for the ESP, whose
	/// unmount failure is fatal per the bootloader installer's contract
	/// (content integrity past that point is unknown); every other bind
	/// mount (`/dev`, `/proc`, `/run`, `/sys`, the root partition) stays
	/// best-effort.
	pub fn strict(mut self) -> Self {
		self.best_effort = false;
		self
	}

	/// Consume the guard and unmount eagerly instead of waiting for drop.
	/// A failure is only propagated to the caller when the guard is
	/// non-best-effort (`strict`); otherwise it is logged and swallowed.
	pub fn unmount_now(mut self) -> Result<(), Error> {
		let result = unmount_with_retry(&self.mountpoint, self.retries);
		// Prevent Drop from trying again once we've already reported success/failure.
		self.retries = 0;
		match result {
			Ok(()) => Ok(()),
			Err(e) => {
				if self.best_effort {
					warn!("Leaving {} mounted (non-fatal): {}", self.mountpoint.display(), e);
					Ok(())
				} else {
					Err(e)
				}
			}
		}
	}
}

fn unmount_with_retry(mountpoint: &std::path::Path, retries: u32) -> Result<(), Error> {
	let target = mountpoint.to_string_lossy().into_owned();
	let mut last = None;
	for attempt in 1..=retries.max(1) {
		match run_once(&["umount", &target]) {
			Ok(_) => return Ok(()),
			Err(e) => {
				warn!("umount {} failed (attempt {}): {}", target, attempt, e);
				last = Some(e);
				thread::sleep(Duration::from_millis(500) * attempt);
			}
		}
	}
	Err(last.expect("retries is always >= 1"))
}

impl Drop for MountGuard {
	fn drop(&mut self) {
		if self.retries == 0 {
			return;
		}
		match unmount_with_retry(&self.mountpoint, self.retries) {
			Ok(()) => {
				let _ = std::fs::remove_dir(&self.mountpoint);
			}
			Err(e) => {
				if self.best_effort {
					warn!("Leaving {} mounted: {}", self.mountpoint.display(), e);
				} else {
					warn!(
						"Failed to unmount {} on scope exit, content integrity unknown: {}",
						self.mountpoint.display(),
						e
					);
				}
			}
		}
	}
}

/// A stack of active [`MountGuard`]s, unwound in reverse (LIFO) order.
/// Generalizes the teacher's `mountpoint_stack: Vec<String>` pattern.
#[derive(Default)]
pub struct MountStack(Vec<MountGuard>);

impl MountStack {
	pub fn new() -> Self {
		MountStack(Vec::new())
	}

	pub fn push(&mut self, guard: MountGuard) {
		self.0.push(guard);
	}

	/// Unmount everything in reverse order now, rather than waiting for
	/// the stack to drop. Collects the first hard failure, if any, but
	/// keeps unwinding the rest of the stack regardless.
	pub fn unwind(&mut self) -> Result<(), Error> {
		let mut first_err = None;
		while let Some(guard) = self.0.pop() {
			if let Err(e) = guard.unmount_now() {
				if first_err.is_none() {
					first_err = Some(e);
				}
			}
		}
		if let Some(e) = first_err {
			Err(e)
		} else {
			Ok(())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn run_once_true() {
		let out = run_once(&["true"]).expect("true(1) exists on any posix host");
		assert!(out.stdout.is_empty());
	}

	#[test]
	fn run_retries_then_fails() {
		let opts = RunOptions::default()
			.with_attempts(2)
			.with_env("UNUSED", "1");
		let opts = RunOptions {
			delay_on_retry: Duration::from_millis(1),
			..opts
		};
		let err = run(&["false"], &opts).unwrap_err();
		assert!(matches!(err, Error::CommandExecution { .. }));
	}

	#[test]
	fn run_with_shell_executes_string() {
		let opts = RunOptions::default().with_shell("echo -n hi");
		let out = run(&["ignored"], &opts).unwrap();
		assert_eq!(out.stdout_str(), "hi");
	}

	#[test]
	fn run_times_out_on_hanging_child() {
		let opts = RunOptions::default().with_timeout(Duration::from_millis(100));
		let err = run(&["sleep", "5"], &opts).unwrap_err();
		match err {
			Error::CommandExecution { failure, .. } => assert_eq!(failure.exit_code, None),
			_ => panic!("expected CommandExecution"),
		}
	}
}
