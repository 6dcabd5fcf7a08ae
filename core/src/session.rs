//! Launching the target program.
//!
//! Two shapes: an in-place exec that replaces the helper (no session),
//! and a supervised fork/exec where the child raises to root inside a
//! PAM session while the parent waits and reproduces the child's exit
//! status. The operations sit behind [`TargetLauncher`] so the
//! authorization state machine can be driven without forking.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::debug;
use tracing::warn;

use crate::error::HelperError;
use crate::error::Result;
use crate::identity::UserRecord;
use crate::privilege;

/// Companion helper started alongside a session when the policy asks
/// for it. Fire and forget: it gets its own name as its only argument
/// and its failure to start is absorbed.
pub const COMPANION_PATH: &str = "/usr/bin/kdeinit";
const COMPANION_NAME: &str = "kdeinit";

/// Spawning seam between the authorization state machine and the
/// process machinery. The real implementation replaces or forks the
/// process; test doubles record the calls and return canned statuses.
pub trait TargetLauncher {
    /// Replace the current process image with `program`. Returns only
    /// on failure in the real implementation.
    fn exec_in_place(&mut self, program: &Path, argv: &[String]) -> Result<i32>;

    /// Drop privileges to `caller`, then exec `program` in place. The
    /// unprivileged escape hatch of the fallback path.
    fn exec_as_caller(
        &mut self,
        caller: &UserRecord,
        program: &Path,
        argv: &[String],
    ) -> Result<i32>;

    /// Fork; the child merges `session_env`, becomes root, optionally
    /// fires off the companion, and execs `program`. The parent closes
    /// its standard streams and blocks until the child terminates.
    /// Returns the child's raw wait status.
    fn run_session(
        &mut self,
        program: &Path,
        argv: &[String],
        session_env: &[(String, String)],
        launch_companion: bool,
    ) -> Result<i32>;
}

/// The production launcher: raw fork/exec/waitpid.
#[derive(Debug, Default)]
pub struct UnixLauncher;

impl TargetLauncher for UnixLauncher {
    fn exec_in_place(&mut self, program: &Path, argv: &[String]) -> Result<i32> {
        let err = exec(program, argv);
        Err(HelperError::Exec {
            program: program.display().to_string(),
            source: err,
        })
    }

    fn exec_as_caller(
        &mut self,
        caller: &UserRecord,
        program: &Path,
        argv: &[String],
    ) -> Result<i32> {
        privilege::become_caller(caller)?;
        self.exec_in_place(program, argv)
    }

    fn run_session(
        &mut self,
        program: &Path,
        argv: &[String],
        session_env: &[(String, String)],
        launch_companion: bool,
    ) -> Result<i32> {
        // SAFETY: single-threaded process; the child only calls
        // async-signal-unsafe functions before exec on the grounds
        // that no other thread exists to hold locks.
        let child = unsafe { libc::fork() };
        if child < 0 {
            return Err(HelperError::Exec {
                program: program.display().to_string(),
                source: std::io::Error::last_os_error(),
            });
        }
        if child == 0 {
            run_session_child(program, argv, session_env, launch_companion);
        }

        // Parent: the session's interactive surface now belongs to the
        // child.
        // SAFETY: closing our own standard descriptors.
        unsafe {
            libc::close(libc::STDIN_FILENO);
            libc::close(libc::STDOUT_FILENO);
            libc::close(libc::STDERR_FILENO);
        }
        let mut status: libc::c_int = 0;
        loop {
            // SAFETY: status pointer is valid; child is our own pid.
            let rc = unsafe { libc::waitpid(child, &mut status, 0) };
            if rc == child {
                break;
            }
            if rc < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(HelperError::Exec {
                program: program.display().to_string(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(status)
    }
}

/// Child side of the session fork. Never returns.
fn run_session_child(
    program: &Path,
    argv: &[String],
    session_env: &[(String, String)],
    launch_companion: bool,
) -> ! {
    // SAFETY: only this process sees the merged environment; the
    // parent's copy is untouched (copy-on-write).
    unsafe {
        for (key, value) in session_env {
            std::env::set_var(key, value);
        }
    }
    if let Err(err) = privilege::become_root() {
        eprintln!("conhelp: {err}");
        // SAFETY: terminating the child without unwinding.
        unsafe { libc::_exit(1) }
    }
    if launch_companion {
        spawn_companion();
    }
    let err = exec(program, argv);
    eprintln!("conhelp: failed to execute {}: {err}", program.display());
    // SAFETY: as above.
    unsafe { libc::_exit(1) }
}

/// Best-effort detached start of the companion. Its exec failure exits
/// the grandchild silently with status 0.
fn spawn_companion() {
    // SAFETY: single purpose fork followed immediately by exec or
    // _exit.
    unsafe {
        let pid = libc::fork();
        if pid == 0 {
            let path = CString::new(COMPANION_PATH).unwrap_or_default();
            let name = CString::new(COMPANION_NAME).unwrap_or_default();
            let argv = [name.as_ptr(), std::ptr::null()];
            libc::execv(path.as_ptr(), argv.as_ptr());
            libc::_exit(0);
        }
        if pid < 0 {
            warn!("could not fork for the companion process");
        }
    }
}

/// exec(2) with the given argv. Returns the error if and only if the
/// exec failed.
fn exec(program: &Path, argv: &[String]) -> std::io::Error {
    let Ok(cprogram) = CString::new(program.as_os_str().as_bytes()) else {
        return std::io::Error::from_raw_os_error(libc::EINVAL);
    };
    let mut cargs = Vec::with_capacity(argv.len());
    for arg in argv {
        match CString::new(arg.as_bytes()) {
            Ok(carg) => cargs.push(carg),
            Err(_) => return std::io::Error::from_raw_os_error(libc::EINVAL),
        }
    }
    let mut ptrs: Vec<*const libc::c_char> = cargs.iter().map(|a| a.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    debug!(program = %program.display(), "exec");
    // SAFETY: program and argv are NUL-terminated and the argv array is
    // NULL-terminated.
    unsafe {
        libc::execv(cprogram.as_ptr(), ptrs.as_ptr());
    }
    std::io::Error::last_os_error()
}

/// Final exit code for a session whose child produced `status`: 0 for a
/// clean exit, otherwise the raw wait status (so termination by signal
/// stays distinguishable).
pub fn session_exit_code(status: i32) -> i32 {
    if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
        0
    } else {
        status
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn clean_exit_maps_to_zero() {
        // wait status for exit(0)
        assert_eq!(session_exit_code(0), 0);
    }

    #[test]
    fn nonzero_exit_keeps_the_raw_status() {
        // wait status for exit(1) is 0x0100
        let status = 1 << 8;
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 1);
        assert_eq!(session_exit_code(status), status);
    }

    #[test]
    fn signal_death_keeps_the_raw_status() {
        // wait status for death by SIGKILL
        let status = libc::SIGKILL;
        assert!(!libc::WIFEXITED(status));
        assert_eq!(session_exit_code(status), status);
    }

    #[test]
    fn exec_of_missing_program_reports_enoent() {
        let err = exec(
            Path::new("/no/such/conhelp-program"),
            &["conhelp-program".to_string()],
        );
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn exec_rejects_embedded_nul() {
        let err = exec(Path::new("/bin/true"), &["a\0b".to_string()]);
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }
}
