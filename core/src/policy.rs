//! Per-application policy files.
//!
//! Each wrapped application has a file at
//! `/etc/security/console.apps/<app>` naming the real program, the
//! identity it runs as, and the authorization rules. The file is only
//! trusted if it is a regular file that others cannot write; anything
//! else is a deny.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::warn;

use crate::error::HelperError;
use crate::error::Result;

/// Directory holding the per-application policy files.
pub const POLICY_DIR: &str = "/etc/security/console.apps";

/// Probe order for a `PROGRAM` entry given without a path.
pub const PROGRAM_DIRS: &[&str] = &["/usr/sbin", "/sbin"];

/// `USER` value meaning "whoever invoked us".
const CALLER_SENTINEL: &str = "<USER>";

const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Immutable per-invocation policy, parsed once from the policy file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Target account to run as; `None` means the invoking caller.
    pub target_user: Option<String>,
    /// Absolute path of the real program.
    pub program_path: PathBuf,
    /// Whether a full login-style session is opened around the program.
    pub session: bool,
    /// Whether exhausted authentication may fall back to running the
    /// program unprivileged as the caller.
    pub fallback_allowed: bool,
    /// Upper bound on authentication attempts.
    pub retry_budget: u32,
    /// Arguments that unconditionally abort the invocation.
    pub deny_args: Vec<String>,
    /// Whether a graphical conversation is permitted at all.
    pub use_gui: bool,
    /// Arguments that force a non-graphical conversation.
    pub gui_disable_args: Vec<String>,
    /// Whether to also start the companion helper on session start.
    pub launch_companion: bool,
}

impl Policy {
    /// Load and validate the policy for `app` from the system policy
    /// directory.
    pub fn load(app: &str) -> Result<Policy> {
        Self::load_from(Path::new(POLICY_DIR), PROGRAM_DIRS, app)
    }

    /// Load from an explicit directory and program probe list. The
    /// production entry point is [`Policy::load`]; this exists so the
    /// loader can be exercised against scratch directories.
    pub fn load_from(dir: &Path, program_dirs: &[&str], app: &str) -> Result<Policy> {
        let path = dir.join(app);
        let meta = std::fs::metadata(&path).map_err(|e| {
            HelperError::Config(format!("can't stat {}: {e}", path.display()))
        })?;
        if !meta.is_file() {
            return Err(HelperError::Config(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        if meta.mode() & 0o002 != 0 {
            return Err(HelperError::Config(format!(
                "bad permissions on {}: world-writable",
                path.display()
            )));
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            HelperError::Config(format!("can't read {}: {e}", path.display()))
        })?;

        let mut target_user = None;
        let mut program = None;
        let mut session = false;
        let mut fallback_allowed = false;
        let mut retry_budget = DEFAULT_RETRY_BUDGET;
        let mut deny_args = Vec::new();
        let mut use_gui = true;
        let mut gui_disable_args = Vec::new();
        let mut launch_companion = false;

        for line in contents.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key.eq_ignore_ascii_case("USER") {
                target_user = Some(value.to_string());
            } else if key.eq_ignore_ascii_case("PROGRAM") {
                program = Some(value.to_string());
            } else if key.eq_ignore_ascii_case("SESSION") {
                session = parse_bool(value, false);
            } else if key.eq_ignore_ascii_case("FALLBACK") {
                fallback_allowed = parse_bool(value, false);
            } else if key.eq_ignore_ascii_case("RETRY") {
                retry_budget = value.trim().parse().unwrap_or(DEFAULT_RETRY_BUDGET);
            } else if key.eq_ignore_ascii_case("DENY") {
                deny_args.extend(
                    value
                        .split(";;")
                        .filter(|t| !t.is_empty())
                        .map(str::to_string),
                );
            } else if key.eq_ignore_ascii_case("GUI") {
                use_gui = parse_bool(value, true);
            } else if key.eq_ignore_ascii_case("NOXOPTION") {
                if !value.is_empty() {
                    gui_disable_args.push(value.to_string());
                }
            } else if key.eq_ignore_ascii_case("KDEINIT") {
                launch_companion = parse_bool(value, false);
            } else {
                debug!(key, "ignoring unknown policy directive");
            }
        }

        let Some(program) = program else {
            return Err(HelperError::Config(format!(
                "{} has no PROGRAM entry",
                path.display()
            )));
        };
        let program_path = resolve_program(&program, program_dirs)?;

        if target_user
            .as_deref()
            .is_some_and(|u| u.eq_ignore_ascii_case(CALLER_SENTINEL))
        {
            target_user = None;
        }

        debug!(app, program = %program_path.display(), session, "loaded policy");
        Ok(Policy {
            target_user,
            program_path,
            session,
            fallback_allowed,
            retry_budget,
            deny_args,
            use_gui,
            gui_disable_args,
            launch_companion,
        })
    }

    /// First invocation argument that matches the deny list, if any.
    /// The caller must abort before contacting the backend when this
    /// returns `Some`.
    pub fn first_denied_arg<'a>(&self, args: &'a [String]) -> Option<&'a str> {
        args.iter()
            .find(|a| self.deny_args.iter().any(|d| d == *a))
            .map(String::as_str)
    }

    /// Whether any invocation argument forces the conversation off the
    /// graphical path.
    pub fn gui_disabled_by_args(&self, args: &[String]) -> bool {
        args.iter()
            .any(|a| self.gui_disable_args.iter().any(|d| d == a))
    }
}

/// Boolean grammar of the policy file. Anything unrecognized keeps the
/// supplied default.
pub(crate) fn parse_bool(value: &str, dflt: bool) -> bool {
    for t in ["true", "yes", "t", "y", "1"] {
        if value.eq_ignore_ascii_case(t) {
            return true;
        }
    }
    for f in ["false", "no", "f", "n", "0"] {
        if value.eq_ignore_ascii_case(f) {
            return false;
        }
    }
    dflt
}

/// Resolve a `PROGRAM` entry to an absolute executable path. A bare
/// name is probed through `program_dirs`; the first executable match
/// wins.
fn resolve_program(program: &str, program_dirs: &[&str]) -> Result<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(HelperError::Config(format!("{program} is not executable")));
    }
    for dir in program_dirs {
        let candidate = Path::new(dir).join(program);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    warn!(program, "no executable candidate in program directories");
    Err(HelperError::Config(format!(
        "can't find an executable {program}"
    )))
}

/// `access(2)` with `X_OK`, i.e. checked against the real (caller)
/// identity, which is the identity a fallback run would use.
fn is_executable(path: &Path) -> bool {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: cpath is a valid NUL-terminated string for the call.
    unsafe { libc::access(cpath.as_ptr(), libc::X_OK) == 0 }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::os::unix::fs::PermissionsExt;

    use pretty_assertions::assert_eq;

    use super::*;

    fn write_policy(dir: &Path, app: &str, contents: &str) {
        let path = dir.join(app);
        std::fs::write(&path, contents).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
    }

    fn touch_executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn load(dir: &Path, app: &str) -> Result<Policy> {
        Policy::load_from(dir, PROGRAM_DIRS, app)
    }

    #[test]
    fn parses_a_full_policy_file() {
        let tmp = tempfile::tempdir().unwrap();
        let prog = touch_executable(tmp.path(), "backup-tool");
        write_policy(
            tmp.path(),
            "backup",
            &format!(
                "# managed file\n\
                 USER=root\n\
                 PROGRAM={}\n\
                 SESSION=yes\n\
                 FALLBACK=true\n\
                 RETRY=5\n\
                 DENY=--unsafe;;--force\n\
                 GUI=y\n\
                 NOXOPTION=--no-x\n\
                 KDEINIT=1\n",
                prog.display()
            ),
        );
        let policy = load(tmp.path(), "backup").unwrap();
        assert_eq!(policy.target_user.as_deref(), Some("root"));
        assert_eq!(policy.program_path, prog);
        assert!(policy.session);
        assert!(policy.fallback_allowed);
        assert_eq!(policy.retry_budget, 5);
        assert_eq!(policy.deny_args, vec!["--unsafe", "--force"]);
        assert!(policy.use_gui);
        assert_eq!(policy.gui_disable_args, vec!["--no-x"]);
        assert!(policy.launch_companion);
    }

    #[test]
    fn repeated_keys_are_last_write_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let prog = touch_executable(tmp.path(), "tool-bin");
        write_policy(
            tmp.path(),
            "tool",
            &format!(
                "USER=alice\nUSER=bob\nPROGRAM={p}\nRETRY=1\nRETRY=9\nSESSION=yes\nSESSION=no\n",
                p = prog.display()
            ),
        );
        let policy = load(tmp.path(), "tool").unwrap();
        assert_eq!(policy.target_user.as_deref(), Some("bob"));
        assert_eq!(policy.retry_budget, 9);
        assert!(!policy.session);
    }

    #[test]
    fn deny_lists_merge_across_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let prog = touch_executable(tmp.path(), "tool-bin");
        write_policy(
            tmp.path(),
            "tool",
            &format!("PROGRAM={}\nDENY=--a;;--b\nDENY=--c\n", prog.display()),
        );
        let policy = load(tmp.path(), "tool").unwrap();
        assert_eq!(policy.deny_args, vec!["--a", "--b", "--c"]);
        let args = vec!["--x".to_string(), "--c".to_string()];
        assert_eq!(policy.first_denied_arg(&args), Some("--c"));
    }

    #[test]
    fn keys_are_case_insensitive_and_unknown_lines_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let prog = touch_executable(tmp.path(), "tool-bin");
        write_policy(
            tmp.path(),
            "tool",
            &format!(
                "program={}\nsession=TRUE\nnot a directive\nWHATEVER=1\n\n",
                prog.display()
            ),
        );
        let policy = load(tmp.path(), "tool").unwrap();
        assert_eq!(policy.program_path, prog);
        assert!(policy.session);
    }

    #[test]
    fn caller_sentinel_means_no_target_user() {
        let tmp = tempfile::tempdir().unwrap();
        let prog = touch_executable(tmp.path(), "tool-bin");
        write_policy(
            tmp.path(),
            "tool",
            &format!("USER=<USER>\nPROGRAM={}\n", prog.display()),
        );
        let policy = load(tmp.path(), "tool").unwrap();
        assert_eq!(policy.target_user, None);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(tmp.path(), "absent"),
            Err(HelperError::Config(_))
        ));
    }

    #[test]
    fn world_writable_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let prog = touch_executable(tmp.path(), "tool-bin");
        write_policy(tmp.path(), "tool", &format!("PROGRAM={}\n", prog.display()));
        std::fs::set_permissions(
            tmp.path().join("tool"),
            std::fs::Permissions::from_mode(0o666),
        )
        .unwrap();
        assert!(matches!(
            load(tmp.path(), "tool"),
            Err(HelperError::Config(_))
        ));
    }

    #[test]
    fn missing_program_entry_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        write_policy(tmp.path(), "tool", "USER=root\nSESSION=yes\n");
        assert!(matches!(
            load(tmp.path(), "tool"),
            Err(HelperError::Config(_))
        ));
    }

    #[test]
    fn non_executable_program_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let prog = tmp.path().join("tool");
        std::fs::write(&prog, "").unwrap();
        std::fs::set_permissions(&prog, std::fs::Permissions::from_mode(0o644)).unwrap();
        write_policy(tmp.path(), "tool", &format!("PROGRAM={}\n", prog.display()));
        assert!(matches!(
            load(tmp.path(), "tool"),
            Err(HelperError::Config(_))
        ));
    }

    #[test]
    fn bare_program_name_probes_the_fixed_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let sbin = tmp.path().join("sbin");
        std::fs::create_dir(&sbin).unwrap();
        let prog = touch_executable(&sbin, "frob");
        write_policy(tmp.path(), "frob", "PROGRAM=frob\n");
        let dirs = [sbin.to_str().unwrap()];
        let policy = Policy::load_from(tmp.path(), &dirs, "frob").unwrap();
        assert_eq!(policy.program_path, prog);
    }

    #[test]
    fn bool_grammar() {
        for v in ["true", "YES", "t", "Y", "1"] {
            assert!(parse_bool(v, false), "{v}");
        }
        for v in ["false", "NO", "f", "N", "0"] {
            assert!(!parse_bool(v, true), "{v}");
        }
        assert!(parse_bool("maybe", true));
        assert!(!parse_bool("maybe", false));
    }

    #[test]
    fn gui_defaults_on_and_noxoption_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let prog = touch_executable(tmp.path(), "tool-bin");
        write_policy(
            tmp.path(),
            "tool",
            &format!("PROGRAM={}\nNOXOPTION=--text\n", prog.display()),
        );
        let policy = load(tmp.path(), "tool").unwrap();
        assert!(policy.use_gui);
        assert!(policy.gui_disabled_by_args(&["--text".to_string()]));
        assert!(!policy.gui_disabled_by_args(&["--gui".to_string()]));
    }
}
