//! Environment sanitization.
//!
//! The inherited environment is attacker-controlled. A small allow-list
//! is captured up front (each value vetted), then the entire
//! environment is replaced with a fresh map: the accepted captures plus
//! a fixed PATH, LOGNAME and USER. The X authority token is deliberately
//! kept out of the rebuilt environment; it is reinjected only once
//! authorization has been decided (fallback or session open), so no
//! window access is granted early.

use std::collections::BTreeMap;

use tracing::debug;

use crate::identity::UserRecord;

/// Fixed PATH installed for the wrapped program.
pub const SAFE_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin:/root/bin";

const TERM_DEFAULT: &str = "dumb";

/// Allow-listed variables captured before the environment is cleared.
#[derive(Debug, Clone, Default)]
pub struct CapturedEnv {
    pub display: Option<String>,
    pub home: Option<String>,
    pub lang: Option<String>,
    pub lc_all: Option<String>,
    pub lc_messages: Option<String>,
    pub shell: Option<String>,
    pub term: Option<String>,
    pub xauthority: Option<String>,
}

impl CapturedEnv {
    /// Capture from the process environment.
    pub fn capture() -> CapturedEnv {
        Self::capture_with(|name| std::env::var(name).ok())
    }

    /// Capture through an explicit lookup function.
    pub fn capture_with(get: impl Fn(&str) -> Option<String>) -> CapturedEnv {
        let vetted = |name: &str, slash_ok: bool| get(name).and_then(|v| accept(v, slash_ok));
        CapturedEnv {
            display: vetted("DISPLAY", false),
            home: vetted("HOME", true),
            lang: vetted("LANG", false),
            lc_all: vetted("LC_ALL", false),
            lc_messages: vetted("LC_MESSAGES", false),
            shell: vetted("SHELL", false),
            term: vetted("TERM", false).or_else(|| Some(TERM_DEFAULT.to_string())),
            xauthority: vetted("XAUTHORITY", true),
        }
    }
}

/// Vet one inbound value. Traversal sequences and `%` are always
/// rejected; path separators are rejected unless the variable is
/// expected to hold a path.
fn accept(value: String, slash_ok: bool) -> Option<String> {
    if value.contains("..") || value.contains('%') {
        return None;
    }
    if !slash_ok && value.contains('/') {
        return None;
    }
    Some(value)
}

/// The replacement environment, built fresh and installed wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedEnvironment {
    vars: BTreeMap<String, String>,
}

impl SanitizedEnvironment {
    /// Build the replacement map. HOME selection: a root target always
    /// gets root's home; otherwise the accepted inbound HOME, falling
    /// back to the caller's home.
    pub fn build(
        captured: &CapturedEnv,
        caller: &UserRecord,
        target: &UserRecord,
    ) -> SanitizedEnvironment {
        let mut vars = BTreeMap::new();
        let mut put = |name: &str, value: &Option<String>| {
            if let Some(value) = value {
                vars.insert(name.to_string(), value.clone());
            }
        };
        put("DISPLAY", &captured.display);
        put("LANG", &captured.lang);
        put("LC_ALL", &captured.lc_all);
        put("LC_MESSAGES", &captured.lc_messages);
        put("SHELL", &captured.shell);
        put("TERM", &captured.term);

        let home = if target.is_root() {
            Some(target.home.to_string_lossy().into_owned())
        } else {
            captured
                .home
                .clone()
                .or_else(|| Some(caller.home.to_string_lossy().into_owned()))
        };
        put("HOME", &home);

        vars.insert("PATH".to_string(), SAFE_PATH.to_string());
        vars.insert("LOGNAME".to_string(), "root".to_string());
        vars.insert("USER".to_string(), "root".to_string());
        SanitizedEnvironment { vars }
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Replace the process environment with exactly this map.
    pub fn install(&self) {
        // SAFETY: the process is single-threaded at this point; the
        // helper spawns nothing before sanitization is complete.
        // clearenv drops every environ entry, including degenerate
        // ones (no `=` separator) that unsetenv cannot address.
        unsafe {
            libc::clearenv();
            for (key, value) in &self.vars {
                std::env::set_var(key, value);
            }
        }
        debug!(keys = self.vars.len(), "installed sanitized environment");
    }
}

/// Put a vetted X authority token back. Called on the fallback path and
/// after session open, never earlier.
pub fn reinject_xauthority(captured: &CapturedEnv) {
    if let Some(token) = &captured.xauthority {
        // SAFETY: still single-threaded; no child has been spawned yet.
        unsafe {
            std::env::set_var("XAUTHORITY", token);
        }
    }
}
