//! Which application are we wrapping?
//!
//! Normally the helper is installed as a symlink named after the
//! wrapped program and argv[0] answers the question. Invoked under its
//! own name it behaves like `su`: argv is shifted left by one and the
//! wrapped command becomes argv[0].

use crate::error::HelperError;
use crate::error::Result;

/// Names under which the helper recognizes itself.
pub const SELF_NAMES: &[&str] = &["conhelp", "consolehelper"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Application name keying the policy file.
    pub app: String,
    /// Argument vector handed to the target program, argv[0] included.
    pub argv: Vec<String>,
}

impl Invocation {
    /// Arguments after argv[0]; the slice the deny and NOXOPTION lists
    /// are matched against.
    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }
}

/// Derive the application name from the raw argv, shifting once when
/// invoked under one of our own names.
pub fn derive(mut argv: Vec<String>) -> Result<Invocation> {
    let mut app = basename(argv.first().map(String::as_str).unwrap_or_default());
    if SELF_NAMES.contains(&app.as_str()) {
        if argv.len() < 2 {
            return Err(HelperError::Config(format!(
                "usage: {app} <command> [arguments]"
            )));
        }
        argv.remove(0);
        app = basename(&argv[0]);
    }
    if app.is_empty() {
        return Err(HelperError::Config("can't determine the application name".to_string()));
    }
    Ok(Invocation { app, argv })
}

fn basename(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((_, name)) => name.to_string(),
        None => path.to_string(),
    }
}
