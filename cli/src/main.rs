//! `conhelp` — setuid console helper.
//!
//! Installed setuid root and invoked through a symlink named after the
//! wrapped program (or under its own name, su-style). There is no flag
//! parsing here on purpose: every argument belongs to the wrapped
//! program.

use std::io::Write;
use std::rc::Rc;

use conhelp_core::HelperError;
use conhelp_core::Result;
use conhelp_core::backend::AuthBackend;
use conhelp_core::controller;
use conhelp_core::controller::AuthController;
use conhelp_core::environment::CapturedEnv;
use conhelp_core::environment::SanitizedEnvironment;
use conhelp_core::identity::InvocationIdentity;
use conhelp_core::invocation;
use conhelp_core::policy::Policy;
use conhelp_core::prompter::ConvFlags;
use conhelp_core::prompter::Prompter;
use conhelp_core::prompter::select_prompter;
use conhelp_core::session::UnixLauncher;
use tracing::debug;

fn main() {
    // Setuid: never consult the environment for logging configuration.
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let code = match run(argv) {
        Ok(code) => code,
        Err(err) => {
            match &err {
                // Authentication failures surface only what the
                // backend itself said through its prompts.
                HelperError::Auth { .. } | HelperError::IdentityMismatch { .. } => {}
                // Not eprintln: on the session path our stderr is
                // already closed and a failed write must not panic.
                other => {
                    let _ = writeln!(std::io::stderr(), "conhelp: {other}");
                }
            }
            err.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(raw_argv: Vec<String>) -> Result<i32> {
    let invocation = invocation::derive(raw_argv)?;
    debug!(app = invocation.app, "wrapping application");

    let policy = Policy::load(&invocation.app)?;
    controller::check_deny(&policy, invocation.args())?;

    let identity = InvocationIdentity::resolve(policy.target_user.as_deref())?;

    // Capture the allow-list, then replace the environment wholesale
    // before anything is authenticated or executed.
    let captured = CapturedEnv::capture();
    let flags = Rc::new(ConvFlags::default());
    // SAFETY: fd 0 is queried, not touched.
    let stdin_is_tty = unsafe { libc::isatty(libc::STDIN_FILENO) == 1 };
    // No dialog implementation is linked into this binary; the
    // conversation stays on the terminal path and an external graphical
    // collaborator can be slotted in through the factory.
    let prompter = select_prompter(
        &policy,
        invocation.args(),
        &captured,
        stdin_is_tty,
        Rc::clone(&flags),
        None,
    );
    SanitizedEnvironment::build(&captured, &identity.caller, &identity.target).install();

    let backend = start_backend(
        &invocation.app,
        &identity.target.name,
        prompter,
        Rc::clone(&flags),
    )?;
    let ctrl = AuthController::new(&policy, &identity, &captured, flags, backend);
    ctrl.run(&invocation.argv, &mut UnixLauncher)
}

#[cfg(feature = "pam")]
fn start_backend(
    service: &str,
    user: &str,
    prompter: Box<dyn Prompter>,
    flags: Rc<ConvFlags>,
) -> Result<Box<dyn AuthBackend>> {
    let backend = conhelp_core::pam::PamBackend::start(service, user, prompter, flags)
        .map_err(|err| HelperError::Auth {
            code: err.code,
            message: err.message,
        })?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "pam"))]
fn start_backend(
    _service: &str,
    _user: &str,
    _prompter: Box<dyn Prompter>,
    _flags: Rc<ConvFlags>,
) -> Result<Box<dyn AuthBackend>> {
    // Fail closed: a helper built without an authentication backend
    // must never run anything.
    Err(HelperError::Config(
        "built without the pam feature; no authentication backend available".to_string(),
    ))
}
