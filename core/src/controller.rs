//! The authorization state machine.
//!
//! START → AUTHENTICATING → {AUTHENTICATED | FALLBACK | DENIED} →
//! ACCOUNT_CHECK → {AUTHORIZED | DENIED} → SESSION_OPEN? → RUNNING →
//! SESSION_CLOSE? → END.
//!
//! Every path, fatal or not, funnels through exactly one `end()` on the
//! backend handle before control returns to the caller. The deny-list
//! gate runs before a handle even exists.

use std::rc::Rc;

use tracing::debug;
use tracing::warn;

use crate::backend::AuthBackend;
use crate::backend::BACKEND_SUCCESS;
use crate::backend::BackendError;
use crate::environment;
use crate::environment::CapturedEnv;
use crate::error::HelperError;
use crate::error::Result;
use crate::identity::InvocationIdentity;
use crate::policy::Policy;
use crate::prompter::ConvFlags;
use crate::session;
use crate::session::TargetLauncher;

/// Abort if any invocation argument is on the policy deny list. Must be
/// called before the backend handle is opened.
pub fn check_deny(policy: &Policy, args: &[String]) -> Result<()> {
    if let Some(argument) = policy.first_denied_arg(args) {
        warn!(argument, "invocation argument is deny-listed");
        return Err(HelperError::DeniedArgument {
            argument: argument.to_string(),
        });
    }
    Ok(())
}

/// Where the bounded authentication loop landed.
enum AuthDecision {
    Authorized,
    Fallback { code: i32 },
}

pub struct AuthController<'a> {
    policy: &'a Policy,
    identity: &'a InvocationIdentity,
    captured: &'a CapturedEnv,
    flags: Rc<ConvFlags>,
    backend: Box<dyn AuthBackend + 'a>,
    ended: bool,
}

impl<'a> AuthController<'a> {
    pub fn new(
        policy: &'a Policy,
        identity: &'a InvocationIdentity,
        captured: &'a CapturedEnv,
        flags: Rc<ConvFlags>,
        backend: Box<dyn AuthBackend + 'a>,
    ) -> AuthController<'a> {
        AuthController {
            policy,
            identity,
            captured,
            flags,
            backend,
            ended: false,
        }
    }

    /// Run the whole machine. On success the returned code is the final
    /// process exit code; with the production launcher the no-session
    /// and fallback arms do not return at all because the process image
    /// is replaced.
    pub fn run(
        mut self,
        argv: &[String],
        launcher: &mut dyn TargetLauncher,
    ) -> Result<i32> {
        let outcome = self.drive(argv, launcher);
        if let Err(err) = &outcome {
            // The single finalize funnel for every fatal path.
            self.end(err.backend_code());
        }
        outcome
    }

    fn drive(&mut self, argv: &[String], launcher: &mut dyn TargetLauncher) -> Result<i32> {
        match self.authorize()? {
            AuthDecision::Fallback { code } => {
                warn!("authentication exhausted; falling back to unprivileged run");
                self.end(code);
                environment::reinject_xauthority(self.captured);
                launcher.exec_as_caller(
                    &self.identity.caller,
                    &self.policy.program_path,
                    argv,
                )
            }
            AuthDecision::Authorized if !self.policy.session => {
                self.end(BACKEND_SUCCESS);
                launcher.exec_in_place(&self.policy.program_path, argv)
            }
            AuthDecision::Authorized => {
                // Graphical targets need window access once authorized.
                environment::reinject_xauthority(self.captured);
                self.backend.open_session().map_err(auth_error)?;
                let session_env = self.backend.session_env();
                let status = launcher.run_session(
                    &self.policy.program_path,
                    argv,
                    &session_env,
                    self.policy.launch_companion,
                )?;
                self.backend.close_session().map_err(auth_error)?;
                self.end(BACKEND_SUCCESS);
                Ok(session::session_exit_code(status))
            }
        }
    }

    /// AUTHENTICATING and ACCOUNT_CHECK.
    fn authorize(&mut self) -> Result<AuthDecision> {
        let mut failure = Some(BackendError::new(1, "authentication not attempted"));
        for attempt in 1..=self.policy.retry_budget {
            match self.backend.authenticate() {
                Ok(()) => {
                    failure = None;
                    break;
                }
                Err(err) => {
                    debug!(attempt, code = err.code, "authentication attempt failed");
                    failure = Some(err);
                    if self.flags.cancelled.get() || self.flags.fallback_chosen.get() {
                        break;
                    }
                }
            }
        }

        if let Some(failure) = failure {
            if self.flags.cancelled.get() {
                return Err(auth_error(failure));
            }
            if self.policy.fallback_allowed {
                return Ok(AuthDecision::Fallback { code: failure.code });
            }
            return Err(auth_error(failure));
        }

        // The backend must have bound exactly the identity the policy
        // asked for; anything else is treated as a spoofing attempt.
        let authenticated = self.backend.authenticated_user().map_err(auth_error)?;
        if authenticated != self.identity.target.name {
            warn!(
                authenticated,
                requested = self.identity.target.name,
                "backend identity mismatch"
            );
            return Err(HelperError::IdentityMismatch {
                authenticated,
                requested: self.identity.target.name.clone(),
            });
        }

        self.backend.validate_account().map_err(auth_error)?;
        Ok(AuthDecision::Authorized)
    }

    fn end(&mut self, code: i32) {
        if !self.ended {
            self.backend.end(code);
            self.ended = true;
        }
    }
}

fn auth_error(err: BackendError) -> HelperError {
    HelperError::Auth {
        code: err.code,
        message: err.message,
    }
}
