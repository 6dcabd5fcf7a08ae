//! Core of the `conhelp` setuid console helper.
//!
//! The binary in `conhelp-cli` wires these pieces together: derive the
//! wrapped application from argv, load its policy, vet the caller
//! against the authentication backend, sanitize the environment, and
//! run the program with the configured identity.

pub mod backend;
pub mod controller;
pub mod environment;
pub mod error;
pub mod identity;
pub mod invocation;
#[cfg(feature = "pam")]
pub mod pam;
pub mod policy;
pub mod privilege;
pub mod prompter;
pub mod session;

pub use error::HelperError;
pub use error::Result;
