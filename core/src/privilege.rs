//! Privilege transitions.
//!
//! Both transitions are one-way for the remainder of the invocation and
//! every syscall is verified by reading the identity back. A transition
//! whose read-back does not match is a fatal condition: the return code
//! of the syscall alone is never trusted, because a partial drop leaves
//! the process at an unintended privilege level.

use std::ffi::CString;

use tracing::debug;

use crate::error::HelperError;
use crate::error::Result;
use crate::identity::UserRecord;

/// Drop to the invoking caller: supplementary groups from the passwd
/// entry, group to the real gid, then both uids to the real uid.
pub fn become_caller(user: &UserRecord) -> Result<()> {
    let name = CString::new(user.name.as_bytes())
        .map_err(|_| HelperError::Transition("caller name contains NUL"))?;
    // SAFETY: plain identity syscalls; name is NUL-terminated.
    unsafe {
        let rgid = libc::getgid();
        let ruid = libc::getuid();
        if libc::initgroups(name.as_ptr(), rgid) != 0 {
            return Err(HelperError::Transition("initgroups failed"));
        }
        if libc::setregid(rgid, rgid) != 0 || libc::getegid() != rgid {
            return Err(HelperError::Transition("effective gid is not the real gid"));
        }
        if libc::setreuid(ruid, ruid) != 0 || libc::geteuid() != ruid {
            return Err(HelperError::Transition("effective uid is not the real uid"));
        }
        debug!(uid = ruid, gid = rgid, "dropped to caller");
    }
    Ok(())
}

/// Raise to full root: clear supplementary groups, both gids and both
/// uids to 0, then verify all four identity fields read back as 0.
pub fn become_root() -> Result<()> {
    // SAFETY: plain identity syscalls.
    unsafe {
        if libc::setgroups(0, std::ptr::null()) != 0 {
            return Err(HelperError::Transition("setgroups failed"));
        }
        if libc::setregid(0, 0) != 0 {
            return Err(HelperError::Transition("setregid failed"));
        }
        if libc::setreuid(0, 0) != 0 {
            return Err(HelperError::Transition("setreuid failed"));
        }
        if libc::getuid() != 0
            || libc::geteuid() != 0
            || libc::getgid() != 0
            || libc::getegid() != 0
        {
            return Err(HelperError::Transition("identity did not verify as root"));
        }
    }
    debug!("raised to root");
    Ok(())
}
