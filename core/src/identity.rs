//! Caller and target account records.
//!
//! Both records are looked up exactly once at startup from the passwd
//! database and treated as read-only afterwards.

use std::ffi::CStr;
use std::ffi::CString;
use std::path::PathBuf;

use crate::error::HelperError;
use crate::error::Result;

/// One passwd entry, copied out of the NSS buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub home: PathBuf,
}

impl UserRecord {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// The two identities of one invocation: who called us (from the real
/// uid) and who the policy says the program runs as.
#[derive(Debug, Clone)]
pub struct InvocationIdentity {
    pub caller: UserRecord,
    pub target: UserRecord,
}

impl InvocationIdentity {
    /// Resolve the caller from the process's real uid and the target
    /// from the policy's user entry (`None` meaning the caller).
    pub fn resolve(target_user: Option<&str>) -> Result<InvocationIdentity> {
        // SAFETY: getuid has no preconditions.
        let ruid = unsafe { libc::getuid() };
        let caller = lookup_uid(ruid)?
            .ok_or_else(|| HelperError::Config("you don't have a user name".to_string()))?;
        let target = match target_user {
            None => caller.clone(),
            Some(name) => lookup_name(name)?
                .ok_or_else(|| HelperError::Config(format!("user {name} doesn't exist")))?,
        };
        Ok(InvocationIdentity { caller, target })
    }
}

/// Look up a passwd entry by uid. `Ok(None)` means no such entry.
pub fn lookup_uid(uid: libc::uid_t) -> Result<Option<UserRecord>> {
    // SAFETY: out-pointers are valid for the duration of the call and
    // buf outlives result extraction.
    unsafe {
        let mut pwd: libc::passwd = std::mem::zeroed();
        let mut buf = vec![0u8; pw_buffer_size()];
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            &mut result,
        );
        extract(rc, result)
    }
}

/// Look up a passwd entry by name. `Ok(None)` means no such entry.
pub fn lookup_name(name: &str) -> Result<Option<UserRecord>> {
    let cname = CString::new(name)
        .map_err(|_| HelperError::Config(format!("invalid user name {name:?}")))?;
    // SAFETY: as above; cname is NUL-terminated.
    unsafe {
        let mut pwd: libc::passwd = std::mem::zeroed();
        let mut buf = vec![0u8; pw_buffer_size()];
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = libc::getpwnam_r(
            cname.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            &mut result,
        );
        extract(rc, result)
    }
}

fn pw_buffer_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let suggested = unsafe { libc::sysconf(libc::_SC_GETPW_R_SIZE_MAX) };
    if suggested > 0 { suggested as usize } else { 16384 }
}

/// # Safety
/// `result`, when non-null, must point at a populated passwd whose
/// string fields are valid NUL-terminated pointers.
unsafe fn extract(rc: libc::c_int, result: *mut libc::passwd) -> Result<Option<UserRecord>> {
    if result.is_null() {
        if rc == 0 {
            return Ok(None);
        }
        return Err(HelperError::Config(format!(
            "passwd lookup failed: {}",
            std::io::Error::from_raw_os_error(rc)
        )));
    }
    // SAFETY: caller guarantees the pointed-to fields are valid.
    unsafe {
        let pwd = &*result;
        Ok(Some(UserRecord {
            name: cstr_to_string(pwd.pw_name),
            uid: pwd.pw_uid,
            gid: pwd.pw_gid,
            home: PathBuf::from(cstr_to_string(pwd.pw_dir)),
        }))
    }
}

/// # Safety
/// `ptr` must be null or a valid NUL-terminated string.
unsafe fn cstr_to_string(ptr: *const libc::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: per contract.
    unsafe { CStr::from_ptr(ptr).to_string_lossy().into_owned() }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn current_uid_resolves_to_a_record() {
        // SAFETY: getuid has no preconditions.
        let uid = unsafe { libc::getuid() };
        let record = lookup_uid(uid).unwrap().unwrap();
        assert_eq!(record.uid, uid);
        assert!(!record.name.is_empty());
    }

    #[test]
    fn unknown_user_is_none_not_an_error() {
        let got = lookup_name("no-such-user-conhelp-test").unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn target_defaults_to_caller() {
        let identity = InvocationIdentity::resolve(None).unwrap();
        assert_eq!(identity.caller, identity.target);
    }

    #[test]
    fn unknown_target_user_is_fatal() {
        let err = InvocationIdentity::resolve(Some("no-such-user-conhelp-test"));
        assert!(matches!(err, Err(crate::error::HelperError::Config(_))));
    }

    #[test]
    fn embedded_nul_in_name_is_rejected() {
        assert!(lookup_name("bad\0name").is_err());
    }
}
