//! Minimal Linux-PAM FFI surface.
//!
//! Only the client-side calls the helper needs. The message array
//! follows the Linux-PAM convention (an array of pointers), which is
//! what `libpam` on every supported target implements.

#![allow(non_camel_case_types)]

use libc::c_char;
use libc::c_int;
use libc::c_void;

pub const PAM_SUCCESS: c_int = 0;
pub const PAM_CONV_ERR: c_int = 19;
pub const PAM_ABORT: c_int = 26;

pub const PAM_USER: c_int = 2;

pub const PAM_PROMPT_ECHO_OFF: c_int = 1;
pub const PAM_PROMPT_ECHO_ON: c_int = 2;
pub const PAM_ERROR_MSG: c_int = 3;
pub const PAM_TEXT_INFO: c_int = 4;

/// Opaque handle.
#[repr(C)]
pub struct pam_handle {
    _private: [u8; 0],
}

#[repr(C)]
pub struct pam_message {
    pub msg_style: c_int,
    pub msg: *const c_char,
}

#[repr(C)]
pub struct pam_response {
    pub resp: *mut c_char,
    pub resp_retcode: c_int,
}

pub type conv_fn = unsafe extern "C" fn(
    num_msg: c_int,
    msg: *mut *const pam_message,
    resp: *mut *mut pam_response,
    appdata_ptr: *mut c_void,
) -> c_int;

#[repr(C)]
pub struct pam_conv {
    pub conv: Option<conv_fn>,
    pub appdata_ptr: *mut c_void,
}

#[link(name = "pam")]
unsafe extern "C" {
    pub fn pam_start(
        service_name: *const c_char,
        user: *const c_char,
        pam_conversation: *const pam_conv,
        pamh: *mut *mut pam_handle,
    ) -> c_int;
    pub fn pam_end(pamh: *mut pam_handle, pam_status: c_int) -> c_int;
    pub fn pam_authenticate(pamh: *mut pam_handle, flags: c_int) -> c_int;
    pub fn pam_acct_mgmt(pamh: *mut pam_handle, flags: c_int) -> c_int;
    pub fn pam_open_session(pamh: *mut pam_handle, flags: c_int) -> c_int;
    pub fn pam_close_session(pamh: *mut pam_handle, flags: c_int) -> c_int;
    pub fn pam_get_item(
        pamh: *const pam_handle,
        item_type: c_int,
        item: *mut *const c_void,
    ) -> c_int;
    pub fn pam_getenvlist(pamh: *mut pam_handle) -> *mut *mut c_char;
    pub fn pam_strerror(pamh: *mut pam_handle, errnum: c_int) -> *const c_char;
}
