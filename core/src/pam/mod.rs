//! The PAM authentication backend.
//!
//! Owns the `pam_handle_t` for the whole invocation and adapts the
//! callback-style PAM conversation to the [`Prompter`] capability: each
//! callback invocation becomes one atomic conversation round.

mod sys;

use std::ffi::CStr;
use std::ffi::CString;
use std::rc::Rc;

use libc::c_int;
use libc::c_void;

use crate::backend::AuthBackend;
use crate::backend::BackendError;
use crate::prompter::ConvFlags;
use crate::prompter::ConverseError;
use crate::prompter::Message;
use crate::prompter::Prompter;

/// State handed to the conversation callback through `appdata_ptr`.
struct ConversationContext {
    prompter: Box<dyn Prompter>,
    flags: Rc<ConvFlags>,
}

pub struct PamBackend {
    handle: *mut sys::pam_handle,
    // Both referenced by libpam for the lifetime of the handle.
    _conv: Box<sys::pam_conv>,
    _context: Box<ConversationContext>,
}

impl PamBackend {
    /// `pam_start` for the given service (application) name and target
    /// user. The prompter conducts every conversation on this handle.
    pub fn start(
        service: &str,
        user: &str,
        prompter: Box<dyn Prompter>,
        flags: Rc<ConvFlags>,
    ) -> Result<PamBackend, BackendError> {
        let cservice = CString::new(service)
            .map_err(|_| BackendError::new(1, "service name contains NUL"))?;
        let cuser =
            CString::new(user).map_err(|_| BackendError::new(1, "user name contains NUL"))?;
        let mut context = Box::new(ConversationContext { prompter, flags });
        let conv = Box::new(sys::pam_conv {
            conv: Some(conversation),
            appdata_ptr: (&mut *context as *mut ConversationContext).cast(),
        });
        let mut handle: *mut sys::pam_handle = std::ptr::null_mut();
        // SAFETY: all pointers are valid; conv and context outlive the
        // handle because PamBackend owns them.
        let rc = unsafe { sys::pam_start(cservice.as_ptr(), cuser.as_ptr(), &*conv, &mut handle) };
        if rc != sys::PAM_SUCCESS || handle.is_null() {
            return Err(BackendError::new(rc, "can't start the authentication service"));
        }
        Ok(PamBackend {
            handle,
            _conv: conv,
            _context: context,
        })
    }

    fn check(&self, rc: c_int) -> Result<(), BackendError> {
        if rc == sys::PAM_SUCCESS {
            return Ok(());
        }
        // SAFETY: handle is live; pam_strerror returns a static string.
        let message = unsafe {
            let ptr = sys::pam_strerror(self.handle, rc);
            if ptr.is_null() {
                "authentication failure".to_string()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        };
        Err(BackendError::new(rc, message))
    }
}

impl AuthBackend for PamBackend {
    fn authenticate(&mut self) -> Result<(), BackendError> {
        // SAFETY: handle is live.
        let rc = unsafe { sys::pam_authenticate(self.handle, 0) };
        self.check(rc)
    }

    fn authenticated_user(&mut self) -> Result<String, BackendError> {
        let mut item: *const c_void = std::ptr::null();
        // SAFETY: handle is live; item stays owned by libpam.
        let rc = unsafe { sys::pam_get_item(self.handle, sys::PAM_USER, &mut item) };
        self.check(rc)?;
        if item.is_null() {
            return Err(BackendError::new(1, "no user attached to the handle"));
        }
        // SAFETY: PAM_USER is a NUL-terminated string item.
        Ok(unsafe { CStr::from_ptr(item.cast()).to_string_lossy().into_owned() })
    }

    fn validate_account(&mut self) -> Result<(), BackendError> {
        // SAFETY: handle is live.
        let rc = unsafe { sys::pam_acct_mgmt(self.handle, 0) };
        self.check(rc)
    }

    fn open_session(&mut self) -> Result<(), BackendError> {
        // SAFETY: handle is live.
        let rc = unsafe { sys::pam_open_session(self.handle, 0) };
        self.check(rc)
    }

    fn close_session(&mut self) -> Result<(), BackendError> {
        // SAFETY: handle is live.
        let rc = unsafe { sys::pam_close_session(self.handle, 0) };
        self.check(rc)
    }

    fn session_env(&mut self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        // SAFETY: handle is live; the list and its strings are ours to
        // free.
        unsafe {
            let list = sys::pam_getenvlist(self.handle);
            if list.is_null() {
                return pairs;
            }
            let mut cursor = list;
            while !(*cursor).is_null() {
                let entry = CStr::from_ptr(*cursor).to_string_lossy().into_owned();
                if let Some((key, value)) = entry.split_once('=') {
                    pairs.push((key.to_string(), value.to_string()));
                }
                libc::free((*cursor).cast());
                cursor = cursor.add(1);
            }
            libc::free(list.cast());
        }
        pairs
    }

    fn end(&mut self, code: i32) {
        if self.handle.is_null() {
            return;
        }
        // SAFETY: handle is live and released exactly once.
        unsafe {
            sys::pam_end(self.handle, code);
        }
        self.handle = std::ptr::null_mut();
    }
}

/// Map one raw PAM message to the typed conversation message. `None`
/// for any style outside the documented four, which aborts the round.
fn map_message(style: c_int, text: String) -> Option<Message> {
    match style {
        sys::PAM_PROMPT_ECHO_ON => Some(Message::PromptEchoOn(text)),
        sys::PAM_PROMPT_ECHO_OFF => Some(Message::PromptEchoOff(text)),
        sys::PAM_TEXT_INFO => Some(Message::Info(text)),
        sys::PAM_ERROR_MSG => Some(Message::Error(text)),
        _ => None,
    }
}

/// The conversation trampoline registered with libpam. One invocation
/// is one atomic round against the prompter.
unsafe extern "C" fn conversation(
    num_msg: c_int,
    msg: *mut *const sys::pam_message,
    resp: *mut *mut sys::pam_response,
    appdata_ptr: *mut c_void,
) -> c_int {
    if num_msg <= 0 || msg.is_null() || resp.is_null() || appdata_ptr.is_null() {
        return sys::PAM_CONV_ERR;
    }
    // SAFETY: appdata_ptr is the ConversationContext registered in
    // start(), alive for the lifetime of the handle.
    let context = unsafe { &mut *appdata_ptr.cast::<ConversationContext>() };

    let count = num_msg as usize;
    let mut messages = Vec::with_capacity(count);
    for index in 0..count {
        // SAFETY: libpam hands us `count` valid message pointers.
        let raw = unsafe { &**msg.add(index) };
        let text = if raw.msg.is_null() {
            String::new()
        } else {
            // SAFETY: message text is NUL-terminated.
            unsafe { CStr::from_ptr(raw.msg).to_string_lossy().into_owned() }
        };
        let Some(message) = map_message(raw.msg_style, text) else {
            return sys::PAM_CONV_ERR;
        };
        messages.push(message);
    }

    let answers = match context.prompter.converse(&messages) {
        Ok(answers) if answers.len() == count => answers,
        Ok(_) => return sys::PAM_CONV_ERR,
        Err(ConverseError::Cancelled) => {
            context.flags.cancelled.set(true);
            return sys::PAM_ABORT;
        }
        Err(ConverseError::Refused) => return sys::PAM_CONV_ERR,
    };

    // SAFETY: libpam frees the response array and each strdup'd string
    // with free(), so both must come from the C allocator.
    unsafe {
        let replies: *mut sys::pam_response =
            libc::calloc(count, std::mem::size_of::<sys::pam_response>()).cast();
        if replies.is_null() {
            return sys::PAM_CONV_ERR;
        }
        for (index, answer) in answers.iter().enumerate() {
            let slot = &mut *replies.add(index);
            slot.resp_retcode = sys::PAM_SUCCESS;
            slot.resp = match answer {
                Some(text) => match CString::new(text.as_str()) {
                    Ok(ctext) => libc::strdup(ctext.as_ptr()),
                    Err(_) => {
                        free_replies(replies, index);
                        return sys::PAM_CONV_ERR;
                    }
                },
                None => std::ptr::null_mut(),
            };
        }
        *resp = replies;
    }
    sys::PAM_SUCCESS
}

/// # Safety
/// `replies` must be a calloc'd array with at least `filled` populated
/// entries.
unsafe fn free_replies(replies: *mut sys::pam_response, filled: usize) {
    // SAFETY: per contract; null resp pointers are fine to free.
    unsafe {
        for index in 0..filled {
            libc::free((*replies.add(index)).resp.cast::<c_void>());
        }
        libc::free(replies.cast());
    }
}

impl Drop for PamBackend {
    fn drop(&mut self) {
        // Backstop only; the controller ends the handle with a real
        // result code on every path.
        if !self.handle.is_null() {
            self.end(sys::PAM_ABORT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_message_style_is_a_protocol_violation() {
        assert_eq!(map_message(99, "x".to_string()), None);
        assert!(map_message(sys::PAM_PROMPT_ECHO_OFF, "x".to_string()).is_some());
        assert!(map_message(sys::PAM_TEXT_INFO, "x".to_string()).is_some());
    }
}
