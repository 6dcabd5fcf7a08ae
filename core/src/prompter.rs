//! Conversation capability.
//!
//! The authentication backend drives a conversation: a round of
//! messages arrives, the prompter shows them and returns the answers
//! keyed by original message order. Three variants exist. Silent mode
//! refuses everything and is the floor when there is neither a terminal
//! nor a display. Text mode talks to the controlling terminal.
//! Graphical mode queues the whole round into one external dialog and
//! shows it once.

use std::cell::Cell;
use std::io::BufRead;
use std::io::Write;
use std::rc::Rc;

use tracing::debug;

use crate::environment::CapturedEnv;
use crate::policy::Policy;

/// One backend message within a conversation round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Input request, echoed (e.g. a login name).
    PromptEchoOn(String),
    /// Input request, not echoed (e.g. a password).
    PromptEchoOff(String),
    /// Informational text.
    Info(String),
    /// Error text.
    Error(String),
}

impl Message {
    fn wants_answer(&self) -> bool {
        matches!(self, Message::PromptEchoOn(_) | Message::PromptEchoOff(_))
    }
}

/// Why a conversation round produced no answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverseError {
    /// The user dismissed the round. Fatal for the whole invocation,
    /// never eligible for fallback.
    Cancelled,
    /// This prompter cannot conduct conversations (silent mode, or a
    /// terminal that went away mid-round).
    Refused,
}

/// Mutable conversation flags shared between the prompter and the
/// authentication state machine.
#[derive(Debug, Default)]
pub struct ConvFlags {
    pub cancelled: Cell<bool>,
    pub fallback_chosen: Cell<bool>,
}

/// A conversation capability. One `converse` call is one atomic round:
/// every message is presented together and the answers come back in
/// message order, `Some` exactly for the entries that requested input.
pub trait Prompter {
    fn converse(
        &mut self,
        messages: &[Message],
    ) -> Result<Vec<Option<String>>, ConverseError>;
}

/// Refuses every round. Used when no interaction channel exists, so a
/// backend that needs input fails instead of hanging.
#[derive(Debug, Default)]
pub struct SilentPrompter;

impl Prompter for SilentPrompter {
    fn converse(&mut self, _: &[Message]) -> Result<Vec<Option<String>>, ConverseError> {
        Err(ConverseError::Refused)
    }
}

/// Terminal conversation on stdin/stderr. Constructed non-interactive
/// it refuses rounds outright, which matches the historical behavior of
/// console helpers that were GUI-or-nothing.
pub struct TextPrompter {
    interactive: bool,
}

impl TextPrompter {
    pub fn new(interactive: bool) -> TextPrompter {
        TextPrompter { interactive }
    }
}

impl Prompter for TextPrompter {
    fn converse(
        &mut self,
        messages: &[Message],
    ) -> Result<Vec<Option<String>>, ConverseError> {
        if !self.interactive {
            return Err(ConverseError::Refused);
        }
        let mut answers = Vec::with_capacity(messages.len());
        for message in messages {
            match message {
                Message::PromptEchoOn(text) => {
                    answers.push(Some(read_reply(text, true)?));
                }
                Message::PromptEchoOff(text) => {
                    answers.push(Some(read_reply(text, false)?));
                }
                Message::Info(text) | Message::Error(text) => {
                    eprintln!("{text}");
                    answers.push(None);
                }
            }
        }
        Ok(answers)
    }
}

fn read_reply(prompt: &str, echo: bool) -> Result<String, ConverseError> {
    eprint!("{prompt}");
    let _ = std::io::stderr().flush();
    let guard = if echo { None } else { EchoGuard::disable() };
    let mut line = String::new();
    let read = std::io::stdin().lock().read_line(&mut line);
    drop(guard);
    if !echo {
        eprintln!();
    }
    match read {
        Ok(0) | Err(_) => Err(ConverseError::Refused),
        Ok(_) => Ok(line.trim_end_matches(['\n', '\r']).to_string()),
    }
}

/// Turns terminal echo off for the lifetime of the guard.
struct EchoGuard {
    saved: libc::termios,
}

impl EchoGuard {
    fn disable() -> Option<EchoGuard> {
        // SAFETY: out-pointer is valid; fd 0 is checked by the call.
        unsafe {
            let mut term: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut term) != 0 {
                return None;
            }
            let saved = term;
            term.c_lflag &= !libc::ECHO;
            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSAFLUSH, &term) != 0 {
                return None;
            }
            Some(EchoGuard { saved })
        }
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        // SAFETY: restoring the attributes we read earlier.
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSAFLUSH, &self.saved);
        }
    }
}

/// Result of showing a finalized dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogOutcome {
    Accepted,
    Cancelled,
}

/// External graphical collaborator. Entries are indexed by the order
/// they were added; `value_at` is meaningful only for prompt entries.
pub trait PromptDialog {
    fn add_prompt(&mut self, text: &str, secret: bool);
    fn add_info(&mut self, text: &str);
    fn finalize_and_show(&mut self) -> DialogOutcome;
    fn value_at(&self, index: usize) -> Option<String>;
}

/// Builds one dialog per conversation round.
pub type DialogFactory = Box<dyn FnMut() -> Box<dyn PromptDialog>>;

/// Queues a whole round into one dialog, shows it once, and maps the
/// accepted values back by message order. Cancellation is recorded in
/// the shared flags so the state machine can distinguish it from plain
/// authentication failure.
pub struct GuiPrompter {
    new_dialog: DialogFactory,
    flags: Rc<ConvFlags>,
}

impl GuiPrompter {
    pub fn new(new_dialog: DialogFactory, flags: Rc<ConvFlags>) -> GuiPrompter {
        GuiPrompter { new_dialog, flags }
    }
}

impl Prompter for GuiPrompter {
    fn converse(
        &mut self,
        messages: &[Message],
    ) -> Result<Vec<Option<String>>, ConverseError> {
        let mut dialog = (self.new_dialog)();
        for message in messages {
            match message {
                Message::PromptEchoOn(text) => dialog.add_prompt(text, false),
                Message::PromptEchoOff(text) => dialog.add_prompt(text, true),
                Message::Info(text) | Message::Error(text) => dialog.add_info(text),
            }
        }
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        match dialog.finalize_and_show() {
            DialogOutcome::Cancelled => {
                self.flags.cancelled.set(true);
                Err(ConverseError::Cancelled)
            }
            DialogOutcome::Accepted => Ok(messages
                .iter()
                .enumerate()
                .map(|(index, message)| {
                    if message.wants_answer() {
                        Some(dialog.value_at(index).unwrap_or_default())
                    } else {
                        None
                    }
                })
                .collect()),
        }
    }
}

/// Upgrade path: silent, then text if stdin is a terminal, then
/// graphical if a display was captured, the policy allows it, no
/// argument disabled it, and a dialog implementation is available.
pub fn select_prompter(
    policy: &Policy,
    args: &[String],
    captured: &CapturedEnv,
    stdin_is_tty: bool,
    flags: Rc<ConvFlags>,
    dialog_factory: Option<DialogFactory>,
) -> Box<dyn Prompter> {
    let display_present = captured.display.as_deref().is_some_and(|d| !d.is_empty());
    if display_present
        && policy.use_gui
        && !policy.gui_disabled_by_args(args)
        && let Some(factory) = dialog_factory
    {
        debug!("selected graphical prompter");
        return Box::new(GuiPrompter::new(factory, flags));
    }
    if stdin_is_tty {
        debug!("selected text prompter");
        return Box::new(TextPrompter::new(true));
    }
    debug!("selected silent prompter");
    Box::new(SilentPrompter)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::cell::RefCell;

    use pretty_assertions::assert_eq;

    use super::*;

    /// Scripted stand-in for the external dialog.
    #[derive(Default)]
    struct ScriptedDialog {
        entries: RefCell<Vec<Option<String>>>,
        cancel: bool,
        answers: Vec<String>,
    }

    impl PromptDialog for ScriptedDialog {
        fn add_prompt(&mut self, _text: &str, _secret: bool) {
            let answer = self
                .answers
                .get(self.entries.borrow().iter().flatten().count())
                .cloned()
                .unwrap_or_default();
            self.entries.borrow_mut().push(Some(answer));
        }

        fn add_info(&mut self, _text: &str) {
            self.entries.borrow_mut().push(None);
        }

        fn finalize_and_show(&mut self) -> DialogOutcome {
            if self.cancel {
                DialogOutcome::Cancelled
            } else {
                DialogOutcome::Accepted
            }
        }

        fn value_at(&self, index: usize) -> Option<String> {
            self.entries.borrow().get(index).cloned().flatten()
        }
    }

    fn gui(answers: Vec<String>, cancel: bool, flags: Rc<ConvFlags>) -> GuiPrompter {
        GuiPrompter::new(
            Box::new(move || -> Box<dyn PromptDialog> {
                Box::new(ScriptedDialog {
                    answers: answers.clone(),
                    cancel,
                    ..Default::default()
                })
            }),
            flags,
        )
    }

    #[test]
    fn silent_refuses() {
        let mut p = SilentPrompter;
        assert_eq!(
            p.converse(&[Message::Info("hello".into())]),
            Err(ConverseError::Refused)
        );
    }

    #[test]
    fn non_interactive_text_refuses() {
        let mut p = TextPrompter::new(false);
        assert_eq!(
            p.converse(&[Message::PromptEchoOff("Password: ".into())]),
            Err(ConverseError::Refused)
        );
    }

    #[test]
    fn gui_round_answers_keyed_by_message_order() {
        let flags = Rc::new(ConvFlags::default());
        let mut p = gui(
            vec!["alice".to_string(), "hunter2".to_string()],
            false,
            Rc::clone(&flags),
        );
        let replies = p
            .converse(&[
                Message::Info("Authentication required".into()),
                Message::PromptEchoOn("Login: ".into()),
                Message::PromptEchoOff("Password: ".into()),
            ])
            .unwrap();
        assert_eq!(
            replies,
            vec![None, Some("alice".to_string()), Some("hunter2".to_string())]
        );
        assert!(!flags.cancelled.get());
    }

    #[test]
    fn gui_cancel_sets_the_shared_flag() {
        let flags = Rc::new(ConvFlags::default());
        let mut p = gui(Vec::new(), true, Rc::clone(&flags));
        assert_eq!(
            p.converse(&[Message::PromptEchoOff("Password: ".into())]),
            Err(ConverseError::Cancelled)
        );
        assert!(flags.cancelled.get());
    }

    #[test]
    fn empty_round_needs_no_dialog() {
        let flags = Rc::new(ConvFlags::default());
        let mut p = gui(Vec::new(), true, flags);
        assert_eq!(p.converse(&[]), Ok(Vec::new()));
    }

    mod selection {
        use super::*;
        use crate::policy::Policy;
        use std::path::PathBuf;

        fn policy(use_gui: bool, gui_disable_args: Vec<String>) -> Policy {
            Policy {
                target_user: None,
                program_path: PathBuf::from("/bin/true"),
                session: false,
                fallback_allowed: false,
                retry_budget: 3,
                deny_args: Vec::new(),
                use_gui,
                gui_disable_args,
                launch_companion: false,
            }
        }

        fn captured(display: Option<&str>) -> CapturedEnv {
            CapturedEnv {
                display: display.map(str::to_string),
                ..Default::default()
            }
        }

        fn factory() -> DialogFactory {
            Box::new(|| Box::new(ScriptedDialog::default()) as Box<dyn PromptDialog>)
        }

        fn selected_refuses(prompter: &mut dyn Prompter) -> bool {
            prompter
                .converse(&[Message::Info("x".into())])
                .is_err()
        }

        #[test]
        fn no_tty_no_display_is_silent() {
            let flags = Rc::new(ConvFlags::default());
            let mut p = select_prompter(
                &policy(true, Vec::new()),
                &[],
                &captured(None),
                false,
                flags,
                Some(factory()),
            );
            assert!(selected_refuses(p.as_mut()));
        }

        #[test]
        fn display_and_policy_upgrade_to_gui() {
            let flags = Rc::new(ConvFlags::default());
            let mut p = select_prompter(
                &policy(true, Vec::new()),
                &[],
                &captured(Some(":0")),
                true,
                flags,
                Some(factory()),
            );
            // The scripted dialog accepts, so a GUI selection converses.
            assert!(p.converse(&[Message::Info("x".into())]).is_ok());
        }

        #[test]
        fn gui_disable_arg_forces_text() {
            let flags = Rc::new(ConvFlags::default());
            let mut p = select_prompter(
                &policy(true, vec!["--no-x".to_string()]),
                &[String::from("--no-x")],
                &captured(Some(":0")),
                false,
                flags,
                Some(factory()),
            );
            // Downgraded below GUI; with no tty this lands on silent.
            assert!(selected_refuses(p.as_mut()));
        }

        #[test]
        fn policy_gui_off_blocks_upgrade() {
            let flags = Rc::new(ConvFlags::default());
            let mut p = select_prompter(
                &policy(false, Vec::new()),
                &[],
                &captured(Some(":0")),
                false,
                flags,
                Some(factory()),
            );
            assert!(selected_refuses(p.as_mut()));
        }

        #[test]
        fn missing_factory_blocks_upgrade() {
            let flags = Rc::new(ConvFlags::default());
            let mut p = select_prompter(
                &policy(true, Vec::new()),
                &[],
                &captured(Some(":0")),
                false,
                flags,
                None,
            );
            assert!(selected_refuses(p.as_mut()));
        }
    }
}
