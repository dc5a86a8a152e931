//! What a recovered panic is: its payload, its classification and the stack
//! recorded where it was raised.

use std::{
    any::Any,
    backtrace::Backtrace,
    cell::{Cell, RefCell},
    io,
    panic::{self, AssertUnwindSafe, PanicHookInfo},
    sync::Once,
};

/// Network operation failure. Panicking with this value (see
/// [`std::panic::panic_any`]) lets the [`Recoverer`](crate::Recoverer) tell a
/// dropped client apart from a program defect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct NetworkError {
    pub message: String,
}

impl NetworkError {
    pub fn new(message: impl Into<String>) -> Self {
        NetworkError {
            message: message.into(),
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        NetworkError::new(err.to_string())
    }
}

/// How a recovered panic is reported and answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The peer went away: broken pipe or connection reset.
    BrokenConnection,
    /// Anything else, application defects included.
    Generic,
}

/// Textual heuristic for a dropped client connection.
pub fn is_broken_connection(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("broken pipe") || message.contains("connection reset by peer")
}

/// Classify a panic payload.
pub fn classify(payload: &(dyn Any + Send)) -> FailureKind {
    if let Some(err) = payload.downcast_ref::<NetworkError>() {
        if is_broken_connection(&err.message) {
            return FailureKind::BrokenConnection;
        }
    } else if let Some(err) = payload.downcast_ref::<io::Error>() {
        if matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
        ) || is_broken_connection(&err.to_string())
        {
            return FailureKind::BrokenConnection;
        }
    }

    FailureKind::Generic
}

/// Render a panic payload for the `error` field.
pub fn describe(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<NetworkError>() {
        err.to_string()
    } else if let Some(err) = payload.downcast_ref::<io::Error>() {
        err.to_string()
    } else {
        "Box<dyn Any>".to_string()
    }
}

thread_local! {
    static LAST_PANIC: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Install a process-wide panic hook. Panics raised inside [`guarded`] only
/// record their backtrace for the recoverer to log; any other panic goes to the
/// previously installed hook untouched.
pub(crate) fn install_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
            if GUARD_DEPTH.try_with(Cell::get).unwrap_or(0) == 0 {
                previous(info);
                return;
            }
            let _ = LAST_PANIC.try_with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = Some(Backtrace::force_capture());
                }
            });
        }));
    });
}

/// Run `f`, catching any panic it raises as a recoverable one.
pub(crate) fn guarded<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    GUARD_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    GUARD_DEPTH.with(|depth| depth.set(depth.get() - 1));
    result
}

/// Stack of the last panic raised on this thread, or the current stack when
/// the hook did not see it.
pub(crate) fn take_backtrace() -> String {
    LAST_PANIC
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(Backtrace::force_capture)
        .to_string()
}
