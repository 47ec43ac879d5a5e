//! Isolation of user callbacks: an `Err` or a panic becomes a [`CallbackError`].

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

#[derive(thiserror::Error, Debug, Clone)]
pub enum CallbackError {
    #[error("{callback} failed: {message}")]
    Failed { callback: String, message: String },
    #[error("{callback} panicked: {message}")]
    Panicked { callback: String, message: String },
}

impl CallbackError {
    pub fn message(&self) -> &str {
        match self {
            CallbackError::Failed { message, .. } | CallbackError::Panicked { message, .. } => {
                message
            }
        }
    }
}

/// Runs `f`, converting both error returns and panics.
pub(crate) fn invoke<T>(
    callback: &str,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, CallbackError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(CallbackError::Failed {
            callback: callback.to_owned(),
            message: format!("{err:#}"),
        }),
        Err(payload) => Err(CallbackError::Panicked {
            callback: callback.to_owned(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

/// Runs an infallible callback, converting panics.
pub(crate) fn invoke_unit(callback: &str, f: impl FnOnce()) -> Result<(), CallbackError> {
    invoke(callback, || {
        f();
        Ok(())
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
