#![allow(clippy::missing_errors_doc)]

use thiserror::Error;
use x11rb::{
    errors::{ConnectionError, ReplyError, ReplyOrIdError},
    x11_utils::X11Error,
};

pub use crate::{
    atoms::{ProtocolAtoms, ProtocolAtomsCookie},
    manager::{ClipboardManager, SaveRequest, SaveState, is_manager_running},
    target::TargetBuffer,
    transfer::TransferState,
    transport::{Host, PropertyValue, Transport},
};

mod atoms;
#[cfg(test)]
mod fake;
mod manager;
mod target;
mod transfer;
mod transport;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("X11 request failed")]
    Connection(#[from] ConnectionError),
    #[error("X11 reply failed")]
    X11(X11Error),
    #[error("failed to create X11 ID")]
    IdsExhausted,
    #[error("another client owns the CLIPBOARD_MANAGER selection")]
    ManagerRunning,
}

impl Error {
    /// Whether the error is a protocol error that an error trap swallows, as
    /// opposed to a broken connection.
    #[must_use]
    pub const fn is_trappable(&self) -> bool {
        matches!(self, Self::X11(_))
    }
}

impl From<X11Error> for Error {
    fn from(value: X11Error) -> Self {
        Self::X11(value)
    }
}

impl From<ReplyError> for Error {
    fn from(value: ReplyError) -> Self {
        match value {
            ReplyError::ConnectionError(e) => e.into(),
            ReplyError::X11Error(e) => e.into(),
        }
    }
}

impl From<ReplyOrIdError> for Error {
    fn from(value: ReplyOrIdError) -> Self {
        match value {
            ReplyOrIdError::IdsExhausted => Self::IdsExhausted,
            ReplyOrIdError::ConnectionError(e) => e.into(),
            ReplyOrIdError::X11Error(e) => e.into(),
        }
    }
}

#[cfg(feature = "error-stack")]
mod error_stack_compat {
    use error_stack::Report;

    use crate::Error;

    impl Error {
        pub fn into_report<W: core::error::Error + Send + Sync + 'static>(
            self,
            wrapper: W,
        ) -> Report<W> {
            match self {
                Self::Connection(e) => Report::new(e).change_context(wrapper),
                Self::X11(e) => Report::new(wrapper).attach_printable(format!("{e:?}")),
                Self::IdsExhausted => Report::new(wrapper),
                Self::ManagerRunning => Report::new(wrapper)
                    .attach_printable("Only one clipboard manager may run per display."),
            }
        }
    }
}
