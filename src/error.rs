//! Error type shared by the catalog, the session and the transaction builder.

use std::collections::TryReserveError;
use std::io;

use thiserror::Error;

use crate::driver::ObjectKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no {kind} with id {id}")]
    ObjectNotFound { kind: ObjectKind, id: u32 },
    #[error("{kind} {object} has no property named {name:?}")]
    PropertyNotFound {
        kind: ObjectKind,
        object: u32,
        name: String,
    },
    #[error("no {kind} is selected")]
    NothingSelected { kind: ObjectKind },
    #[error("out of memory")]
    OutOfMemory(#[from] TryReserveError),
    #[error("error {step}")]
    Driver {
        step: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("invalid mode: {0}")]
    InvalidMode(String),
}

impl Error {
    pub(crate) fn driver(step: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Driver { step, source }
    }

    /// Whether this is a lookup miss (unknown object id, unknown property name or nothing
    /// selected yet). These are never retried internally.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ObjectNotFound { .. } | Self::PropertyNotFound { .. } | Self::NothingSelected { .. }
        )
    }
}
