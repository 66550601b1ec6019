//! Status codes and attempt outcomes
//!
//! Public operations report a [`Status`]. Internally every structural operation
//! runs as a sequence of *attempts*; an attempt either succeeds, hits a transient
//! conflict (and is restarted from scratch), or fails with a terminal status.

use std::fmt;

/// Status code returned by table and heap store operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// Key (or tuple) was not found
    NotFound = 1,
    /// The store is not growable and has no room left
    NotEnoughSpace = 2,
    /// Invalid argument or violated precondition
    InvalidArgument = 3,
    /// Any other failure, including operations that are not supported
    Other = 4,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the key was not found
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Status::NotEnoughSpace | Status::InvalidArgument | Status::Other
        )
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::NotFound => "NotFound",
            Status::NotEnoughSpace => "NotEnoughSpace",
            Status::InvalidArgument => "InvalidArgument",
            Status::Other => "Other",
        }
    }

    /// Convert to a `Result`, mapping `Ok` to `Ok(())`
    #[inline]
    pub fn into_result(self) -> Result<(), Status> {
        match self {
            Status::Ok => Ok(()),
            other => Err(other),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why an attempt did not complete
///
/// `Conflict` is never user visible: the retry loop consumes it and starts the
/// operation over. `Fatal` carries the status handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restart {
    /// A concurrent change was detected (lost CAS, stale split state, page
    /// latched exclusively, page no longer resident)
    Conflict,
    /// The attempt cannot succeed by retrying
    Fatal(Status),
}

impl Restart {
    /// Check if the attempt should simply be retried
    #[inline]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Restart::Conflict)
    }
}

impl From<Status> for Restart {
    #[inline]
    fn from(status: Status) -> Self {
        Restart::Fatal(status)
    }
}

/// Outcome of a single attempt: `Ok` is the only commit path
pub type AttemptResult<T> = Result<T, Restart>;
