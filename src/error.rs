// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Result of an asynchronous operation.
pub type AsyncResult<T> = Result<T, AsyncError>;

/// Classification of an [`AsyncError`].
///
/// The set is closed: everything an operation in this crate can report maps
/// onto one of these codes, OS-level detail travels in
/// [`AsyncError::native`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum AsyncErrorCode {
    /// Not an error. Only ever observed when lifting foreign status values
    /// (e.g. a socket layer's "ok" result) into this representation.
    Ok = 0,
    /// The operation was abandoned because its cancellation token fired.
    Canceled,
    /// A deadline elapsed before the operation finished.
    TimedOut,
    /// The operation was attempted against an object in the wrong state,
    /// e.g. scheduling a task whose executor is gone or taking a result
    /// twice.
    InvalidState,
    /// A caller-supplied argument was rejected.
    InvalidArgument,
    /// The task body panicked.
    Fault,
}

/// Structured, value-returned error of the asynchronous core.
///
/// Task bodies report failures by returning this by value; panics are
/// converted into [`AsyncErrorCode::Fault`] at the promise boundary. The
/// executor itself never surfaces `AsyncError`s, its operations are total.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AsyncError {
    /// What went wrong.
    pub code: AsyncErrorCode,
    /// OS error number for failures that originate in a syscall, `0`
    /// otherwise.
    pub native: i32,
}

// === impl AsyncError ===

impl AsyncError {
    #[must_use]
    pub const fn new(code: AsyncErrorCode) -> Self {
        Self { code, native: 0 }
    }

    #[must_use]
    pub const fn with_native(code: AsyncErrorCode, native: i32) -> Self {
        Self { code, native }
    }

    pub const fn canceled() -> Self {
        Self::new(AsyncErrorCode::Canceled)
    }

    pub const fn timed_out() -> Self {
        Self::new(AsyncErrorCode::TimedOut)
    }

    pub const fn invalid_state() -> Self {
        Self::new(AsyncErrorCode::InvalidState)
    }

    pub const fn fault() -> Self {
        Self::new(AsyncErrorCode::Fault)
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.code, AsyncErrorCode::Ok)
    }

    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self.code, AsyncErrorCode::Canceled)
    }
}

impl fmt::Display for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.code {
            AsyncErrorCode::Ok => "ok",
            AsyncErrorCode::Canceled => "operation was canceled",
            AsyncErrorCode::TimedOut => "operation timed out",
            AsyncErrorCode::InvalidState => "object was in an invalid state",
            AsyncErrorCode::InvalidArgument => "invalid argument",
            AsyncErrorCode::Fault => "task body panicked",
        };

        if self.native != 0 {
            write!(f, "{what} (os error {})", self.native)
        } else {
            f.write_str(what)
        }
    }
}

impl core::error::Error for AsyncError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_native_code() {
        let err = AsyncError::with_native(AsyncErrorCode::Fault, 11);
        assert_eq!(err.to_string(), "task body panicked (os error 11)");
        assert_eq!(AsyncError::canceled().to_string(), "operation was canceled");
    }

    #[test]
    fn discriminators() {
        assert!(AsyncError::canceled().is_canceled());
        assert!(!AsyncError::timed_out().is_canceled());
        assert!(AsyncError::new(AsyncErrorCode::Ok).is_ok());
    }
}
