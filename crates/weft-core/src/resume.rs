//! Resume values.
//!
//! The value staged for a fiber on the runqueue and delivered when the
//! dispatcher resumes it. An `Err` resume is re-raised at the suspension
//! point; everything else is returned to the suspended code.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Plain wakeup with no payload.
    Unit,

    /// Numeric payload: op result, file descriptor, tick flag.
    Value(i64),

    /// Exception injected into the fiber.
    Err(Error),
}

impl Resume {
    /// Split off the error case: the Rust rendition of "a resume value
    /// that is an exception is re-raised in the resumed fiber".
    #[inline]
    pub fn into_result(self) -> Result<Resume> {
        match self {
            Resume::Err(e) => Err(e),
            other => Ok(other),
        }
    }

    #[inline]
    pub fn is_err(&self) -> bool {
        matches!(self, Resume::Err(_))
    }

    #[inline]
    pub fn value(&self) -> Option<i64> {
        match self {
            Resume::Value(v) => Some(*v),
            _ => None,
        }
    }
}

impl Default for Resume {
    fn default() -> Self {
        Resume::Unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_result() {
        assert_eq!(Resume::Unit.into_result(), Ok(Resume::Unit));
        assert_eq!(Resume::Value(7).into_result(), Ok(Resume::Value(7)));
        assert_eq!(
            Resume::Err(Error::Timeout).into_result(),
            Err(Error::Timeout)
        );
    }
}
