//! Heap error types.
//!
//! The display strings are stable: the VM surfaces them verbatim as
//! runtime error messages.

use thiserror::Error;
use velac_util::Ptr;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    #[error("Out of memory")]
    OutOfMemory,

    #[error("Dangling pointer at {0}")]
    DanglingPointer(Ptr),

    #[error("Wrong reference count for pointer at {0}")]
    WrongRefCount(Ptr),

    #[error("Cannot allocate a block of {0} bytes")]
    IllegalSize(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_verbatim() {
        assert_eq!(HeapError::OutOfMemory.to_string(), "Out of memory");
        let ptr = Ptr::heap(1, 64);
        assert_eq!(
            HeapError::DanglingPointer(ptr).to_string(),
            format!("Dangling pointer at {ptr}")
        );
        assert_eq!(
            HeapError::WrongRefCount(ptr).to_string(),
            format!("Wrong reference count for pointer at {ptr}")
        );
    }
}
