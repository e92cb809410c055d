//! CPU implementations of the backend op traits.

pub mod indexed_copy;
pub mod layout;
pub mod penalty;
