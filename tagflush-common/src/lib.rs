//! Common functionality for the tagflush backends.
#![warn(missing_docs)]

mod time;

pub use crate::time::*;
