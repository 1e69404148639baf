//! Historical draw storage.
//!
//! Loads a results file into a date-ordered, de-duplicated sequence of
//! [`Draw`](crate::types::Draw)s and answers the two queries the evaluator
//! needs: draws in a range, and everything strictly before a date.

mod results;

pub use results::{extract_numbers, is_administrative_key, ResultStore};
