//! Helpers for unit tests: throwaway stores, low-difficulty mining and
//! ready-made engines.

pub mod test_utils;

pub use test_utils::*;
