//! Key indexing module
//!
//! Provides the bidirectional key index used to address nodes by name.

pub mod key_index;

pub use key_index::KeyIndex;
