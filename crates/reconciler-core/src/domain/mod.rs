//! Domain model (keys, outcomes).
//!
//! Queue や worker を前提にしない、値としての型だけを置く。

pub mod key;
pub mod outcome;

pub use key::Key;
pub use outcome::Outcome;
