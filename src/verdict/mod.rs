//! Result classification
//!
//! Maps raw supervised outcomes onto status kinds as a pure function.

pub mod classifier;
