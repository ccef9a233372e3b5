//! Reducer tests.
//!
//! - Scenarios: fork, navigation, deletion and pagination flows step by step
//! - Property tests: randomized operation sequences checked against the path invariant

mod support;
