//! End-to-end tests for the training pipeline
//!
//! Unit tests live next to the code they cover; the tests here drive
//! checkpointing, the solver and full runs over a small on-disk corpus.

pub(super) mod fixtures;
mod integration_tests;
