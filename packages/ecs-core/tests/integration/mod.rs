//! Integration test suite: six end-to-end scenarios exercised against the
//! public `ecs-core` API rather than its internals.

pub mod end_to_end_tests;
