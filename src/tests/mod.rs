//! Integration tests for the shard key -> list-of-values store.
//!
//! Scenario and lifecycle coverage lives in `cases_scenarios_test`;
//! thread-safety and lock-exclusivity properties live in
//! `cases_concurrent_test`.

mod cases_scenarios_test;
