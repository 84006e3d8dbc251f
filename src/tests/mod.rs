//! End-to-end tests over the sender pipeline.

#[cfg(test)]
mod scenario_tests;
