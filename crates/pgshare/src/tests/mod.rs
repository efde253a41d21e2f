//! Test suites for the lifecycle coordinator.

mod command_seam;
mod support;
