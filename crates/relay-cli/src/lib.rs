//! Relay CLI: command implementations shared by the `relay` binary and its
//! integration tests.

pub mod commands;
