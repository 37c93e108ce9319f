//! rootpull CLI - command definitions for the `rootpull` binary.

pub mod commands;
