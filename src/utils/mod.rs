//! Startup helpers shared by host applications.

pub mod bootstrap;
