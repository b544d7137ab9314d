//! IRC protocol layer: connection management, command parsing, and CTCP delivery
//! for the DCC engine.

pub mod commands;
pub mod connection;
pub mod manager;
