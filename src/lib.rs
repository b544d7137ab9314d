//! DCC chat and file transfers for the CrabChat IRC client.

pub mod config;
pub mod dcc;
pub mod logging;
