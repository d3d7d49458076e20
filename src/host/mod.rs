//! Host bridge: versioned JSON command/event contract over a running
//! scheduler, exposed as an in-process channel or over stdio.

pub mod channel;
pub mod contract;
pub mod stdio;
