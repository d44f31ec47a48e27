//! Integration flows, one file per protocol area.

pub mod command_event;
pub mod shutdown;
