//! Stages shipped with meridian

pub mod accel;
pub mod fdelay;
pub mod log;
pub mod spool;

pub use accel::AccelCommand;
pub use fdelay::FileDelay;
pub use log::MessageLog;
pub use spool::SpoolPoster;

use super::registry::StageDescriptor;

/// Descriptors of every built-in stage
pub fn descriptors() -> Vec<StageDescriptor> {
    vec![
        fdelay::descriptor(),
        log::descriptor(),
        spool::descriptor(),
        accel::descriptor(),
    ]
}
