// Risk management module
pub mod limits;

pub use limits::{PositionLimits, Rejection};
