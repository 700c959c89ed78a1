//! Domain model module declarations.

pub mod checkpoint;
pub mod phase;
pub mod review;
pub mod session;
pub mod task;
