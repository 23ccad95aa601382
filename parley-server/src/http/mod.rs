//! Error bodies shared by the REST surface.

pub mod error;
pub mod problem;
