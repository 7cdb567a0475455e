//! Types shared between the plotter service and its clients.

pub mod domain;
pub mod error;
pub mod protocol;
