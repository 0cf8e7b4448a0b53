//! Transport layer.

pub mod tcp;
