#![forbid(unsafe_code)]

pub mod error;
pub mod settings;
pub mod shape;
pub mod summary;
