#![forbid(unsafe_code)]

pub mod diagram;
pub mod error;
pub mod logger;
