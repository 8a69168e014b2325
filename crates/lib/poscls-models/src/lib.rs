#![forbid(unsafe_code)]

pub mod batch;
pub mod blocks;
pub mod classifier;
pub mod configuration;
pub mod res_net_4;
pub mod train;
pub mod vgg4;
