pub mod config;
pub mod ctms;
pub mod data;
pub mod utils;
