#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod engine;
pub mod progress;
pub mod source;
pub mod staging;
pub mod types;
