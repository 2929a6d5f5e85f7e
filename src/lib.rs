#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]

pub mod error;
pub mod log;
pub mod util;
pub mod settings;
pub mod types;
pub mod memory;
pub mod expr;
pub mod interp;
pub mod registry;
pub mod annotation;
pub mod dispatch;
pub mod pretty;
pub mod stringize;
pub mod viz;
pub mod edit;
pub mod executor;
pub mod watch;
pub mod context;
pub mod demo;

#[cfg(test)]
pub mod testing;
