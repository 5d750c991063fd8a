#![forbid(unsafe_code)]

pub mod epub;
pub mod error;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod source;
pub mod store;
