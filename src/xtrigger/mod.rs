// src/xtrigger/mod.rs

pub mod manager;
pub mod spec;

pub use manager::{XtriggerManager, XtriggerResult};
pub use spec::XtriggerSpec;
