#![allow(dead_code)]

pub use cyclexec_test_utils::builders;
pub use cyclexec_test_utils::recorders;
pub use cyclexec_test_utils::{drain_pool, init_tracing, with_timeout};

use std::error::Error;

pub type TestResult = Result<(), Box<dyn Error>>;
