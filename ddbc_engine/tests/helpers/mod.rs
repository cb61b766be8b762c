#![allow(dead_code)]

pub mod env;
pub mod mock;

#[allow(unused_imports)]
pub use env::{get_test_driver, get_test_dsn, init_test_logging};
#[allow(unused_imports)]
pub use mock::{mock_client, mock_context, pooled_client};
