// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod duration;
pub mod health;
pub mod logging;
pub mod serialization;
pub mod shutdown;

pub use logging::{init_logging, init_test_logging};
pub use serialization::{from_bytes, to_bytes};
