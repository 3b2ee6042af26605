// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordered delivery of queued events to listeners.

pub mod dispatcher;
pub mod worker;

pub use dispatcher::{DeliveryDispatcher, DispatchReport};
pub use worker::DeliveryWorker;
