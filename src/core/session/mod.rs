// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod client_session;
pub mod expiry;
pub mod session_manager;

pub use client_session::{ClientSession, SessionState};
pub use expiry::{ExpiryReaper, ExpirySweep};
pub use session_manager::{CloseDisposition, SessionManager};
