//! guestlite shared code
//!
//! Types used both by the host-side handle library (`guestlite`) and by
//! anything that speaks to it over the appliance socket, such as the fake
//! appliance in the test utilities.

pub mod constants;
pub mod errors;
pub mod protocol;

pub use errors::{GuestError, GuestResult};
pub use protocol::{Reply, Request};
