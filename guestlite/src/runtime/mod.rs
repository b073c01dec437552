pub mod bootstrap;
pub mod constants;
pub mod environment;
pub mod error_handler;
pub mod events;
pub mod options;
pub mod registry;
pub mod types;

mod accessors;
mod core;
mod lifecycle;

pub use self::core::Handle;
