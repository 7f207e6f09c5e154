//! Studio host — supervises the local Studio server and routes messages
//! between the sidebar and studio surfaces.

mod error;
mod message;
mod session;

pub use error::*;
pub use message::*;
pub use session::*;

pub mod config;
pub mod logs;
pub mod observer;
pub mod router;
pub mod supervisor;
