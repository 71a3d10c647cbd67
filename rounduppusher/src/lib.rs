pub mod client;
pub mod error;
pub mod push;
pub mod xmlrpc;

pub use crate::client::{Property, RoundupTracker, XmlRpcTracker};
pub use crate::error::{Result, RoundupError};
pub use crate::push::{push_all, read_members, Member, RoundupReport};
