pub mod client_commands;
pub mod connection;
pub mod listeners;
pub mod map2;
pub mod negotiate;
pub mod replyinfo;
pub mod server_commands;

pub use connection::{ConnectionState, ServerConnection};
pub use listeners::EventFanout;
