//! The master-side change manager: receives slave commits over the session's
//!  command channel, reassembles them into per-commit input streams, queues
//!  completed commits in order and applies them to the owning object.

pub mod command;
pub mod input_stream;
pub mod master;
pub mod object;
