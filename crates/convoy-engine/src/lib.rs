pub mod channel;
pub mod router;
pub mod sessions;

pub use channel::{ChannelEvent, ChannelManager, CommandChannel, InboundDisposition};
pub use router::{Task, TaskRouter, TaskStatus, UpdateStream};
pub use sessions::{Session, SessionManager};
