#[allow(clippy::module_inception)]
pub mod channel;
pub mod events;
pub mod group;
pub mod state;

pub use channel::Channel;
pub use events::{ChannelListener, SendFailure};
pub use group::{ChannelGroup, GroupError};
pub use state::ChannelState;
