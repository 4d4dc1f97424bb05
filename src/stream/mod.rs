//! Published stream
//!
//! The coordinator turns worker output into a strictly ordered published
//! sequence; the broadcaster fans the current frame out to every session
//! without copying.

pub mod broadcast;
pub mod coordinator;
pub mod dedup;
pub mod frame;
pub mod offline;

pub use broadcast::{Broadcaster, Subscriber};
pub use coordinator::{Coordinator, StreamConfig};
pub use dedup::DropSame;
pub use frame::EncodedFrame;
pub use offline::OfflinePlaceholder;
