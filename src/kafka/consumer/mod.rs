mod client;
mod commit;
mod cursor;
mod events;
mod handler;
mod resolver;
mod runner;
mod seek;

pub use client::Consumer;
pub use commit::CommitScheduler;
pub use cursor::{PartitionCursor, Position};
pub use events::ConsumerEvent;
pub use handler::MessageHandler;
pub use resolver::OffsetResolver;
pub use seek::{SeekRegistry, SeekRequest};
