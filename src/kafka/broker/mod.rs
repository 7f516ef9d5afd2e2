mod memory;
mod services;

pub use memory::{MemoryBroker, MemoryGroup};
pub use services::{
    AssignmentEvent, BrokerServices, CommitService, FetchService, GroupMembership, MetadataService,
};
