//! Queues: identity, properties and the registry.

mod params;
mod registry;

pub use params::{
    DeliveryModel, QueueCounters, QueueParams, QueueProperties, QueueState, QueueType,
};
pub use registry::QueueRegistry;

pub(crate) use params::string_enum;
