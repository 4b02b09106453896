mod group;
mod shard;

pub use group::DeviceGroup;
