pub mod checkpoint_store;
pub mod instance_store;

pub use checkpoint_store::CheckpointStore;
pub use instance_store::InstanceStore;
