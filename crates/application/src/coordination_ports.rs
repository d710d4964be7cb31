mod durable;
mod keys;
mod store;

pub use durable::{PodRepository, RequestArchive};
pub use keys::{DEFAULT_KEY_NAMESPACE, KeyNamespace};
pub use store::{CoordinationStore, KeyTtl};
