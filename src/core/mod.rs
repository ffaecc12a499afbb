pub mod events;
pub mod fetch;
pub mod filename;
pub mod manager;
pub mod progress;
pub mod registry;
pub mod stream;
pub mod validate;
