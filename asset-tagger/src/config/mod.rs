//! Configuration.
//!
//! Runtime settings live in the `settings` table and are read through
//! [`SettingsService`]; process configuration comes from the environment.

pub mod cache;
pub mod env;
pub mod events;
pub mod service;
pub mod settings;

pub use cache::SettingsCache;
pub use env::{ProcessConfig, QueueBackendKind};
pub use events::{SettingsChangeEvent, SettingsEventBroadcaster};
pub use service::SettingsService;
pub use settings::{MissingFilePolicy, NsfwPolicy, TaggingSettings, keys};
