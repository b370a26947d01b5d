pub mod app;
pub mod channel;
pub mod client;
pub mod editor;
pub mod error;
pub mod events;
pub mod handoff;
pub mod monitor;
pub mod notify;
pub mod patch;
pub mod permissions;
pub mod screen_share;
pub mod settings;
pub mod store;
pub mod templates;
pub mod types;
