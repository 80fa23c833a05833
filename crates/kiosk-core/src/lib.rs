//! Core domain types for the voice ordering kiosk.
//!
//! Nothing in this crate touches audio devices or the network: it holds the
//! menu, the cart, the transcript, session settings and the observer
//! contract that `kiosk-voice` reports through.

#![deny(unused_crate_dependencies)]

pub mod events;
pub mod logging;
pub mod menu;
pub mod order;
pub mod settings;
pub mod transcript;

// Re-export commonly used types for convenience
pub use events::{ConnectionStatus, NoopObserver, SessionObserver};
pub use menu::{Menu, MenuError, MenuItem};
pub use order::{Bill, Cart, OrderDesk, OrderLine};
pub use settings::{
    KioskSettings, SettingsError, api_key_from_env, api_key_from_lookup, validate_settings,
};
pub use transcript::{Role, SharedTranscript, Transcript, Utterance};
