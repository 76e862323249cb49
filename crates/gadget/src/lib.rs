//! Virtual side of usb-relay
//!
//! Impersonates the relayed device toward a foreign host. The OS-specific gadget
//! function is supplied by the embedder as a [`GadgetBackend`]; the
//! [`VirtualAdapter`] turns its host transfers into messages for the physical
//! side and replays the physical side's answers.

pub mod adapter;
pub mod backend;
pub mod config;
pub mod service;

pub use adapter::VirtualAdapter;
pub use backend::{GadgetBackend, SetupHandler};
pub use config::GadgetConfig;
pub use service::GadgetService;
