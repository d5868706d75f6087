pub mod config;
pub mod registry;
pub mod reply;
pub mod request;
pub mod selector;
pub mod session;
pub mod translate;
pub mod virt_to_phys;
