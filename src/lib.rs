pub mod backoff;
pub mod broker;
pub mod config;
pub mod constants;
pub mod correlation;
pub mod error;
pub mod net;
pub mod pidfile;
pub mod registry;
