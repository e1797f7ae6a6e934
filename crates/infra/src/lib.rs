//! Infrastructure layer: configuration, catalog storage, outbound mail.

pub mod config;
pub mod mailer;
pub mod store;
