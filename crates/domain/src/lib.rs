//! Domain layer of the any2json gateway: configuration, user and payment
//! models, the key-value storage contract and the services that enforce
//! uniqueness and metering on top of it.

pub mod config;
pub mod error;
pub mod model;
pub mod provider;
pub mod services;
pub mod storage;

pub use config::*;
pub use error::ServiceError;
pub use model::*;
pub use provider::*;
pub use services::*;
pub use storage::*;
