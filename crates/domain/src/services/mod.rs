//! Credential, allocation, metering and conversion services plus telemetry
//! wiring.

pub mod allocator;
pub mod conversion;
pub mod credentials;
pub mod locks;
pub mod metering;
pub mod telemetry;
pub mod token;
pub mod two_factor;
mod users;

pub use allocator::*;
pub use conversion::*;
pub use credentials::*;
pub use locks::*;
pub use metering::*;
pub use telemetry::*;
pub use token::*;
pub use two_factor::TwoFactorSetup;

/// Upper bound on version-checked write attempts before giving up.
pub(crate) const MAX_WRITE_ATTEMPTS: usize = 8;
