use std::sync::Arc;

use any2json_domain::config::{BillingConfig, ProviderConfig};
use any2json_domain::provider::ExtractionProvider;
use any2json_domain::services::{
    AddressAllocator, ConversionService, CredentialService, KeyedLocks, MeteringService,
    TelemetryGuard, TokenSigner,
};
use any2json_storage::SeaOrmStorage;

#[derive(Clone)]
pub struct AppState {
    credentials: CredentialService<SeaOrmStorage>,
    allocator: AddressAllocator<SeaOrmStorage>,
    conversion: ConversionService<SeaOrmStorage>,
    telemetry: TelemetryGuard,
}

impl AppState {
    pub fn new(
        storage: SeaOrmStorage,
        signer: TokenSigner,
        billing: BillingConfig,
        provider: Arc<dyn ExtractionProvider>,
        provider_config: &ProviderConfig,
        telemetry: TelemetryGuard,
    ) -> Self {
        // One lock table per process, shared by every service.
        let locks = KeyedLocks::default();
        let metering = MeteringService::new(storage.clone(), locks.clone(), billing);
        let conversion = ConversionService::new(
            provider,
            metering,
            provider_config.model(),
            provider_config.timeout(),
        );

        Self {
            credentials: CredentialService::new(storage.clone(), signer, locks.clone()),
            allocator: AddressAllocator::new(storage, locks),
            conversion,
            telemetry,
        }
    }

    /// Lowers the password hashing cost; only meant for tests.
    #[cfg(test)]
    pub fn with_password_rounds(mut self, rounds: u32) -> Self {
        self.credentials = self.credentials.with_password_rounds(rounds);
        self
    }

    pub fn credentials(&self) -> &CredentialService<SeaOrmStorage> {
        &self.credentials
    }

    pub fn allocator(&self) -> &AddressAllocator<SeaOrmStorage> {
        &self.allocator
    }

    pub fn conversion(&self) -> &ConversionService<SeaOrmStorage> {
        &self.conversion
    }

    pub fn telemetry(&self) -> &TelemetryGuard {
        &self.telemetry
    }
}
