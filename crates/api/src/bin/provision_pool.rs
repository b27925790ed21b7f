use std::env;
use std::fs;
use std::process;

use any2json_domain::config::StoreConfig;
use any2json_domain::services::{AddressAllocator, KeyedLocks};
use any2json_storage::SeaOrmStorage;

#[tokio::main]
async fn main() {
    let mut args = env::args().skip(1);
    let (Some(network), Some(path)) = (args.next(), args.next()) else {
        eprintln!("Usage: provision_pool <network> <address_file>");
        process::exit(1);
    };

    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            eprintln!("failed to read {path}: {err}");
            process::exit(1);
        }
    };
    // 每行一个地址，空行与 `#` 注释行忽略。
    let addresses: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();

    let config = match StoreConfig::load_from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            process::exit(1);
        }
    };

    let storage = match SeaOrmStorage::connect(config.database_url()).await {
        Ok(storage) => storage,
        Err(err) => {
            eprintln!("failed to connect storage: {err}");
            process::exit(1);
        }
    };

    let allocator = AddressAllocator::new(storage, KeyedLocks::default());
    let outcome = match allocator.provision_pool(&network, &addresses).await {
        Ok(outcome) => outcome,
        Err(err) => {
            eprintln!("failed to provision pool: {err}");
            process::exit(1);
        }
    };

    println!("Network: {} ({})", outcome.network.as_ref(), outcome.network.display_name());
    println!("Added: {}", outcome.added);
    println!("Skipped: {}", outcome.skipped);
    println!("Remaining: {}", outcome.remaining);
}
