// 引入标准库：
// `Path`: 文件路径处理。
// `Arc`: 原子引用计数，用于共享 provider。
use std::{path::Path, sync::Arc};

// 仅在 Unix 系统下引入文件系统模块，用于处理 Unix Domain Socket 文件。
#[cfg(unix)]
use std::fs;

use actix_web::{
    http::Method,
    middleware::{DefaultHeaders, Logger},
    web, App, HttpServer,
};

// 引入领域层配置和服务。
use any2json_domain::config::{ApiConfig, ConfigError};
use any2json_domain::provider::ProviderError;
use any2json_domain::services::{
    init_telemetry, TelemetryConfig, TelemetryError, TokenError, TokenSigner,
};
// 引入 HTTP provider 与存储层实现。
use any2json_provider::HttpExtractionProvider;
use any2json_storage::SeaOrmStorage;
use thiserror::Error;
use tracing::info;

use crate::{
    handlers::{
        balance_handler, convert_handler, get_address_handler, health_handler,
        json_error_handler, login_handler, metrics_handler, not_found_handler,
        pool_status_handler, preflight_handler, provision_pool_handler, regenerate_key_handler,
        register_handler, setup_two_factor_handler, verify_two_factor_handler,
    },
    state::AppState,
};

// 应用程序启动入口函数。
pub async fn run() -> Result<(), BootstrapError> {
    // 1. 加载配置
    let config = ApiConfig::load_from_env()?;

    // 2. 初始化遥测 (Telemetry)
    let telemetry_config = TelemetryConfig::from_env("API");
    let telemetry = init_telemetry(&telemetry_config)?;

    // 3. 连接数据库
    let storage = SeaOrmStorage::connect(config.database_url()).await?;

    // 4. 令牌签名器与 provider 客户端
    let signer = TokenSigner::from_config(config.auth())?;
    let provider = HttpExtractionProvider::from_config(config.provider())?;

    // 5. 构建应用状态
    let state = AppState::new(
        storage,
        signer,
        *config.billing(),
        Arc::new(provider),
        config.provider(),
        telemetry,
    );

    // 配置了内部监听器时，指标只在内部接口暴露。
    let include_metrics_on_public = !config.has_internal_listener();
    let public_state = state.clone();

    // 6. 公共 HTTP 服务器
    let mut public_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(public_state.clone()))
            .wrap(cors_headers())
            .wrap(Logger::default())
            .configure(|cfg| public_routes(cfg, include_metrics_on_public))
            .default_service(web::to(not_found_handler))
    });

    #[cfg(unix)]
    {
        if let Some(socket) = config.api_unix_socket() {
            // 先清理上次遗留的 socket 文件。
            cleanup_socket(socket)?;
            public_server = public_server.bind_uds(socket)?;
        } else {
            public_server = public_server.bind(config.api_bind_address())?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(socket) = config.api_unix_socket() {
            return Err(BootstrapError::Io(std::io::Error::other(format!(
                "unix socket '{socket}' requested but this platform does not support it"
            ))));
        }
        public_server = public_server.bind(config.api_bind_address())?;
    }

    info!(
        bind = config.api_unix_socket().unwrap_or(config.api_bind_address()),
        "public listener ready"
    );
    let public_server = public_server.run();

    // 7. 内部 HTTP 服务器（可选）：指标与地址池管理，不向公网暴露。
    let internal_server = if config.has_internal_listener() {
        let internal_state = state.clone();
        let mut internal_server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(internal_state.clone()))
                .wrap(Logger::default())
                .configure(internal_routes)
                .default_service(web::to(not_found_handler))
        });

        #[cfg(unix)]
        {
            if let Some(socket) = config.internal_unix_socket() {
                cleanup_socket(socket)?;
                internal_server = internal_server.bind_uds(socket)?;
            } else if let Some(addr) = config.internal_bind_address() {
                internal_server = internal_server.bind(addr)?;
            } else {
                return Err(BootstrapError::Io(std::io::Error::other(
                    "internal listener configured but no bind target provided",
                )));
            }
        }

        #[cfg(not(unix))]
        {
            if let Some(socket) = config.internal_unix_socket() {
                return Err(BootstrapError::Io(std::io::Error::other(format!(
                    "internal unix socket '{socket}' requested but this platform does not support it"
                ))));
            }
            if let Some(addr) = config.internal_bind_address() {
                internal_server = internal_server.bind(addr)?;
            } else {
                return Err(BootstrapError::Io(std::io::Error::other(
                    "internal listener configured but no bind target provided",
                )));
            }
        }

        Some(internal_server.run())
    } else {
        None
    };

    // 8. 并发运行服务器
    if let Some(internal) = internal_server {
        tokio::try_join!(public_server, internal)?;
    } else {
        public_server.await?;
    }

    Ok(())
}

/// Routes served on the public listener.
pub fn public_routes(cfg: &mut web::ServiceConfig, include_metrics: bool) {
    cfg.app_data(json_config())
        .route("/health", web::get().to(health_handler))
        .route("/api/auth/register", web::post().to(register_handler))
        .route("/api/auth/login", web::post().to(login_handler))
        .route("/api/account/balance", web::get().to(balance_handler))
        .route(
            "/api/account/regenerate-key",
            web::post().to(regenerate_key_handler),
        )
        .route(
            "/api/account/2fa/setup",
            web::post().to(setup_two_factor_handler),
        )
        .route(
            "/api/account/2fa/verify",
            web::post().to(verify_two_factor_handler),
        )
        .route(
            "/api/payments/get-address",
            web::post().to(get_address_handler),
        )
        .route("/api/convert", web::post().to(convert_handler));

    if include_metrics {
        cfg.route("/metrics", web::get().to(metrics_handler));
    }

    // 所有路径的 CORS 预检请求。
    cfg.route(
        "/{tail:.*}",
        web::method(Method::OPTIONS).to(preflight_handler),
    );
}

/// Routes served on the internal listener.
pub fn internal_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .route("/metrics", web::get().to(metrics_handler))
        .route(
            "/api/v1/pools/{network}",
            web::post().to(provision_pool_handler),
        )
        .route("/api/v1/pools/{network}", web::get().to(pool_status_handler));
}

/// Permissive CORS headers added to every public response.
pub fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add(("Access-Control-Allow-Origin", "*"))
        .add(("Access-Control-Allow-Methods", "GET, POST, OPTIONS"))
        .add(("Access-Control-Allow-Headers", "Content-Type, Authorization"))
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(json_error_handler)
}

// 定义启动过程中的错误枚举。
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("storage error: {0}")]
    Storage(#[from] any2json_domain::storage::StorageError),
    #[error("token signer error: {0}")]
    Token(#[from] TokenError),
    #[error("provider client error: {0}")]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// 辅助函数：清理 Unix Socket 文件。
#[cfg(unix)]
fn cleanup_socket(path: &str) -> std::io::Result<()> {
    let socket_path = Path::new(path);
    if socket_path.exists() {
        fs::remove_file(socket_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #[cfg(unix)]
    #[actix_web::test]
    async fn cleanup_socket_removes_stale_file() {
        use super::cleanup_socket;

        let path = std::env::temp_dir().join(format!(
            "any2json-test-{}-{}.sock",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::write(&path, b"stub").expect("write socket file");
        cleanup_socket(path.to_str().unwrap()).expect("cleanup succeeds");
        assert!(!path.exists());

        // 不存在的路径也应成功。
        cleanup_socket(path.to_str().unwrap()).expect("missing file is fine");
    }
}
