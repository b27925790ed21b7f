// 模块结构：
// `application`: 配置加载、服务组装与监听器启动。
// `handlers`: 各 HTTP 端点的处理函数与错误映射。
// `state`: 所有 worker 共享的服务句柄。
mod application;
mod handlers;
mod state;


use std::process::ExitCode;

// `#[actix_web::main]` 在 actix 系统运行时中执行异步入口。
#[actix_web::main]
async fn main() -> ExitCode {
    match application::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // 启动失败时 tracing 可能尚未初始化，直接写到标准错误。
            eprintln!("[any2json-api] bootstrap failed: {err}");
            ExitCode::FAILURE
        }
    }
}
