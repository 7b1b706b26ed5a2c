//! PiiVault: PII object store and tokenization vault server.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use piivault_core::VaultConfig;
use piivault_runtime::Vault;
use piivault_server::{admin, build_router, AppState};

fn resolve_data_dir() -> PathBuf {
    std::env::var("PIIVAULT_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}

fn data_dir_arg(args: &[String]) -> PathBuf {
    args.get(2)
        .map(PathBuf::from)
        .unwrap_or_else(resolve_data_dir)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--validate" | "validate" => {
                let report = admin::validate(&data_dir_arg(&args));
                admin::print_report("Validation", &report);
                std::process::exit(if report.is_ok() { 0 } else { 1 });
            }
            "--check-clear" | "check-clear" => {
                let report = admin::check_clear(&data_dir_arg(&args));
                admin::print_report("Check Clear", &report);
                std::process::exit(if report.is_ok() { 0 } else { 1 });
            }
            "--help" | "-h" | "help" => {
                println!("PiiVault: PII object store and tokenization vault");
                println!();
                println!("Usage: piivault [command]");
                println!();
                println!("Commands:");
                println!("  (none)                   Start the server");
                println!("  validate [data-dir]      Validate the database and policy file");
                println!("  check-clear [data-dir]   Fail unless the vault holds no collections");
                println!("  help                     Show this help message");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'piivault help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let config = VaultConfig::from_env(&data_dir)?;
    let port = config.port;

    let vault = Vault::open(config).map_err(|e| anyhow::anyhow!("Failed to open vault: {}", e))?;
    let state = Arc::new(AppState::new(vault));
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("PiiVault server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
