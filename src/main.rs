mod backend;
mod cache;
mod catalog;
mod cli;
mod config;
mod error;
mod options_store;
mod router;
mod scheduler;
mod state;
mod supervisor;
mod translate;
mod wrapped;

use clap::Parser;
use cli::{Cli, Command};
use config::Config;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.cmd {
        Command::Version => {
            println!("lemonade-server-core {}", env!("LEMONADE_BUILD_VERSION"));
            ExitCode::SUCCESS
        }
        Command::Serve { host, port, no_tray: _ } => {
            init_tracing(&config.log_level);
            let mut config = config;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            match supervisor::run(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("server exited with error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Status => run_client(&config, |base, client| async move {
            let resp = client.get(format!("{base}/live")).send().await?;
            if resp.status().is_success() {
                println!("server reachable at {base}");
                Ok(())
            } else {
                anyhow::bail!("server responded with {}", resp.status())
            }
        })
        .await,
        Command::Stop => run_client(&config, |base, client| async move {
            client
                .post(format!("{base}/api/v1/unload"))
                .json(&serde_json::json!({}))
                .send()
                .await?;
            println!("unload requested");
            Ok(())
        })
        .await,
        Command::Pull { name } => run_client(&config, move |base, client| async move {
            let resp = client
                .post(format!("{base}/api/v1/pull"))
                .json(&serde_json::json!({"model_name": name}))
                .send()
                .await?;
            println!("{}", resp.text().await?);
            Ok(())
        })
        .await,
        Command::List => run_client(&config, |base, client| async move {
            let resp = client.get(format!("{base}/api/v1/models")).send().await?;
            println!("{}", resp.text().await?);
            Ok(())
        })
        .await,
        Command::Delete { name } => run_client(&config, move |base, client| async move {
            let resp = client
                .post(format!("{base}/api/v1/delete"))
                .json(&serde_json::json!({"model_name": name}))
                .send()
                .await?;
            println!("{}", resp.text().await?);
            Ok(())
        })
        .await,
        Command::Run { name } => run_client(&config, move |base, client| async move {
            let resp = client
                .post(format!("{base}/api/v1/chat/completions"))
                .json(&serde_json::json!({
                    "model": name,
                    "messages": [{"role": "user", "content": "Say hello in five words or fewer."}],
                    "stream": false,
                    "max_tokens": 32,
                }))
                .send()
                .await?;
            println!("{}", resp.text().await?);
            Ok(())
        })
        .await,
        Command::Recipes => {
            for recipe in ["llamacpp", "flm", "ryzenai-llm", "whispercpp", "sd-cpp", "kokoro"] {
                println!("{recipe}");
            }
            ExitCode::SUCCESS
        }
    }
}

/// CLI subcommands other than `serve` are a thin HTTP client against an already-running
/// server.
async fn run_client<F, Fut>(config: &Config, f: F) -> ExitCode
where
    F: FnOnce(String, reqwest::Client) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let base = format!("http://{}:{}", config.host, config.port);
    let client = reqwest::Client::new();
    match f(base, client).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
