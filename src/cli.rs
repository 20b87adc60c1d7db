//! CLI surface: a thin wrapper around the HTTP API, using `clap`'s `Parser`/`Subcommand`
//! derive shape.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "lemonade-server",
    version,
    about = "Lemonade Server: OpenAI-compatible gateway over wrapped inference engines"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the build version
    Version,
    /// Check whether a server is reachable
    Status,
    /// Run the HTTP server
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// No-op: kept for CLI compatibility with the desktop distribution
        #[arg(long)]
        no_tray: bool,
    },
    /// Ask a running server to shut down
    Stop,
    /// Download a model's files into the cache
    Pull { name: String },
    /// List catalog entries
    List,
    /// Remove a model's cached files
    Delete { name: String },
    /// Interactive smoke-test loop against a loaded model
    Run { name: String },
    /// List known recipes (engine families)
    Recipes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_to_no_overrides() {
        let cli = Cli::try_parse_from(["lemonade-server", "serve"]).unwrap();
        match cli.cmd {
            Command::Serve { host, port, no_tray } => {
                assert!(host.is_none());
                assert!(port.is_none());
                assert!(!no_tray);
            }
            _ => panic!("expected Serve"),
        }
    }

    #[test]
    fn serve_accepts_host_and_port() {
        let cli =
            Cli::try_parse_from(["lemonade-server", "serve", "--host", "0.0.0.0", "--port", "9000"])
                .unwrap();
        match cli.cmd {
            Command::Serve { host, port, .. } => {
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(9000));
            }
            _ => panic!("expected Serve"),
        }
    }

    #[test]
    fn pull_requires_a_name() {
        assert!(Cli::try_parse_from(["lemonade-server", "pull"]).is_err());
        let cli = Cli::try_parse_from(["lemonade-server", "pull", "Qwen3-0.6B-GGUF"]).unwrap();
        match cli.cmd {
            Command::Pull { name } => assert_eq!(name, "Qwen3-0.6B-GGUF"),
            _ => panic!("expected Pull"),
        }
    }

    #[test]
    fn status_and_recipes_take_no_args() {
        assert!(matches!(
            Cli::try_parse_from(["lemonade-server", "status"]).unwrap().cmd,
            Command::Status
        ));
        assert!(matches!(
            Cli::try_parse_from(["lemonade-server", "recipes"]).unwrap().cmd,
            Command::Recipes
        ));
    }
}
