mod config;
mod llm;
mod session;

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigStore, Form};
use crate::llm::{Completer, HttpGateway};
use crate::session::Session;

/// Chat with an OpenAI-compatible completion endpoint
#[derive(Parser, Debug)]
#[command(name = "llmchat")]
#[command(about = "Minimal chat client for OpenAI-compatible completion APIs")]
struct Args {
    /// Config file (base64-encoded JSON)
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Serve chat sessions over telnet on this port instead of the terminal
    #[arg(short, long)]
    listen: Option<u16>,

    /// API key (overrides the config file)
    #[arg(short = 'k', long)]
    api_key: Option<String>,

    /// Base URL of the API (overrides the config file)
    #[arg(short, long)]
    base_url: Option<String>,

    /// Model name (overrides the config file)
    #[arg(short, long)]
    model: Option<String>,

    /// Sampling temperature, 0.0 to 2.0
    #[arg(short, long)]
    temperature: Option<String>,

    /// Maximum reply length in tokens, 1 to 8192
    #[arg(long)]
    max_tokens: Option<String>,
}

impl Args {
    fn apply_overrides(&self, form: &mut Form) {
        let overrides = [
            (&self.api_key, &mut form.api_key),
            (&self.base_url, &mut form.base_url),
            (&self.model, &mut form.model_name),
            (&self.temperature, &mut form.temperature),
            (&self.max_tokens, &mut form.max_tokens),
        ];
        for (value, field) in overrides {
            if let Some(value) = value {
                *field = value.clone();
            }
        }
    }
}

async fn serve(
    port: u16,
    completer: Arc<dyn Completer>,
    store: Arc<ConfigStore>,
    form: Form,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("Listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((mut stream, addr)) => {
                info!("New connection from {}", addr);

                let completer = Arc::clone(&completer);
                let store = Arc::clone(&store);
                let form = form.clone();

                tokio::spawn(async move {
                    let mut session =
                        Session::new(addr.to_string(), completer, store, form).remote();
                    let (reader, writer) = stream.split();
                    if let Err(e) = session.run(reader, writer).await {
                        error!("Session error for {}: {}", addr, e);
                    }
                    info!(
                        "Connection closed: {} ({} transcript entries)",
                        addr,
                        session.app().transcript().len()
                    );
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so the terminal session keeps stdout to itself.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("llmchat=info".parse()?))
        .init();

    let args = Args::parse();

    let store = Arc::new(ConfigStore::new(&args.config));
    let mut form = Form::from_stored(&store.load());
    args.apply_overrides(&mut form);

    info!("Config file: {}", store.path().display());
    info!("Base URL: {}", form.base_url);
    info!("Model: {}", form.model_name);

    let completer: Arc<dyn Completer> = Arc::new(HttpGateway::new());

    match args.listen {
        Some(port) => serve(port, completer, store, form).await,
        None => {
            let mut session = Session::new("terminal", completer, store, form);
            session.run(tokio::io::stdin(), tokio::io::stdout()).await?;
            info!(
                "Session ended ({} transcript entries)",
                session.app().transcript().len()
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_replace_loaded_values() {
        let args = Args::parse_from([
            "llmchat",
            "--api-key",
            "sk-cli",
            "--model",
            "gpt-4o-mini",
            "--max-tokens",
            "512",
        ]);
        let mut form = Form::default();

        args.apply_overrides(&mut form);

        assert_eq!(form.api_key, "sk-cli");
        assert_eq!(form.model_name, "gpt-4o-mini");
        assert_eq!(form.max_tokens, "512");
        assert_eq!(form.base_url, config::DEFAULT_BASE_URL);
        assert_eq!(form.temperature, config::DEFAULT_TEMPERATURE);
    }

    #[test]
    fn listen_selects_server_mode() {
        let args = Args::parse_from(["llmchat", "--listen", "2323", "-c", "/tmp/chat.json"]);

        assert_eq!(args.listen, Some(2323));
        assert_eq!(args.config, "/tmp/chat.json");
    }
}
