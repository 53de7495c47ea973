//! CLI command definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "keyhub")]
#[command(about = "API-key gated WebSocket hub", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level, used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the keyhub server
    Serve {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:8080", env = "KEYHUB_BIND")]
        bind: String,

        /// Admin key required on the key management routes
        #[arg(long, env = "KEYHUB_ADMIN_KEY")]
        admin_key: Option<String>,

        /// Frames queued per connection before handlers wait
        #[arg(long, default_value_t = 64)]
        outbound_buffer: usize,

        /// Issue a key with this name at startup and print its secret (can be repeated)
        ///
        /// Examples:
        ///   keyhub serve --bootstrap-key svc1 --bootstrap-key svc2
        #[arg(long = "bootstrap-key", value_parser = parse_key_name)]
        bootstrap_keys: Vec<String>,
    },

    /// Print the stored digest of a secret
    Digest {
        /// Plaintext secret
        secret: String,
    },
}

fn parse_key_name(s: &str) -> Result<String, String> {
    let name = s.trim();
    if name.is_empty() {
        return Err("Key name must not be empty".to_string());
    }
    Ok(name.to_string())
}
