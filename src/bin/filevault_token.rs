//! CLI entry point for filevault-token: issue a bearer token for development.

use clap::Parser;
use std::time::Duration;

use filevault::auth::AuthGate;

#[derive(Parser)]
#[command(name = "filevault-token", about = "Issue a FileVault bearer token for development")]
struct Cli {
    /// Subject the token identifies.
    #[arg(long, default_value = "dev-user-123")]
    subject: String,

    /// Signing secret.  Defaults to the one in the configuration.
    #[arg(long)]
    secret: Option<String>,

    /// Token lifetime in seconds.  Defaults to the configured lifetime.
    #[arg(long)]
    ttl_secs: Option<u64>,

    /// Configuration file used for missing values.
    #[arg(short, long, default_value = "filevault.yaml")]
    config: String,

    /// Server base URL for the usage example.
    #[arg(long, default_value = "http://localhost:8080")]
    base_url: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (secret, ttl) = match (cli.secret, cli.ttl_secs) {
        (Some(secret), Some(ttl)) => (secret, ttl),
        (secret, ttl) => {
            let config = filevault::config::load_config(&cli.config)?;
            (
                secret.unwrap_or(config.auth.jwt_secret),
                ttl.unwrap_or(config.auth.token_expiration),
            )
        }
    };

    let gate = AuthGate::new(&secret, Duration::from_secs(ttl));
    let token = gate.issue(&cli.subject)?;
    let claims = gate.verify(&token)?;

    println!("Generated FileVault token");
    println!("Subject: {}", claims.subject_id);
    println!("Expires: {}", claims.expires_at.to_rfc3339());
    println!();
    println!("Token:");
    println!("{token}");
    println!();
    println!("Usage example:");
    println!(
        "curl -H \"Authorization: Bearer {token}\" -F \"file=@photo.png\" {}/api/v1/upload",
        cli.base_url.trim_end_matches('/')
    );
    Ok(())
}
