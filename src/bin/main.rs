use std::error::Error;
use std::fs;
use std::path::PathBuf;

use circ_auth::bearer_token::TokenSigner;
use circ_auth::config::{AuthConfiguration, GeneratedSecretSource};
use circ_auth::http::client::HttpClient;
use circ_auth::library::LibraryAuthenticator;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "circ-auth-cli")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wrap a provider token in a signed bearer envelope.
    MintToken {
        /// Library signing secret
        #[arg(long, short, required = true)]
        secret: String,

        /// Name of the provider issuing the wrapped token
        #[arg(long, short, required = true)]
        provider: String,

        /// The opaque provider token to wrap
        #[arg(long, short, required = true)]
        token: String,
    },
    /// Verify a bearer envelope and print its issuer and wrapped token.
    DecodeToken {
        /// Library signing secret
        #[arg(long, short, required = true)]
        secret: String,

        /// The compact envelope to verify
        #[arg(long, short, required = true)]
        token: String,
    },
    /// Build every library's provider registry from a JSON configuration
    /// file and report registration errors.
    CheckConfig {
        /// Path to the configuration file
        #[arg(long, short, required = true)]
        config: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::MintToken {
            secret,
            provider,
            token,
        } => {
            let compact = TokenSigner::new(&secret).encode(&provider, &token)?;
            println!("{compact}");
            Ok(())
        }
        Commands::DecodeToken { secret, token } => {
            let envelope = TokenSigner::new(&secret).decode(&token)?;
            println!("issuer: {}", envelope.issuer);
            println!("token: {}", envelope.token);
            Ok(())
        }
        Commands::CheckConfig { config } => {
            let raw = fs::read_to_string(&config)?;
            let configuration: AuthConfiguration = serde_json::from_str(&raw)?;
            let secrets = GeneratedSecretSource::default();
            let http =
                HttpClient::new().map_err(|e| format!("error creating http client: {e}"))?;

            let mut failures = 0usize;
            for library in &configuration.libraries {
                match LibraryAuthenticator::from_config(
                    &configuration,
                    library,
                    &secrets,
                    http.clone(),
                ) {
                    Ok(authenticator) => {
                        let bearer: Vec<&str> = authenticator.bearer_provider_names().collect();
                        println!(
                            "{}: basic={} bearer=[{}]",
                            library.short_name,
                            authenticator
                                .basic_provider()
                                .map(|p| p.label())
                                .unwrap_or("none"),
                            bearer.join(", ")
                        );
                        for (integration, error) in authenticator.registration_errors() {
                            failures += 1;
                            println!("  {integration}: {error}");
                        }
                    }
                    Err(error) => {
                        failures += 1;
                        println!("{}: failed to build: {error}", library.short_name);
                    }
                }
            }
            if failures > 0 {
                return Err(format!("{failures} integration(s) failed to register").into());
            }
            Ok(())
        }
    }
}
