//! keyguard command-line front end
//!
//! Device side:
//! - `keyguard enroll` - generate and store the device key, print the enrollment payload
//! - `keyguard status` / `keyguard unenroll`
//! - `keyguard sign` - print the signed-request headers for one request
//!
//! Server side:
//! - `keyguard registry ...` - submit payloads and manage device status
//! - `keyguard verify` - check a captured request against the registry

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use keyguard::fingerprint::FingerprintConfig;
use keyguard::{
    ClientConfig, DeviceBindingClient, DeviceRegistry, EnrollmentPayload,
    IncomingRequest, InitialStatus, KeyStoreConfig, RequestToSign, SignatureVerifier,
    SignedRequestHeaders, VerifierConfig, WrappingKey,
};

const KEY_FILE_NAME: &str = "device_key.json";

/// Device-bound request signing.
#[derive(Parser)]
#[command(name = "keyguard")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the device key pair and print the enrollment payload.
    Enroll {
        #[command(flatten)]
        device: DeviceArgs,

        /// Label for this device (defaults to the host name)
        #[arg(long)]
        name: Option<String>,

        /// Write the payload to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show whether this device is enrolled.
    Status {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Destroy the local key pair.
    Unenroll {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Print the signed-request headers for one request as JSON.
    Sign {
        #[command(flatten)]
        device: DeviceArgs,

        /// API key bound into the signature
        #[arg(long, env = "KEYGUARD_API_KEY")]
        api_key: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Full URL or path with query
        url: String,

        /// File holding the exact request body
        #[arg(long)]
        body_file: Option<PathBuf>,
    },

    /// Manage enrolled devices.
    Registry {
        #[command(flatten)]
        registry: RegistryArgs,

        #[command(subcommand)]
        action: RegistryAction,
    },

    /// Verify a captured request against the registry.
    ///
    /// Exits non-zero and prints the rejection reason when verification fails.
    Verify {
        #[command(flatten)]
        registry: RegistryArgs,

        /// HTTP method as received
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Path and query exactly as received
        path: String,

        /// JSON file with the seven signed-request header values
        #[arg(long)]
        headers: PathBuf,

        /// File holding the received body
        #[arg(long)]
        body_file: Option<PathBuf>,

        /// Verifier config JSON (skew window, cache timeout, failure policy)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct DeviceArgs {
    /// Directory holding the sealed device key
    #[arg(long, env = "KEYGUARD_STATE_DIR", default_value = ".keyguard")]
    state_dir: PathBuf,

    /// 64 hex chars; seals the private key at rest
    #[arg(long, env = "KEYGUARD_WRAPPING_KEY", hide_env_values = true)]
    wrapping_key: String,
}

#[derive(Args)]
struct RegistryArgs {
    /// Directory holding enrollment records
    #[arg(long, env = "KEYGUARD_REGISTRY_DIR", default_value = "registry")]
    registry_dir: PathBuf,
}

#[derive(Subcommand)]
enum RegistryAction {
    /// Register a device from its enrollment payload.
    Submit {
        /// Enrollment payload JSON
        payload: PathBuf,

        /// Start the device as active instead of pending
        #[arg(long)]
        approve: bool,
    },
    /// pending -> active
    Approve { device_id: Uuid },
    /// active -> suspended
    Suspend { device_id: Uuid },
    /// active | suspended -> revoked
    Revoke { device_id: Uuid },
    /// List all records, oldest first.
    List,
}

fn device_client(args: &DeviceArgs, api_key: &str) -> Result<DeviceBindingClient> {
    let wrapping_key = WrappingKey::from_hex(&args.wrapping_key)
        .context("Invalid KEYGUARD_WRAPPING_KEY (expected 64 hex chars)")?;

    let config = ClientConfig {
        api_key: api_key.to_string(),
        user_agent: Some(format!("keyguard-cli/{}", env!("CARGO_PKG_VERSION"))),
        key_store: KeyStoreConfig::SealedFile {
            path: args.state_dir.join(KEY_FILE_NAME),
            wrapping_key,
        },
        fingerprint: FingerprintConfig::Host,
    };
    Ok(DeviceBindingClient::from_config(config))
}

fn open_registry(args: &RegistryArgs) -> Result<DeviceRegistry> {
    DeviceRegistry::open(&args.registry_dir)
        .with_context(|| format!("Failed to open registry at {}", args.registry_dir.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {} {}", what, path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("Failed to parse {} {}", what, path.display()))
}

fn read_body(path: Option<&PathBuf>) -> Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path).with_context(|| format!("Failed to read body {}", path.display())),
        None => Ok(Vec::new()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_registry(args: &RegistryArgs, action: RegistryAction) -> Result<()> {
    let registry = open_registry(args)?;

    match action {
        RegistryAction::Submit { payload, approve } => {
            let payload: EnrollmentPayload = read_json(&payload, "enrollment payload")?;
            let initial = if approve { InitialStatus::Active } else { InitialStatus::Pending };
            let record = registry.register(payload, initial).await?;
            print_json(&record)
        }
        RegistryAction::Approve { device_id } => print_json(&registry.approve(&device_id).await?),
        RegistryAction::Suspend { device_id } => print_json(&registry.suspend(&device_id).await?),
        RegistryAction::Revoke { device_id } => print_json(&registry.revoke(&device_id).await?),
        RegistryAction::List => print_json(&registry.list().await),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays clean JSON
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { device, name, output } => {
            let client = device_client(&device, "")?;
            let payload = client.enroll(name.as_deref()).await?;
            let json = serde_json::to_string_pretty(&payload)?;

            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    log::info!("Enrollment payload written to {}", path.display());
                }
                None => println!("{}", json),
            }
            log::info!("Enrolled with key id {}", payload.key_id);
        }

        Commands::Status { device } => {
            let client = device_client(&device, "")?;
            if client.is_enrolled().await {
                println!("enrolled (key id {})", client.key_id().await?);
            } else {
                println!("not enrolled");
            }
        }

        Commands::Unenroll { device } => {
            device_client(&device, "")?.unenroll().await?;
            log::info!("Device key removed");
        }

        Commands::Sign {
            device,
            api_key,
            method,
            url,
            body_file,
        } => {
            let client = device_client(&device, &api_key)?;
            let body = read_body(body_file.as_ref())?;
            let headers = client
                .sign_request(&RequestToSign::new(&method, &url).with_body(&body))
                .await?;
            print_json(&headers)?;
        }

        Commands::Registry { registry, action } => run_registry(&registry, action).await?,

        Commands::Verify {
            registry,
            method,
            path,
            headers,
            body_file,
            config,
        } => {
            let config: VerifierConfig = match config {
                Some(path) => read_json(&path, "verifier config")?,
                None => VerifierConfig::default(),
            };
            let headers: SignedRequestHeaders = read_json(&headers, "headers")?;
            let body = read_body(body_file.as_ref())?;

            let verifier = SignatureVerifier::with_memory_cache(Arc::new(open_registry(&registry)?), config);
            let request = IncomingRequest {
                method: &method,
                path_and_query: &path,
                headers: &headers,
                body: &body,
            };

            match verifier.verify(&request).await {
                Ok(verified) => print_json(&serde_json::json!({
                    "deviceId": verified.device_id,
                    "keyId": verified.key_id,
                    "label": verified.label,
                    "timestamp": verified.timestamp,
                }))?,
                Err(e) => {
                    let reason = e.reason();
                    return Err(anyhow::Error::new(e).context(format!("rejected: {}", reason)));
                }
            }
        }
    }

    Ok(())
}
