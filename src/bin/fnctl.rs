//! fnctl - Command-line client for the fngate control API
//!
//! Usage:
//!   fnctl deploy <name> <zip>     Upload a deployment package
//!   fnctl status <name>           Show an app's record
//!   fnctl activate <name>         Route proxy traffic to an app
//!   fnctl deactivate <name>       Stop routing proxy traffic to an app
//!   fnctl remove <name>           Delete an app's function
//!   fnctl list                    List all apps
//!   fnctl config                  View/set client configuration

use anyhow::{bail, Context, Result};
use base64::Engine;
use fngate::control::{ApiResponse, DeployRequest};
use fngate::registry::ApplicationRecord;
use serde::{Deserialize, Serialize};
use std::env;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default API URL
const DEFAULT_API_URL: &str = "http://127.0.0.1:9999";

/// Deploys wait for function activation on the server side
const DEPLOY_IO_TIMEOUT: Duration = Duration::from_secs(300);
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Client configuration stored in ~/.fngate/config.json
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct CliConfig {
    /// API endpoint
    api_url: Option<String>,
    /// API token
    api_token: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Version,
    Deploy { name: String, path: PathBuf },
    Status { name: String },
    Activate { name: String },
    Deactivate { name: String },
    Remove { name: String },
    List,
    Config(ConfigCommand),
    Usage(&'static str),
}

#[derive(Debug, PartialEq)]
enum ConfigCommand {
    Show,
    ApiUrl { url: Option<String> },
    ApiToken { token: Option<String> },
}

/// Minimal HTTP/1.1 client for the control API
struct ApiClient {
    base_url: String,
    token: String,
}

impl ApiClient {
    fn new() -> Result<Self> {
        let config = load_config()?;
        let base_url = env::var("FNGATE_API_URL")
            .ok()
            .or(config.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let token = env::var("FNGATE_API_TOKEN")
            .ok()
            .or(config.api_token)
            .context("No API token configured. Run: fnctl config api-token <token>")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: &str, path: &str, body: Option<&str>, timeout: Duration) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let url = url.strip_prefix("http://").unwrap_or(&url);
        let (host_port, path) = match url.find('/') {
            Some(idx) => (&url[..idx], &url[idx..]),
            None => (url, "/"),
        };

        let mut stream = TcpStream::connect(host_port)
            .with_context(|| format!("Failed to connect to API at {}", self.base_url))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let body = body.unwrap_or("");
        let head = format!(
            "{} {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Authorization: Bearer {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n",
            method,
            path,
            host_port,
            self.token,
            body.len()
        );

        stream.write_all(head.as_bytes())?;
        stream.write_all(body.as_bytes())?;
        stream.flush()?;

        let mut response = String::new();
        stream.read_to_string(&mut response)?;

        match response.find("\r\n\r\n") {
            Some(idx) => Ok(response[idx + 4..].to_string()),
            None => Ok(response),
        }
    }

    fn get(&self, path: &str) -> Result<String> {
        self.request("GET", path, None, IO_TIMEOUT)
    }

    fn post(&self, path: &str, body: &str) -> Result<String> {
        self.request("POST", path, Some(body), IO_TIMEOUT)
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    match parse_command(&args) {
        Command::Help => print_help(),
        Command::Version => print_version(),
        Command::Usage(usage) => bail!("Usage: {}", usage),
        Command::Deploy { name, path } => handle_deploy(&name, &path)?,
        Command::Status { name } => {
            let client = ApiClient::new()?;
            let response = client.get(&format!("/apps/{}/status", name))?;
            print_app(parse_response(&response)?);
        }
        Command::Activate { name } => handle_transition(&name, "activate", "Activated")?,
        Command::Deactivate { name } => handle_transition(&name, "deactivate", "Deactivated")?,
        Command::Remove { name } => handle_transition(&name, "remove", "Removed")?,
        Command::List => handle_list()?,
        Command::Config(cmd) => handle_config(cmd)?,
    }

    Ok(())
}

fn parse_command(args: &[String]) -> Command {
    let Some(first) = args.first() else {
        return Command::Help;
    };
    let name = args.get(1).filter(|s| !s.starts_with('-')).cloned();

    match first.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-v" => Command::Version,
        "deploy" | "push" => match (name, args.get(2)) {
            (Some(name), Some(path)) => Command::Deploy {
                name,
                path: PathBuf::from(path),
            },
            _ => Command::Usage("fnctl deploy <name> <zip>"),
        },
        "status" | "info" => name.map_or(Command::Usage("fnctl status <name>"), |name| Command::Status { name }),
        "activate" => name.map_or(Command::Usage("fnctl activate <name>"), |name| Command::Activate { name }),
        "deactivate" => name.map_or(Command::Usage("fnctl deactivate <name>"), |name| Command::Deactivate { name }),
        "remove" | "rm" | "delete" => name.map_or(Command::Usage("fnctl remove <name>"), |name| Command::Remove { name }),
        "list" | "ls" | "apps" => Command::List,
        "config" => parse_config_command(&args[1..]),
        _ => Command::Help,
    }
}

fn parse_config_command(args: &[String]) -> Command {
    match args.first().map(String::as_str) {
        Some("api-url") | Some("api_url") => Command::Config(ConfigCommand::ApiUrl {
            url: args.get(1).cloned(),
        }),
        Some("api-token") | Some("api_token") | Some("token") => Command::Config(ConfigCommand::ApiToken {
            token: args.get(1).cloned(),
        }),
        _ => Command::Config(ConfigCommand::Show),
    }
}

fn parse_response<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    let result: ApiResponse<T> = serde_json::from_str(body).context("Failed to parse API response")?;
    if !result.success {
        bail!("{}", result.error.unwrap_or_else(|| "request failed".to_string()));
    }
    result.data.context("API response carried no data")
}

fn handle_deploy(name: &str, path: &Path) -> Result<()> {
    let artifact = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    println!("Deploying {} ({} bytes)...", name, artifact.len());

    let request = DeployRequest {
        name: name.to_string(),
        archive: base64::engine::general_purpose::STANDARD.encode(&artifact),
    };

    let client = ApiClient::new()?;
    let response = client.request(
        "POST",
        "/apps/deploy",
        Some(&serde_json::to_string(&request)?),
        DEPLOY_IO_TIMEOUT,
    )?;
    let app: ApplicationRecord = parse_response(&response)?;

    println!();
    println!("App {} deployed", app.name);
    print_app(app);
    Ok(())
}

fn handle_transition(name: &str, action: &str, verb: &str) -> Result<()> {
    let client = ApiClient::new()?;
    let response = client.post(&format!("/apps/{}/{}", name, action), "")?;
    let app: ApplicationRecord = parse_response(&response)?;
    println!("{} {}", verb, app.name);
    print_app(app);
    Ok(())
}

fn handle_list() -> Result<()> {
    let client = ApiClient::new()?;
    let response = client.get("/apps")?;
    let apps: Vec<ApplicationRecord> = parse_response(&response)?;

    if apps.is_empty() {
        println!("No apps yet. Deploy one with: fnctl deploy <name> <zip>");
        return Ok(());
    }

    println!("{:<32} {:<10} {}", "NAME", "STATUS", "UPDATED");
    for app in apps {
        println!(
            "{:<32} {:<10} {}",
            app.name,
            app.status.to_string(),
            app.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn handle_config(cmd: ConfigCommand) -> Result<()> {
    let mut config = load_config()?;

    match cmd {
        ConfigCommand::Show => {
            println!("Config file: {}", config_path().display());
            println!("api-url:   {}", config.api_url.as_deref().unwrap_or(DEFAULT_API_URL));
            println!(
                "api-token: {}",
                if config.api_token.is_some() { "(set)" } else { "(not set)" }
            );
        }
        ConfigCommand::ApiUrl { url: Some(url) } => {
            config.api_url = Some(url.clone());
            save_config(&config)?;
            println!("API URL set to {}", url);
        }
        ConfigCommand::ApiUrl { url: None } => {
            println!("{}", config.api_url.as_deref().unwrap_or(DEFAULT_API_URL));
        }
        ConfigCommand::ApiToken { token: Some(token) } => {
            config.api_token = Some(token);
            save_config(&config)?;
            println!("API token saved");
        }
        ConfigCommand::ApiToken { token: None } => match config.api_token {
            Some(token) => println!("{}", token),
            None => println!("(not set)"),
        },
    }

    Ok(())
}

fn print_app(app: ApplicationRecord) {
    println!("  Name:    {}", app.name);
    println!("  Status:  {}", app.status);
    println!("  ID:      {}", app.id);
    println!("  Created: {}", app.created_at.to_rfc3339());
    println!("  Updated: {}", app.updated_at.to_rfc3339());
    println!("  URL:     http://{}.<gateway-domain>/", app.name);
}

fn print_help() {
    println!(
        r#"
fnctl - Manage apps on an fngate function gateway

USAGE:
    fnctl <command> [options]

COMMANDS:
    deploy <name> <zip>      Create or update an app from a deployment package
    status <name>            Show an app's record
    activate <name>          Route proxy traffic to an app
    deactivate <name>        Stop routing proxy traffic to an app
    remove <name>            Delete the app's function (the record is kept)
    list                     List all apps

    config                   Show client configuration
    config api-url [url]     Set/get API URL
    config api-token [token] Set/get API token

    help                     Show this help
    version                  Show version

EXAMPLES:
    fnctl deploy shop build/shop.zip
    fnctl activate shop
    curl http://shop.localhost:8080/cart

ENVIRONMENT:
    FNGATE_API_URL           API endpoint (default: http://127.0.0.1:9999)
    FNGATE_API_TOKEN         API authentication token
"#
    );
}

fn print_version() {
    println!("fnctl {}", env!("CARGO_PKG_VERSION"));
}

fn config_path() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fngate")
        .join("config.json")
}

fn load_config() -> Result<CliConfig> {
    let path = config_path();
    if !path.exists() {
        return Ok(CliConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    serde_json::from_str(&content).context("Failed to parse config file")
}

fn save_config(config: &CliConfig) -> Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_empty_is_help() {
        assert_eq!(parse_command(&[]), Command::Help);
        assert_eq!(parse_command(&args(&["bogus"])), Command::Help);
    }

    #[test]
    fn test_parse_deploy() {
        assert_eq!(
            parse_command(&args(&["deploy", "shop", "build/shop.zip"])),
            Command::Deploy {
                name: "shop".to_string(),
                path: PathBuf::from("build/shop.zip"),
            }
        );
        assert_eq!(
            parse_command(&args(&["deploy", "shop"])),
            Command::Usage("fnctl deploy <name> <zip>")
        );
    }

    #[test]
    fn test_parse_lifecycle_commands() {
        let name = || "shop".to_string();
        assert_eq!(parse_command(&args(&["status", "shop"])), Command::Status { name: name() });
        assert_eq!(parse_command(&args(&["activate", "shop"])), Command::Activate { name: name() });
        assert_eq!(
            parse_command(&args(&["deactivate", "shop"])),
            Command::Deactivate { name: name() }
        );
        assert_eq!(parse_command(&args(&["rm", "shop"])), Command::Remove { name: name() });
        assert_eq!(parse_command(&args(&["ls"])), Command::List);
    }

    #[test]
    fn test_parse_missing_name() {
        assert_eq!(
            parse_command(&args(&["activate"])),
            Command::Usage("fnctl activate <name>")
        );
        assert_eq!(
            parse_command(&args(&["remove", "--force"])),
            Command::Usage("fnctl remove <name>")
        );
    }

    #[test]
    fn test_parse_config() {
        assert_eq!(parse_command(&args(&["config"])), Command::Config(ConfigCommand::Show));
        assert_eq!(
            parse_command(&args(&["config", "api-url", "http://gw:9999"])),
            Command::Config(ConfigCommand::ApiUrl {
                url: Some("http://gw:9999".to_string())
            })
        );
        assert_eq!(
            parse_command(&args(&["config", "token"])),
            Command::Config(ConfigCommand::ApiToken { token: None })
        );
    }

    #[test]
    fn test_parse_response_error() {
        let err = parse_response::<ApplicationRecord>(r#"{"success":false,"error":"App not found"}"#).unwrap_err();
        assert_eq!(err.to_string(), "App not found");
    }

    #[test]
    fn test_parse_response_list() {
        let apps: Vec<ApplicationRecord> = parse_response(r#"{"success":true,"data":[]}"#).unwrap();
        assert!(apps.is_empty());
    }
}
