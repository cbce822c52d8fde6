mod fixer;
mod ftp;
mod tls;

use clap::{ArgAction, Parser, Subcommand};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::fixer::{Credentials, FixError, Settings, DEFAULT_HOST, FTP_PORT};
use crate::ftp::{Endpoint, TcpConnector};

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

#[derive(Parser, Debug)]
#[command(
    name = "fixperms",
    version,
    about = "Repair file permissions on the hosting FTP server"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    /// Overrides FTP_HOST and the config file.
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    timeout_sec: Option<u64>,
    /// Print the planned commands without connecting.
    #[arg(long)]
    dry_run: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Debug, Error)]
enum FixpermsError {
    #[error("FTP_USER or FTP_PASS not set.")]
    MissingCredentials,
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Fix(#[from] FixError),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Config {
    version: u32,
    server: Server,
    tls: Tls,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Server {
    host: String,
    port: u16,
    timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Tls {
    enabled: bool,
    verify_certificates: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            server: Server::default(),
            tls: Tls::default(),
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: FTP_PORT,
            timeout_sec: 30,
        }
    }
}

impl Default for Tls {
    fn default() -> Self {
        Self {
            enabled: true,
            verify_certificates: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug)]
struct Context {
    config_path: PathBuf,
    config_explicit: bool,
    json: bool,
}

fn main() -> Result<(), FixpermsError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let ctx = build_context(&cli);

    let result = match &cli.command {
        Some(Commands::Config { command }) => handle_config(&ctx, command),
        None => handle_fix(&ctx, &cli, &|key: &str| env::var(key).ok()),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("Error: {err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fixperms={level},warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn build_context(cli: &Cli) -> Context {
    let (config_path, config_explicit) = resolve_config_path(cli.config.as_ref());
    Context {
        config_path,
        config_explicit,
        json: cli.json,
    }
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = override_path {
        return (path.clone(), true);
    }
    if let Ok(path) = env::var("FIXPERMS_CONFIG") {
        return (PathBuf::from(path), true);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    (base, false)
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("FIXPERMS_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("fixperms");
    base
}

fn ensure_parent(path: &Path) -> Result<(), FixpermsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn read_config_from_str(content: &str) -> Result<Config, FixpermsError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

fn read_config(path: &Path) -> Result<Config, FixpermsError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

fn validate_config(cfg: &Config) -> Result<(), FixpermsError> {
    if cfg.version != 1 {
        return Err(FixpermsError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    if cfg.server.host.trim().is_empty() {
        return Err(FixpermsError::Config("server.host must not be empty".to_string()));
    }
    if cfg.server.port == 0 {
        return Err(FixpermsError::Config("server.port must not be 0".to_string()));
    }
    if cfg.server.timeout_sec == 0 {
        return Err(FixpermsError::Config(
            "server.timeout_sec must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// The config file is optional unless a path was given explicitly.
fn load_config(ctx: &Context) -> Result<Config, FixpermsError> {
    if ctx.config_path.exists() {
        return read_config(&ctx.config_path).map_err(|err| {
            FixpermsError::Config(format!(
                "config is invalid. Please edit {} and try again. ({})",
                ctx.config_path.display(),
                err
            ))
        });
    }
    if ctx.config_explicit {
        return Err(FixpermsError::Config(format!(
            "config file not found: {}",
            ctx.config_path.display()
        )));
    }
    Ok(Config::default())
}

fn credentials_from_env(
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Credentials, FixpermsError> {
    let username = lookup("FTP_USER").filter(|value| !value.is_empty());
    let password = lookup("FTP_PASS").filter(|value| !value.is_empty());
    match (username, password) {
        (Some(username), Some(password)) => Ok(Credentials { username, password }),
        _ => Err(FixpermsError::MissingCredentials),
    }
}

/// Flags win over the environment, which wins over the config file.
fn resolve_settings(
    cli: &Cli,
    cfg: &Config,
    credentials: Credentials,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Settings, FixpermsError> {
    let host = cli
        .host
        .clone()
        .or_else(|| lookup("FTP_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| cfg.server.host.clone());
    let port = cli.port.unwrap_or(cfg.server.port);
    let timeout_sec = cli.timeout_sec.unwrap_or(cfg.server.timeout_sec);
    if port == 0 {
        return Err(FixpermsError::Config("port must not be 0".to_string()));
    }
    if timeout_sec == 0 {
        return Err(FixpermsError::Config(
            "timeout must be at least 1 second".to_string(),
        ));
    }
    Ok(Settings {
        endpoint: Endpoint {
            host: host.trim().to_string(),
            port,
            timeout: Duration::from_secs(timeout_sec),
        },
        credentials,
        secure: cfg.tls.enabled,
    })
}

fn handle_config(ctx: &Context, command: &ConfigCommand) -> Result<(), FixpermsError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
    }
}

fn handle_fix(
    ctx: &Context,
    cli: &Cli,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(), FixpermsError> {
    let credentials = credentials_from_env(lookup)?;
    let cfg = load_config(ctx)?;
    let settings = resolve_settings(cli, &cfg, credentials, lookup)?;

    if cli.dry_run {
        if ctx.json {
            let plan = fixer::plan(&settings, &mut io::sink());
            return output(ctx, serde_json::to_value(&plan)?);
        }
        fixer::plan(&settings, &mut io::stdout().lock());
        return Ok(());
    }

    let connector = TcpConnector::new(tls::client_config(cfg.tls.verify_certificates)?);
    if ctx.json {
        let report = fixer::fix_permissions(&connector, &settings, &mut io::sink())?;
        return output(ctx, serde_json::to_value(&report)?);
    }
    let report = fixer::fix_permissions(&connector, &settings, &mut io::stdout().lock())?;
    if report.failed_commands() > 0 {
        tracing::warn!(
            failed = report.failed_commands(),
            "some commands failed; check the log above"
        );
    }
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), FixpermsError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), FixpermsError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "deploy".to_string(),
            password: "hunter2".to_string(),
        }
    }

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["fixperms"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn config_unknown_field_errors() {
        let yaml = r#"
version: 1
unknown: true
server:
  host: ftp.example.test
"#;
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1").expect("config");
        assert_eq!(cfg.server.host, DEFAULT_HOST);
        assert_eq!(cfg.server.port, 21);
        assert_eq!(cfg.server.timeout_sec, 30);
        assert!(cfg.tls.enabled);
        assert!(!cfg.tls.verify_certificates);
    }

    #[test]
    fn embedded_default_config_is_valid() {
        let cfg = read_config_from_str(DEFAULT_CONFIG_YAML).expect("default config");
        assert_eq!(cfg.server.host, DEFAULT_HOST);
        assert!(!cfg.tls.verify_certificates);
    }

    #[test]
    fn config_rejects_unsupported_version_and_zero_timeout() {
        assert!(matches!(
            read_config_from_str("version: 2"),
            Err(FixpermsError::Config(_))
        ));
        assert!(matches!(
            read_config_from_str("version: 1\nserver:\n  timeout_sec: 0\n"),
            Err(FixpermsError::Config(_))
        ));
    }

    #[test]
    fn credentials_require_both_values() {
        let lookup = env_from(&[("FTP_USER", "deploy")]);
        assert!(matches!(
            credentials_from_env(&lookup),
            Err(FixpermsError::MissingCredentials)
        ));
        let lookup = env_from(&[("FTP_USER", "deploy"), ("FTP_PASS", "")]);
        assert!(matches!(
            credentials_from_env(&lookup),
            Err(FixpermsError::MissingCredentials)
        ));
        let lookup = env_from(&[("FTP_USER", "deploy"), ("FTP_PASS", "hunter2")]);
        let creds = credentials_from_env(&lookup).unwrap();
        assert_eq!(creds.username, "deploy");
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn host_defaults_to_config_then_literal() {
        let lookup = env_from(&[]);
        let settings =
            resolve_settings(&cli(&[]), &Config::default(), credentials(), &lookup).unwrap();
        assert_eq!(settings.endpoint.host, DEFAULT_HOST);
        assert_eq!(settings.endpoint.port, 21);
        assert_eq!(settings.endpoint.timeout, Duration::from_secs(30));
        assert!(settings.secure);
    }

    #[test]
    fn empty_ftp_host_is_treated_as_unset() {
        let lookup = env_from(&[("FTP_HOST", "")]);
        let settings =
            resolve_settings(&cli(&[]), &Config::default(), credentials(), &lookup).unwrap();
        assert_eq!(settings.endpoint.host, DEFAULT_HOST);
    }

    #[test]
    fn flags_override_environment_and_config() {
        let lookup = env_from(&[("FTP_HOST", "env.example.test")]);
        let mut cfg = Config::default();
        cfg.server.host = "config.example.test".to_string();
        cfg.tls.enabled = false;

        let settings = resolve_settings(&cli(&[]), &cfg, credentials(), &lookup).unwrap();
        assert_eq!(settings.endpoint.host, "env.example.test");
        assert!(!settings.secure);

        let flags = cli(&["--host", "flag.example.test", "--port", "2121", "--timeout-sec", "5"]);
        let settings = resolve_settings(&flags, &cfg, credentials(), &lookup).unwrap();
        assert_eq!(settings.endpoint.host, "flag.example.test");
        assert_eq!(settings.endpoint.port, 2121);
        assert_eq!(settings.endpoint.timeout, Duration::from_secs(5));
    }

    #[test]
    fn zero_timeout_flag_is_rejected() {
        let lookup = env_from(&[]);
        let result = resolve_settings(
            &cli(&["--timeout-sec", "0"]),
            &Config::default(),
            credentials(),
            &lookup,
        );
        assert!(matches!(result, Err(FixpermsError::Config(_))));
    }

    #[test]
    fn missing_default_config_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let ctx = Context {
            config_path: dir.path().join("config.yaml"),
            config_explicit: false,
            json: false,
        };
        let cfg = load_config(&ctx).unwrap();
        assert_eq!(cfg.server.host, DEFAULT_HOST);
    }

    #[test]
    fn missing_explicit_config_errors() {
        let dir = tempdir().unwrap();
        let ctx = Context {
            config_path: dir.path().join("absent.yaml"),
            config_explicit: true,
            json: false,
        };
        let err = load_config(&ctx).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn invalid_config_is_actionable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "version: 1\nserver:\n  hostname: typo\n").unwrap();
        let ctx = Context {
            config_path: path,
            config_explicit: false,
            json: false,
        };
        let err = load_config(&ctx).unwrap_err().to_string();
        assert!(err.contains("config is invalid"));
        assert!(err.contains("Please edit"));
    }
}
