use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ftp::{Connector, Endpoint, FtpError, Reply, Session, Transport};

pub const DEFAULT_HOST: &str = "162.0.215.16";
pub const FTP_PORT: u16 = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemoteCommand {
    pub command: &'static str,
    pub description: &'static str,
}

pub const COMMANDS: [RemoteCommand; 5] = [
    RemoteCommand {
        command: "SITE CHMOD 755 public",
        description: "Fix public dir",
    },
    RemoteCommand {
        command: "SITE CHMOD 644 public/index.php",
        description: "Fix index.php",
    },
    RemoteCommand {
        command: "SITE CHMOD 644 public/.htaccess",
        description: "Fix .htaccess",
    },
    RemoteCommand {
        command: "SITE CHMOD 644 app/Config/db_config.php",
        description: "Fix db_config",
    },
    RemoteCommand {
        command: "DELE .env",
        description: "Delete .env file to force config usage",
    },
];

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    /// Attempt FTPS before plain FTP.
    pub secure: bool,
}

#[derive(Debug, Error)]
pub enum FixError {
    #[error(
        "could not connect to {endpoint}: {}plain FTP failed ({source})",
        secure_reason(.secure)
    )]
    Connect {
        endpoint: String,
        secure: Option<String>,
        #[source]
        source: FtpError,
    },
}

fn secure_reason(secure: &Option<String>) -> String {
    match secure {
        Some(reason) => format!("FTPS failed ({reason}); "),
        None => String::new(),
    }
}

#[derive(Debug, Serialize)]
pub struct CommandOutcome {
    pub command: String,
    pub description: String,
    pub ok: bool,
    pub response: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub secure_error: Option<String>,
    pub commands: Vec<CommandOutcome>,
    pub closed: bool,
    pub close_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn failed_commands(&self) -> usize {
        self.commands.iter().filter(|outcome| !outcome.ok).count()
    }
}

#[derive(Debug, Serialize)]
pub struct Plan {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub commands: Vec<RemoteCommand>,
}

fn say(out: &mut dyn Write, line: fmt::Arguments<'_>) {
    if let Err(err) = writeln!(out, "{line}") {
        warn!(%err, "failed to write progress line");
    }
}

/// Connects, runs every command in [`COMMANDS`] and disconnects. Only a
/// failure to connect at all is an error; command and close failures are
/// logged and recorded in the report.
pub fn fix_permissions(
    connector: &dyn Connector,
    settings: &Settings,
    out: &mut dyn Write,
) -> Result<RunReport, FixError> {
    let started_at = Utc::now();
    say(out, format_args!("Connecting to {}...", settings.endpoint.host));

    let (mut session, secure_error) = connect(connector, settings, out)?;
    let transport = session.transport();
    info!(%transport, endpoint = %settings.endpoint, "connected");
    say(out, format_args!("Connected via {transport}"));

    let mut commands = Vec::with_capacity(COMMANDS.len());
    for remote in COMMANDS.iter() {
        say(
            out,
            format_args!("Executing: {} ({})", remote.description, remote.command),
        );
        let outcome = match session.send_command(remote.command) {
            Ok(reply) => {
                say(out, format_args!("Response: {reply}"));
                succeeded(remote, &reply)
            }
            Err(err) => {
                info!(command = remote.command, %err, "command failed");
                say(out, format_args!("Failed to {}: {err}", remote.description));
                failed(remote, &err)
            }
        };
        commands.push(outcome);
    }

    let close_error = match session.quit() {
        Ok(reply) => {
            debug!(%reply, "session closed");
            None
        }
        Err(err) => {
            say(out, format_args!("Failed to close connection: {err}"));
            Some(err.to_string())
        }
    };

    say(out, format_args!("Permission fix completed."));
    Ok(RunReport {
        host: settings.endpoint.host.clone(),
        port: settings.endpoint.port,
        transport,
        secure_error,
        commands,
        closed: close_error.is_none(),
        close_error,
        started_at,
        finished_at: Utc::now(),
    })
}

fn connect(
    connector: &dyn Connector,
    settings: &Settings,
    out: &mut dyn Write,
) -> Result<(Box<dyn Session>, Option<String>), FixError> {
    let mut secure_error = None;
    if settings.secure {
        match open_secure(connector, settings) {
            Ok(session) => return Ok((session, None)),
            Err(err) => {
                info!(%err, "secure session failed");
                say(out, format_args!("FTPS failed: {err}. Trying plain FTP..."));
                secure_error = Some(err.to_string());
            }
        }
    } else {
        say(out, format_args!("FTPS disabled; using plain FTP"));
    }

    let session = match open_plain(connector, settings) {
        Ok(session) => session,
        Err(source) => {
            return Err(FixError::Connect {
                endpoint: settings.endpoint.to_string(),
                secure: secure_error,
                source,
            })
        }
    };
    Ok((session, secure_error))
}

fn open_secure(
    connector: &dyn Connector,
    settings: &Settings,
) -> Result<Box<dyn Session>, FtpError> {
    let credentials = &settings.credentials;
    let mut session = connector.connect_secure(&settings.endpoint)?;
    session.login(&credentials.username, &credentials.password)?;
    session.protect_data_channel()?;
    Ok(session)
}

fn open_plain(
    connector: &dyn Connector,
    settings: &Settings,
) -> Result<Box<dyn Session>, FtpError> {
    let credentials = &settings.credentials;
    let mut session = connector.connect_plain(&settings.endpoint)?;
    session.login(&credentials.username, &credentials.password)?;
    Ok(session)
}

fn succeeded(remote: &RemoteCommand, reply: &Reply) -> CommandOutcome {
    CommandOutcome {
        command: remote.command.to_string(),
        description: remote.description.to_string(),
        ok: true,
        response: Some(reply.to_string()),
        error: None,
    }
}

fn failed(remote: &RemoteCommand, err: &FtpError) -> CommandOutcome {
    CommandOutcome {
        command: remote.command.to_string(),
        description: remote.description.to_string(),
        ok: false,
        response: None,
        error: Some(err.to_string()),
    }
}

/// Describes what a run would do without touching the network.
pub fn plan(settings: &Settings, out: &mut dyn Write) -> Plan {
    let mode = if settings.secure {
        "FTPS, falling back to plain FTP"
    } else {
        "plain FTP"
    };
    say(out, format_args!("Target: {} ({mode})", settings.endpoint));
    for remote in COMMANDS.iter() {
        say(
            out,
            format_args!("Would execute: {} ({})", remote.description, remote.command),
        );
    }
    Plan {
        host: settings.endpoint.host.clone(),
        port: settings.endpoint.port,
        secure: settings.secure,
        commands: COMMANDS.to_vec(),
    }
}
