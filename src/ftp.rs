use serde::Serialize;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use crate::tls;

/// Longest reply line accepted, terminator excluded.
pub const MAX_LINE: usize = 8192;
pub const MAX_REPLY_LINES: usize = 1024;

#[derive(Debug, Error)]
pub enum FtpError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid server name: {0}")]
    ServerName(String),
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed by server")]
    Closed,
    #[error("{0}")]
    Negative(Reply),
    #[error("unexpected reply to {command}: {reply}")]
    Unexpected { command: String, reply: Reply },
    #[error("data channel protection requires a TLS session")]
    NotSecure,
}

/// A complete server reply. `text` keeps every line, code included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub fn is_negative(&self) -> bool {
        self.code >= 400
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Secure,
    Plain,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Secure => f.write_str("FTPS (explicit TLS)"),
            Transport::Plain => f.write_str("plain FTP"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// An open control connection. Dropping a session without `quit` closes the
/// socket without saying goodbye.
pub trait Session {
    fn transport(&self) -> Transport;

    fn login(&mut self, username: &str, password: &str) -> Result<Reply, FtpError>;

    fn protect_data_channel(&mut self) -> Result<(), FtpError>;

    fn send_command(&mut self, command: &str) -> Result<Reply, FtpError>;

    fn quit(self: Box<Self>) -> Result<Reply, FtpError>;
}

/// A byte stream carrying the control connection.
pub trait ControlStream: Read + Write {
    /// Ends the stream politely after `QUIT`; TLS sends close_notify here.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ControlStream for TcpStream {}

pub trait Connector {
    fn connect_secure(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, FtpError>;

    fn connect_plain(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, FtpError>;
}

pub fn read_reply<R: BufRead>(reader: &mut R) -> Result<Reply, FtpError> {
    let first = read_line(reader)?;
    let code = parse_code(&first)?;
    let multiline = first.as_bytes().get(3) == Some(&b'-');
    let mut lines = vec![first];
    if multiline {
        let terminator = format!("{code} ");
        let bare = code.to_string();
        loop {
            if lines.len() >= MAX_REPLY_LINES {
                return Err(FtpError::Protocol(format!(
                    "reply has more than {MAX_REPLY_LINES} lines"
                )));
            }
            let line = read_line(reader)?;
            let done = line.starts_with(&terminator) || line == bare;
            lines.push(line);
            if done {
                break;
            }
        }
    }
    Ok(Reply {
        code,
        text: lines.join("\n"),
    })
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String, FtpError> {
    let mut buf = Vec::new();
    let limit = MAX_LINE as u64 + 2;
    if reader.by_ref().take(limit).read_until(b'\n', &mut buf)? == 0 {
        return Err(FtpError::Closed);
    }
    if buf.last() != Some(&b'\n') && buf.len() as u64 >= limit {
        return Err(FtpError::Protocol("reply line too long".to_string()));
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    if buf.len() > MAX_LINE {
        return Err(FtpError::Protocol("reply line too long".to_string()));
    }
    let line = String::from_utf8_lossy(&buf).into_owned();
    trace!(%line, "control line");
    Ok(line)
}

fn parse_code(line: &str) -> Result<u16, FtpError> {
    let bytes = line.as_bytes();
    let valid = bytes.len() >= 3
        && (b'1'..=b'5').contains(&bytes[0])
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_digit()
        && matches!(bytes.get(3), None | Some(b' ' | b'-'));
    if !valid {
        return Err(FtpError::Protocol(format!("malformed reply line {line:?}")));
    }
    line[..3]
        .parse()
        .map_err(|_| FtpError::Protocol(format!("malformed reply line {line:?}")))
}

fn redact(command: &str) -> String {
    match command.get(..5) {
        Some(verb) if verb.eq_ignore_ascii_case("PASS ") => "PASS ****".to_string(),
        _ => command.to_string(),
    }
}

pub struct ControlChannel<S: Read + Write> {
    reader: BufReader<S>,
}

impl<S: Read + Write> ControlChannel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    pub fn read_reply(&mut self) -> Result<Reply, FtpError> {
        let reply = read_reply(&mut self.reader)?;
        debug!(code = reply.code, reply = %reply, "received reply");
        Ok(reply)
    }

    /// Reads the server greeting, skipping any 1xx "ready in n minutes" notices.
    pub fn greeting(&mut self) -> Result<Reply, FtpError> {
        let mut reply = self.read_reply()?;
        while reply.code < 200 {
            reply = self.read_reply()?;
        }
        check_completion("greeting", reply)
    }

    fn execute(&mut self, command: &str) -> Result<Reply, FtpError> {
        debug!(command = %redact(command), "sending command");
        let stream = self.reader.get_mut();
        stream.write_all(command.as_bytes())?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
        self.read_reply()
    }

    /// Sends a command; 4xx and 5xx replies become errors.
    pub fn send_command(&mut self, command: &str) -> Result<Reply, FtpError> {
        let reply = self.execute(command)?;
        if reply.is_negative() {
            return Err(FtpError::Negative(reply));
        }
        Ok(reply)
    }

    /// Sends a command that must complete with a 2xx reply.
    pub fn expect_completion(&mut self, command: &str) -> Result<Reply, FtpError> {
        let reply = self.execute(command)?;
        check_completion(&redact(command), reply)
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<Reply, FtpError> {
        let reply = self.send_command(&format!("USER {username}"))?;
        if reply.is_completion() {
            return Ok(reply);
        }
        if !reply.is_intermediate() {
            return Err(FtpError::Unexpected {
                command: "USER".to_string(),
                reply,
            });
        }
        self.expect_completion(&format!("PASS {password}"))
    }

    pub fn stream_mut(&mut self) -> &mut S {
        self.reader.get_mut()
    }

    /// Releases the underlying stream for a TLS upgrade.
    pub fn into_stream(self) -> Result<S, FtpError> {
        if !self.reader.buffer().is_empty() {
            return Err(FtpError::Protocol(
                "server sent data before the TLS handshake".to_string(),
            ));
        }
        Ok(self.reader.into_inner())
    }
}

fn check_completion(command: &str, reply: Reply) -> Result<Reply, FtpError> {
    if reply.is_negative() {
        return Err(FtpError::Negative(reply));
    }
    if !reply.is_completion() {
        return Err(FtpError::Unexpected {
            command: command.to_string(),
            reply,
        });
    }
    Ok(reply)
}

pub struct FtpSession<S: ControlStream> {
    channel: ControlChannel<S>,
    transport: Transport,
}

impl<S: ControlStream> FtpSession<S> {
    pub fn new(channel: ControlChannel<S>, transport: Transport) -> Self {
        Self { channel, transport }
    }
}

impl<S: ControlStream> Session for FtpSession<S> {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn login(&mut self, username: &str, password: &str) -> Result<Reply, FtpError> {
        self.channel.login(username, password)
    }

    fn protect_data_channel(&mut self) -> Result<(), FtpError> {
        if self.transport != Transport::Secure {
            return Err(FtpError::NotSecure);
        }
        self.channel.expect_completion("PBSZ 0")?;
        self.channel.expect_completion("PROT P")?;
        Ok(())
    }

    fn send_command(&mut self, command: &str) -> Result<Reply, FtpError> {
        self.channel.send_command(command)
    }

    fn quit(mut self: Box<Self>) -> Result<Reply, FtpError> {
        let reply = self.channel.expect_completion("QUIT")?;
        if let Err(err) = self.channel.stream_mut().close() {
            debug!(%err, "control stream did not close cleanly");
        }
        Ok(reply)
    }
}

/// Opens real TCP control connections.
pub struct TcpConnector {
    tls: Arc<rustls::ClientConfig>,
}

impl TcpConnector {
    pub fn new(tls: Arc<rustls::ClientConfig>) -> Self {
        Self { tls }
    }

    fn open(&self, endpoint: &Endpoint) -> Result<ControlChannel<TcpStream>, FtpError> {
        let stream = connect_tcp(endpoint)?;
        stream.set_read_timeout(Some(endpoint.timeout))?;
        stream.set_write_timeout(Some(endpoint.timeout))?;
        let mut channel = ControlChannel::new(stream);
        channel.greeting()?;
        Ok(channel)
    }
}

impl Connector for TcpConnector {
    fn connect_secure(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, FtpError> {
        let mut channel = self.open(endpoint)?;
        channel.expect_completion("AUTH TLS")?;
        let tcp = channel.into_stream()?;
        let stream = tls::handshake(self.tls.clone(), &endpoint.host, tcp)?;
        debug!(%endpoint, "control channel upgraded to TLS");
        Ok(Box::new(FtpSession::new(
            ControlChannel::new(stream),
            Transport::Secure,
        )))
    }

    fn connect_plain(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, FtpError> {
        let channel = self.open(endpoint)?;
        Ok(Box::new(FtpSession::new(channel, Transport::Plain)))
    }
}

fn connect_tcp(endpoint: &Endpoint) -> Result<TcpStream, FtpError> {
    let mut last_err = None;
    for addr in (endpoint.host.as_str(), endpoint.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, endpoint.timeout) {
            Ok(stream) => {
                debug!(%addr, "tcp connected");
                return Ok(stream);
            }
            Err(err) => {
                debug!(%addr, %err, "tcp connect failed");
                last_err = Some(err);
            }
        }
    }
    Err(match last_err {
        Some(err) => FtpError::Io(err),
        None => FtpError::Resolve(endpoint.to_string()),
    })
}
