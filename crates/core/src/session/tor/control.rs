/// Tor control-port client
///
/// Speaks just enough of the control protocol to authenticate, publish and
/// withdraw ephemeral onion services, and watch descriptor uploads.

use crate::session::SessionError;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tordht_common::ControlAuth;
use tracing::{debug, trace};

/// Reply code of asynchronous events
const EVENT_CODE: u16 = 650;

/// One complete reply (all of its lines, status code of the last)
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

pub(crate) struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlConnection {
    pub async fn connect(addr: SocketAddr) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SessionError::Control(format!("connect to {}: {}", addr, e)))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    pub async fn authenticate(&mut self, auth: &ControlAuth) -> Result<(), SessionError> {
        let command = match auth {
            ControlAuth::None => "AUTHENTICATE".to_string(),
            ControlAuth::Password { password } => {
                format!("AUTHENTICATE {}", quote(password))
            }
            ControlAuth::Cookie { path } => {
                let cookie = tokio::fs::read(path).await.map_err(|e| {
                    SessionError::Control(format!("read cookie {}: {}", path.display(), e))
                })?;
                format!("AUTHENTICATE {}", hex::encode(cookie))
            }
        };
        self.command(&command).await?;
        debug!("authenticated to tor control port");
        Ok(())
    }

    /// Send a command and fail unless Tor answers with a 2xx reply
    pub async fn command(&mut self, command: &str) -> Result<Reply, SessionError> {
        trace!(command = %redact(command), "control command");
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        let reply = self.read_reply().await?;
        if !reply.is_ok() {
            return Err(SessionError::Control(format!(
                "{} failed: {} {}",
                redact(command),
                reply.code,
                reply.lines.join(" ")
            )));
        }
        Ok(reply)
    }

    /// Publish a fresh ed25519 v3 service forwarding `remote_port` to `local`.
    /// Returns the service id without the `.onion` suffix.
    pub async fn add_onion(
        &mut self,
        remote_port: u16,
        local: SocketAddr,
    ) -> Result<String, SessionError> {
        let reply = self
            .command(&format!(
                "ADD_ONION NEW:ED25519-V3 Flags=DiscardPK Port={},{}",
                remote_port, local
            ))
            .await?;
        reply
            .lines
            .iter()
            .find_map(|line| line.strip_prefix("ServiceID="))
            .map(str::to_string)
            .ok_or_else(|| SessionError::Control("ADD_ONION reply without ServiceID".to_string()))
    }

    pub async fn del_onion(&mut self, service_id: &str) -> Result<(), SessionError> {
        self.command(&format!("DEL_ONION {}", service_id)).await?;
        Ok(())
    }

    /// Subscribe this connection to descriptor upload events
    pub async fn subscribe_descriptor_events(&mut self) -> Result<(), SessionError> {
        self.command("SETEVENTS HS_DESC").await?;
        Ok(())
    }

    /// Block until Tor reports the descriptor of `service_id` uploaded
    pub async fn wait_for_upload(&mut self, service_id: &str) -> Result<(), SessionError> {
        let uploaded = format!("HS_DESC UPLOADED {} ", service_id);
        loop {
            let reply = self.read_reply().await?;
            if reply.code != EVENT_CODE {
                continue;
            }
            if reply.lines.iter().any(|line| line.starts_with(&uploaded)) {
                debug!(service = %service_id, "onion descriptor uploaded");
                return Ok(());
            }
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, SessionError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.len() < 4 {
                return Err(SessionError::Control(format!("malformed reply line {:?}", line)));
            }
            let code: u16 = line[..3]
                .parse()
                .map_err(|_| SessionError::Control(format!("malformed reply code {:?}", line)))?;
            let text = line[4..].to_string();

            match line.as_bytes()[3] {
                b' ' => {
                    lines.push(text);
                    return Ok(Reply { code, lines });
                }
                b'-' => lines.push(text),
                b'+' => {
                    lines.push(text);
                    loop {
                        let data = self.read_line().await?;
                        if data == "." {
                            break;
                        }
                        lines.push(data);
                    }
                }
                _ => {
                    return Err(SessionError::Control(format!(
                        "malformed reply separator {:?}",
                        line
                    )))
                }
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, SessionError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(SessionError::Control("control connection closed".to_string()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Quote a string argument for the control protocol
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Keep credentials out of logs and error messages
fn redact(command: &str) -> &str {
    if command.starts_with("AUTHENTICATE") {
        "AUTHENTICATE"
    } else {
        command
    }
}
