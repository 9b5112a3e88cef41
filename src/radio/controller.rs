use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use utoipa::ToSchema;

use super::error::ControllerError;
use super::protocol::{parse_frequency, parse_report, Request};
use super::{Radio, Tuning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ControllerSession {
    pub state: ConnectionState,
    pub frequency_hz: Option<u64>,
    pub mode: Option<String>,
    #[schema(value_type = Option<String>)]
    pub recording: Option<PathBuf>,
    /// A record command whose outcome is unknown (timed out or the link
    /// dropped). The receiver may be recording.
    pub recording_unconfirmed: bool,
    pub last_command_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for ControllerSession {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            frequency_hz: None,
            mode: None,
            recording: None,
            recording_unconfirmed: false,
            last_command_at: None,
            last_error: None,
        }
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Client for the receiver's line-oriented remote-control port.
///
/// Every command is bounded by `timeout`. A timeout or a dropped connection
/// moves the session to [`ConnectionState::Error`]; the next command
/// reconnects before it is sent.
pub struct RadioController {
    address: String,
    timeout: Duration,
    conn: Option<Connection>,
    session: ControllerSession,
}

impl RadioController {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            conn: None,
            session: ControllerSession::default(),
        }
    }

    pub async fn connect(&mut self) -> Result<(), ControllerError> {
        self.conn = None;
        let stream = match timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(self.fail(ControllerError::Connect {
                    address: self.address.clone(),
                    message: e.to_string(),
                }))
            }
            Err(_) => {
                return Err(self.fail(ControllerError::Timeout {
                    command: format!("connect {}", self.address),
                    timeout: self.timeout,
                }))
            }
        };

        let (read, write) = stream.into_split();
        self.conn = Some(Connection {
            reader: BufReader::new(read),
            writer: write,
        });
        self.session.state = ConnectionState::Connected;
        self.session.last_error = None;
        log::info!("Connected to radio at {}", self.address);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.conn.take().is_some() {
            log::info!("Disconnected from radio at {}", self.address);
        }
        self.session.state = ConnectionState::Disconnected;
    }

    pub async fn tune(&mut self, tuning: &Tuning) -> Result<(), ControllerError> {
        self.execute_report(Request::SetFrequency(tuning.frequency_hz))
            .await?;
        self.session.frequency_hz = Some(tuning.frequency_hz);

        self.execute_report(Request::SetMode(tuning.mode.clone()))
            .await?;
        self.session.mode = Some(tuning.mode.clone());

        if let Some(width) = tuning.filter_width_hz {
            self.execute_report(Request::SetFilterWidth(width)).await?;
        }
        if let Some(squelch) = tuning.squelch_db {
            self.execute_report(Request::SetSquelch(squelch)).await?;
        }
        // Not every receiver build exposes AGC over the remote port.
        self.execute_optional(Request::AgcOff).await;
        if let Some(gain) = tuning.gain {
            self.execute_report(Request::SetGain(gain)).await?;
        }

        log::info!(
            "Tuned to {:.3} MHz {}",
            tuning.frequency_hz as f64 / 1_000_000.0,
            tuning.mode
        );
        Ok(())
    }

    pub async fn start(&mut self, target: &Path) -> Result<(), ControllerError> {
        if let Some(current) = &self.session.recording {
            log::debug!("Already recording to {}", current.display());
            return Ok(());
        }
        self.ensure_connected().await?;
        self.execute_optional(Request::Aos).await;

        match self
            .execute_report(Request::RecordStart(target.to_path_buf()))
            .await
        {
            Ok(()) => {
                self.session.recording = Some(target.to_path_buf());
                self.session.recording_unconfirmed = false;
                log::info!("Started recording to {}", target.display());
                Ok(())
            }
            Err(e) => {
                if e.breaks_connection() {
                    self.session.recording_unconfirmed = true;
                }
                Err(e)
            }
        }
    }

    pub async fn stop(&mut self) -> Result<(), ControllerError> {
        if self.session.recording.is_none() && !self.session.recording_unconfirmed {
            return Ok(());
        }
        match self.execute_report(Request::RecordStop).await {
            Ok(()) => {}
            // Nothing was recording after all.
            Err(ControllerError::Rejected { .. }) if self.session.recording.is_none() => {}
            Err(e) => return Err(e),
        }
        self.session.recording_unconfirmed = false;
        if let Some(path) = self.session.recording.take() {
            log::info!("Stopped recording to {}", path.display());
        }
        self.execute_optional(Request::Los).await;
        Ok(())
    }

    pub async fn status(&mut self) -> Result<ControllerSession, ControllerError> {
        let request = Request::GetFrequency;
        let reply = self.execute(&request).await?;
        let hz = parse_frequency(&reply).ok_or_else(|| ControllerError::Protocol {
            command: request.to_string(),
            reply,
        })?;
        self.session.frequency_hz = Some(hz);
        Ok(self.session.clone())
    }

    pub fn session(&self) -> &ControllerSession {
        &self.session
    }

    async fn execute_report(&mut self, request: Request) -> Result<(), ControllerError> {
        debug_assert!(request.expects_report());
        let reply = self.execute(&request).await?;
        match parse_report(&reply) {
            Some(0) => Ok(()),
            Some(code) => Err(ControllerError::Rejected {
                command: request.to_string(),
                code,
            }),
            None => Err(ControllerError::Protocol {
                command: request.to_string(),
                reply,
            }),
        }
    }

    /// Send a command whose failure does not affect the operation.
    async fn execute_optional(&mut self, request: Request) {
        let line = request.to_string();
        if let Err(e) = self.execute_report(request).await {
            log::debug!("Ignoring failed `{}`: {}", line, e);
        }
    }

    /// A stale connection is only noticed mid-command; reconnect and resend
    /// once before giving up.
    async fn execute(&mut self, request: &Request) -> Result<String, ControllerError> {
        match self.exchange(request).await {
            Err(ControllerError::ConnectionLost(reason)) => {
                log::warn!("Radio connection lost ({}), resending `{}`", reason, request);
                self.exchange(request).await
            }
            result => result,
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), ControllerError> {
        if self.session.state != ConnectionState::Connected || self.conn.is_none() {
            if self.session.state == ConnectionState::Error {
                log::warn!("Reconnecting to radio at {}", self.address);
            }
            self.connect().await?;
        }
        Ok(())
    }

    async fn exchange(&mut self, request: &Request) -> Result<String, ControllerError> {
        self.ensure_connected().await?;

        let line = request.to_string();
        let Some(conn) = self.conn.as_mut() else {
            return Err(ControllerError::ConnectionLost("no connection".into()));
        };

        match timeout(self.timeout, round_trip(conn, &line)).await {
            Ok(Ok(reply)) => {
                self.session.last_command_at = Some(Utc::now());
                Ok(reply)
            }
            Ok(Err(e)) => Err(self.fail(e)),
            Err(_) => Err(self.fail(ControllerError::Timeout {
                command: line,
                timeout: self.timeout,
            })),
        }
    }

    fn fail(&mut self, err: ControllerError) -> ControllerError {
        if err.breaks_connection() {
            self.conn = None;
            self.session.state = ConnectionState::Error;
        }
        self.session.last_error = Some(err.to_string());
        log::warn!("Radio command failed: {}", err);
        err
    }
}

async fn round_trip(conn: &mut Connection, line: &str) -> Result<String, ControllerError> {
    conn.writer.write_all(format!("{}\n", line).as_bytes()).await?;
    conn.writer.flush().await?;

    let mut reply = String::new();
    let read = conn.reader.read_line(&mut reply).await?;
    if read == 0 {
        return Err(ControllerError::ConnectionLost(
            "connection closed by radio".into(),
        ));
    }
    Ok(reply.trim().to_string())
}

#[async_trait]
impl Radio for RadioController {
    async fn tune(&mut self, tuning: &Tuning) -> Result<(), ControllerError> {
        RadioController::tune(self, tuning).await
    }

    async fn start(&mut self, target: &Path) -> Result<(), ControllerError> {
        RadioController::start(self, target).await
    }

    async fn stop(&mut self) -> Result<(), ControllerError> {
        RadioController::stop(self).await
    }

    async fn status(&mut self) -> Result<ControllerSession, ControllerError> {
        RadioController::status(self).await
    }

    fn disconnect(&mut self) {
        RadioController::disconnect(self)
    }

    fn session(&self) -> ControllerSession {
        self.session.clone()
    }
}
