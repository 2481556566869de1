//! Minimal QMP (QEMU Machine Protocol) client used to ask the emulator to quit.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::QmpError;

#[derive(Serialize)]
struct QmpCommand<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<serde_json::Value>,
}

// Greeting and event frames are parsed only so they can be skipped.
#[derive(Deserialize, Debug)]
#[allow(dead_code)]
struct QmpResponse {
    #[serde(rename = "return")]
    return_: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    event: Option<String>,
    #[serde(rename = "QMP")]
    greeting: Option<serde_json::Value>,
}

pub struct QmpClient<S> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: tokio::io::WriteHalf<S>,
}

impl QmpClient<UnixStream> {
    /// Connect to a QMP unix socket and negotiate capabilities.
    pub async fn connect(path: &Path) -> Result<Self, QmpError> {
        let stream = UnixStream::connect(path).await?;
        Self::handshake(stream).await
    }
}

impl<S> QmpClient<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Read the greeting and enter command mode on an open stream.
    pub async fn handshake(stream: S) -> Result<Self, QmpError> {
        let (read, writer) = tokio::io::split(stream);
        let mut client = Self {
            reader: BufReader::new(read),
            writer,
        };
        client.read_response().await?;
        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    pub async fn execute(
        &mut self,
        cmd: &str,
        args: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, QmpError> {
        let command = QmpCommand {
            execute: cmd,
            arguments: args,
        };
        let mut buf = serde_json::to_vec(&command).map_err(QmpError::Encode)?;
        buf.push(b'\n');
        self.writer.write_all(&buf).await?;

        loop {
            let resp = self.read_response().await?;
            if let Some(ret) = resp.return_ {
                return Ok(ret);
            }
            if let Some(err) = resp.error {
                return Err(QmpError::Command(err.to_string()));
            }
            // Ignore events
        }
    }

    /// Ask the emulator to exit immediately.
    pub async fn quit(&mut self) -> Result<(), QmpError> {
        self.execute("quit", None).await.map(|_| ())
    }

    async fn read_response(&mut self) -> Result<QmpResponse, QmpError> {
        let mut line = String::new();
        self.reader.read_line(&mut line).await?;
        if line.is_empty() {
            return Err(QmpError::Closed);
        }
        serde_json::from_str(&line).map_err(|source| QmpError::Parse { line, source })
    }
}
