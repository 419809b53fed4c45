//! Control-protocol client: one TCP connection to `portkeeperd`, one
//! request/response exchange per call.

use anyhow::{bail, Context, Result};
use portkeeper_core::{
    frame_encode, ControlRequest, ControlResponse, Credentials, FrameDecoder, Operation,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Creating or deleting a rule waits on the forwarder program.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ControlClient {
    stream: TcpStream,
    decoder: FrameDecoder,
    credentials: Credentials,
}

impl ControlClient {
    pub async fn connect(addr: &str, credentials: Credentials) -> Result<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .with_context(|| format!("timed out connecting to {addr}"))?
            .with_context(|| format!("cannot connect to portkeeperd at {addr}"))?;
        debug!(addr, "connected");
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            credentials,
        })
    }

    /// Send `operation` and return the daemon's answer. Error responses are
    /// turned into `Err`.
    pub async fn call(&mut self, operation: Operation) -> Result<ControlResponse> {
        let request = ControlRequest::new(self.credentials.clone(), operation);
        let frame = frame_encode(&request).context("failed to encode request")?;
        self.stream
            .write_all(&frame)
            .await
            .context("failed to send request")?;

        let response = tokio::time::timeout(RESPONSE_TIMEOUT, self.read_response())
            .await
            .context("timed out waiting for portkeeperd")??;

        match response {
            ControlResponse::Error { kind, message } => {
                debug!(kind = kind.as_str(), "daemon returned an error");
                bail!("{message}")
            }
            other => Ok(other),
        }
    }

    async fn read_response(&mut self) -> Result<ControlResponse> {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = self
                .stream
                .read(&mut buf)
                .await
                .context("failed to read response")?;
            if n == 0 {
                bail!("portkeeperd closed the connection");
            }
            let mut responses: Vec<ControlResponse> = self
                .decoder
                .feed(&buf[..n])
                .context("malformed response")?;
            if !responses.is_empty() {
                return Ok(responses.remove(0));
            }
        }
    }
}
