// Client side of the credential broker protocol.
// Frames are a 4-byte big-endian length followed by a UTF-8 JSON body, both ways.

use crate::error::BrokerError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// The broker may wait on the platform for a while before answering.
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Credentials {
    Password {
        #[serde(rename = "accountName")]
        account_name: String,
        password: String,
        #[serde(rename = "rememberPassword")]
        remember_password: bool,
    },
    Refresh {
        #[serde(rename = "refreshToken")]
        refresh_token: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum BrokerRequest {
    Credentials { credentials: Credentials },
    Code { code: String },
}

impl BrokerRequest {
    pub fn password(account_name: &str, password: &str) -> Self {
        BrokerRequest::Credentials {
            credentials: Credentials::Password {
                account_name: account_name.to_string(),
                password: password.to_string(),
                remember_password: true,
            },
        }
    }

    pub fn refresh(refresh_token: &str) -> Self {
        BrokerRequest::Credentials {
            credentials: Credentials::Refresh {
                refresh_token: refresh_token.to_string(),
            },
        }
    }

    pub fn code(code: &str) -> Self {
        BrokerRequest::Code {
            code: code.trim().to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReply {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    guard: bool,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerReply {
    /// A second-factor code has to be sent over the same connection.
    Guard,
    Token {
        token: String,
        refresh_token: Option<String>,
    },
}

fn parse_reply(body: &[u8]) -> Result<BrokerReply, BrokerError> {
    let raw: RawReply = serde_json::from_slice(body)
        .map_err(|e| BrokerError::Protocol(format!("invalid reply body: {}", e)))?;
    if let Some(error) = raw.error {
        return Err(BrokerError::Rejected(error));
    }
    if raw.guard {
        return Ok(BrokerReply::Guard);
    }
    match raw.token {
        Some(token) if !token.is_empty() => Ok(BrokerReply::Token {
            token,
            refresh_token: raw.refresh_token.filter(|t| !t.is_empty()),
        }),
        _ => Err(BrokerError::Protocol(
            "reply carries neither error, guard nor token".to_string(),
        )),
    }
}

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// An open broker session. Kept alive across a second-factor prompt.
pub struct BrokerConnection {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection").finish_non_exhaustive()
    }
}

impl BrokerConnection {
    pub async fn connect(path: &Path) -> Result<Self, BrokerError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self {
            framed: Framed::new(stream, frame_codec()),
        })
    }

    pub async fn send(&mut self, request: &BrokerRequest) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| BrokerError::Protocol(format!("failed to encode request: {}", e)))?;
        self.framed.send(Bytes::from(body)).await?;
        Ok(())
    }

    pub async fn receive(&mut self) -> Result<BrokerReply, BrokerError> {
        let frame = tokio::time::timeout(REPLY_TIMEOUT, self.framed.next())
            .await
            .map_err(|_| {
                BrokerError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "broker did not answer in time",
                ))
            })?;
        match frame {
            Some(Ok(body)) => parse_reply(&body),
            Some(Err(e)) => Err(BrokerError::Io(e)),
            None => Err(BrokerError::Protocol(
                "broker closed the connection without replying".to_string(),
            )),
        }
    }

    pub async fn exchange(&mut self, request: &BrokerRequest) -> Result<BrokerReply, BrokerError> {
        self.send(request).await?;
        self.receive().await
    }
}

/// Where the broker listens.
#[derive(Debug, Clone)]
pub struct BrokerEndpoint {
    socket_path: PathBuf,
}

impl BrokerEndpoint {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Opens a connection and sends the first request on it.
    pub async fn open(&self, request: &BrokerRequest) -> Result<(BrokerConnection, BrokerReply), BrokerError> {
        let mut connection = BrokerConnection::connect(&self.socket_path).await?;
        let reply = connection.exchange(request).await?;
        Ok((connection, reply))
    }
}
