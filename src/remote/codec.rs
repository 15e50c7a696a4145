//! Framing and request encoding
//!
//! Requests are UTF-8 text: `GET <job_id>` or `PUT <job_id> <blob>` where the
//! blob is the base64 text of a [`PayloadCodec`] encoded results mapping. The
//! reply to `GET` is a [`PayloadCodec`] encoded [`FetchReply`].

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::domain::{
    error::DispatchError,
    payload::{Payload, PayloadCodec, PayloadMap}
};

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), DispatchError>
where
    W: AsyncWrite + Unpin
{
    let len = u32::try_from(payload.len())
        .map_err(|_| DispatchError::Protocol(format!("frame of {} bytes does not fit a u32 length", payload.len())))?;

    writer.write_all(&len.to_be_bytes()).await.map_err(io_error)?;
    writer.write_all(payload).await.map_err(io_error)?;
    writer.flush().await.map_err(io_error)
}

/// Read one length-prefixed frame; `None` when the peer closed cleanly between frames
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Vec<u8>>, DispatchError>
where
    R: AsyncRead + Unpin
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await.map_err(io_error)?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(DispatchError::Protocol(format!("short read: {} of 4 length bytes", filled)));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame_bytes {
        return Err(DispatchError::Protocol(format!("frame of {} bytes exceeds the {} byte limit", len, max_frame_bytes)));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| DispatchError::Protocol(format!("short read of a {} byte frame: {}", len, e)))?;
    Ok(Some(body))
}

fn io_error(err: std::io::Error) -> DispatchError {
    DispatchError::Connection(err.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Get { job_id: String },
    Put { job_id: String, results: PayloadMap }
}

impl Request {
    pub fn job_id(&self) -> &str {
        match self {
            Request::Get { job_id } | Request::Put { job_id, .. } => job_id
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DispatchError> {
        let job_id = self.job_id();
        if job_id.is_empty() || job_id.chars().any(char::is_whitespace) {
            return Err(DispatchError::Protocol(format!("job id '{}' is empty or contains whitespace", job_id)));
        }

        let text = match self {
            Request::Get { job_id } => format!("GET {}", job_id),
            Request::Put { job_id, results } => format!("PUT {} {}", job_id, STANDARD.encode(PayloadCodec::encode(results)?))
        };
        Ok(text.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DispatchError> {
        let text =
            std::str::from_utf8(bytes).map_err(|e| DispatchError::Protocol(format!("request is not UTF-8: {}", e)))?;
        let mut parts = text.split(' ');

        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("GET"), Some(job_id), None, None) if !job_id.is_empty() => {
                Ok(Request::Get { job_id: job_id.to_string() })
            }
            (Some("PUT"), Some(job_id), Some(blob), None) if !job_id.is_empty() => {
                let results = PayloadCodec::decode(&STANDARD.decode(blob)?)?;
                Ok(Request::Put { job_id: job_id.to_string(), results })
            }
            _ => Err(DispatchError::Protocol(format!("malformed request '{}'", truncate(text, 64))))
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text
    }
}

/// Reply to a `GET` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FetchReply {
    Arguments(Vec<Payload>),
    UnknownJob(String),
    Refused(String)
}

impl FetchReply {
    pub fn encode(&self) -> Result<Vec<u8>, DispatchError> {
        PayloadCodec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DispatchError> {
        PayloadCodec::decode(bytes)
    }

    /// Arguments, or the matching error for a refused fetch
    pub fn into_arguments(self) -> Result<Vec<Payload>, DispatchError> {
        match self {
            FetchReply::Arguments(arguments) => Ok(arguments),
            FetchReply::UnknownJob(job_id) => Err(DispatchError::UnknownJob(job_id)),
            FetchReply::Refused(reason) => Err(DispatchError::Execution(reason))
        }
    }
}
