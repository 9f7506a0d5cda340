//! Peer wire protocol: newline-delimited JSON frames `{type, payload}`.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::command::LogEntry;
use crate::directory::NodeId;
use crate::error::ProtocolError;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Every `type` tag a peer may send.
pub const MESSAGE_TYPES: &[&str] = &[
    "ADDCONNECTION",
    "LEADERELECTION",
    "VOTERESPONSE",
    "ELECTIONRESULT",
    "HEARBEAT",
    "MISSINGLOG",
    "APPENDLOG",
    "REQUESTCONSENSUSVOTING",
    "RESPONSECONSENSUSVOTING",
    "APPLYLOG",
    "DELETELOG",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    #[serde(rename = "ADDCONNECTION")]
    AddConnection(Hello),
    #[serde(rename = "LEADERELECTION")]
    LeaderElection(ElectionRequest),
    #[serde(rename = "VOTERESPONSE")]
    VoteResponse(Vote),
    #[serde(rename = "ELECTIONRESULT")]
    ElectionResult(ElectionResult),
    // The tag's spelling is part of the wire format.
    #[serde(rename = "HEARBEAT")]
    Heartbeat(Heartbeat),
    #[serde(rename = "MISSINGLOG")]
    MissingLog(MissingLog),
    #[serde(rename = "APPENDLOG")]
    AppendLog(AppendLog),
    #[serde(rename = "REQUESTCONSENSUSVOTING")]
    RequestConsensusVoting(VotingRequest),
    #[serde(rename = "RESPONSECONSENSUSVOTING")]
    ResponseConsensusVoting(VotingResponse),
    #[serde(rename = "APPLYLOG")]
    ApplyLog(LogRef),
    #[serde(rename = "DELETELOG")]
    DeleteLog(LogRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionRequest {
    pub server_id: NodeId,
    pub log_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub server_id: NodeId,
    pub accept_leader: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionResult {
    pub server_id: NodeId,
}

/// `log_id` is `-1` when the leader could not read its own log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub server_id: NodeId,
    pub log_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingLog {
    pub server_id: NodeId,
    pub log_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendLog {
    pub server_id: NodeId,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingRequest {
    pub method: Method,
    pub query: String,
    #[serde(default)]
    pub values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingResponse {
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRef {
    pub log_id: u64,
}

impl Message {
    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AddConnection(_) => "ADDCONNECTION",
            Message::LeaderElection(_) => "LEADERELECTION",
            Message::VoteResponse(_) => "VOTERESPONSE",
            Message::ElectionResult(_) => "ELECTIONRESULT",
            Message::Heartbeat(_) => "HEARBEAT",
            Message::MissingLog(_) => "MISSINGLOG",
            Message::AppendLog(_) => "APPENDLOG",
            Message::RequestConsensusVoting(_) => "REQUESTCONSENSUSVOTING",
            Message::ResponseConsensusVoting(_) => "RESPONSECONSENSUSVOTING",
            Message::ApplyLog(_) => "APPLYLOG",
            Message::DeleteLog(_) => "DELETELOG",
        }
    }

    /// Decodes one frame, telling apart a missing tag, an unknown tag and a
    /// payload that does not fit its tag.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(frame).map_err(ProtocolError::InvalidJson)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();
        if !MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Longest frame accepted from a peer, newline excluded.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Reads the next non-empty line. `Ok(None)` means the peer closed the
/// connection.
///
/// Lines that are not UTF-8 or longer than [`MAX_FRAME_LEN`] are logged and
/// skipped; only I/O errors end the stream.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    read_frame_limited(reader, MAX_FRAME_LEN).await
}

async fn read_frame_limited<R>(reader: &mut R, max_len: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(max_len as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }

        if line.len() > max_len && line.last() != Some(&b'\n') {
            warn!(limit = max_len, "dropping oversized frame");
            skip_line(reader).await?;
            continue;
        }

        let text = match std::str::from_utf8(&line) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "dropping frame that is not UTF-8");
                continue;
            }
        };
        let trimmed = text.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}

/// Discards input up to and including the next newline without buffering it.
async fn skip_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (used, done) = {
            let buf = reader.fill_buf().await?;
            match buf.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (buf.len(), buf.is_empty()),
            }
        };
        reader.consume(used);
        if done {
            return Ok(());
        }
    }
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
