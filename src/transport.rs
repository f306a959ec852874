use std::io;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::runtime::Raft;
use crate::types::{AppendEntries, AppendEntriesReply, RequestVote, RequestVoteReply};

/// Largest frame either side will send or accept.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("reply does not match the request")]
    UnexpectedReply,
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("peer unreachable: {0}")]
    Unreachable(String),
}

/// The two calls a node makes to its peers.
///
/// An `Err` means the peer could not be asked or did not answer; the caller
/// treats it as a missed round.
#[async_trait]
pub trait RaftTransport<C>: Send + Sync {
    async fn request_vote(&self, args: RequestVote) -> Result<RequestVoteReply, TransportError>;
    async fn append_entries(&self, args: AppendEntries<C>) -> Result<AppendEntriesReply, TransportError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "rpc", content = "args", rename_all = "camelCase")]
enum Request<C> {
    RequestVote(RequestVote),
    AppendEntries(AppendEntries<C>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "rpc", content = "reply", rename_all = "camelCase")]
enum Reply {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
}

/// Write one frame: a 4-byte big-endian length followed by a JSON body.
async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(bytes.len()));
    }
    // Bounded by MAX_FRAME_LEN above.
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame written by [`write_frame`].
async fn read_frame<R, T>(reader: &mut R) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// TCP transport to one peer.
///
/// Each call dials the peer, sends one request frame and reads one reply
/// frame. Only connecting is bounded here; the caller bounds the whole call.
pub struct TcpTransport<C> {
    address: String,
    connect_timeout: Duration,
    _command: PhantomData<fn() -> C>,
}

impl<C> TcpTransport<C> {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            _command: PhantomData,
        }
    }
}

impl<C: Serialize> TcpTransport<C> {
    async fn call(&self, request: Request<C>) -> Result<Reply, TransportError> {
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &request).await?;
        read_frame(&mut stream).await
    }
}

#[async_trait]
impl<C> RaftTransport<C> for TcpTransport<C>
where
    C: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn request_vote(&self, args: RequestVote) -> Result<RequestVoteReply, TransportError> {
        match self.call(Request::RequestVote(args)).await? {
            Reply::RequestVote(reply) => Ok(reply),
            Reply::AppendEntries(_) => Err(TransportError::UnexpectedReply),
        }
    }

    async fn append_entries(&self, args: AppendEntries<C>) -> Result<AppendEntriesReply, TransportError> {
        match self.call(Request::AppendEntries(args)).await? {
            Reply::AppendEntries(reply) => Ok(reply),
            Reply::RequestVote(_) => Err(TransportError::UnexpectedReply),
        }
    }
}

/// Accept peer connections and answer their calls through `raft`.
///
/// A connection may carry any number of request/reply exchanges. Returns
/// only if accepting fails.
pub async fn serve<C>(listener: TcpListener, raft: Raft<C>) -> Result<(), TransportError>
where
    C: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(peer = %raft.me(), %addr, "accepting peer connections");
    }
    loop {
        let (stream, remote) = listener.accept().await?;
        let raft = raft.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, raft).await {
                debug!(%remote, %error, "peer connection closed");
            }
        });
    }
}

async fn handle_connection<C>(mut stream: TcpStream, raft: Raft<C>) -> Result<(), TransportError>
where
    C: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    stream.set_nodelay(true)?;
    loop {
        let request: Request<C> = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(TransportError::Io(error)) if error.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let reply = match request {
            Request::RequestVote(args) => raft.request_vote(args).await.map(Reply::RequestVote),
            Request::AppendEntries(args) => raft.append_entries(args).await.map(Reply::AppendEntries),
        };
        match reply {
            Ok(reply) => write_frame(&mut stream, &reply).await?,
            Err(error) => {
                warn!(%error, "dropping peer call");
                return Ok(());
            }
        }
    }
}
