use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, instrument};

use crate::protocol::codec::{FrameReader, write_frame};
use crate::protocol::{
    ClientMessage, CompileRequest, CompileResponse, Evaluator, ExecuteStream, ProtocolError,
    ServerMessage, TestRequest, TestResponse,
};

/// Evaluator backed by a remote worker
#[derive(Debug, Clone)]
pub struct EvalClient {
    addr: String,
}

impl EvalClient {
    /// `addr` is a `host:port` pair
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

struct Connection {
    frames: FrameReader<OwnedReadHalf>,
    write: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            frames: FrameReader::new(read),
            write,
        })
    }

    async fn call(&mut self, message: &ClientMessage) -> Result<ServerMessage, ProtocolError> {
        write_frame(&mut self.write, message).await?;
        match self.frames.next::<ServerMessage>().await? {
            Some(ServerMessage::Error { message }) => Err(ProtocolError::Remote(message)),
            Some(reply) => Ok(reply),
            None => Err(ProtocolError::Closed),
        }
    }
}

#[async_trait]
impl Evaluator for EvalClient {
    #[instrument(skip(self, request), fields(addr = %self.addr, submission = request.submission_id))]
    async fn compile(&self, request: CompileRequest) -> Result<CompileResponse, ProtocolError> {
        let mut connection = Connection::open(&self.addr).await?;
        match connection.call(&ClientMessage::Compile(request)).await? {
            ServerMessage::Compiled(response) => Ok(response),
            other => Err(ProtocolError::Unexpected(format!("{other:?}"))),
        }
    }

    async fn execute(&self, submission_id: u64) -> Result<Box<dyn ExecuteStream>, ProtocolError> {
        let connection = Connection::open(&self.addr).await?;
        debug!(addr = %self.addr, submission = submission_id, "execute stream connected");
        Ok(Box::new(RemoteStream { connection }))
    }
}

struct RemoteStream {
    connection: Connection,
}

#[async_trait]
impl ExecuteStream for RemoteStream {
    async fn run(&mut self, request: TestRequest) -> Result<TestResponse, ProtocolError> {
        let test_id = request.test_id;
        match self.connection.call(&ClientMessage::Test(request)).await? {
            ServerMessage::TestResult(response) if response.test_id == test_id => Ok(response),
            other => Err(ProtocolError::Unexpected(format!(
                "expected result of test {test_id}, got {other:?}"
            ))),
        }
    }

    async fn finish(self: Box<Self>) -> Result<(), ProtocolError> {
        let Connection { mut frames, mut write } = self.connection;
        write_frame(&mut write, &ClientMessage::Close).await?;
        write.shutdown().await?;
        // The worker closes its side once the artifact is gone.
        while frames.next::<ServerMessage>().await?.is_some() {}
        Ok(())
    }
}
