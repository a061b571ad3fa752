use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::protocol::codec::{FrameReader, write_frame};
use crate::protocol::{
    ClientMessage, Evaluator, ExecuteStream, ProtocolError, ServerMessage, TestRequest,
};

/// Serves an [`Evaluator`] to remote graders, one task per connection
pub struct EvalServer {
    listener: TcpListener,
    evaluator: Arc<dyn Evaluator>,
}

impl EvalServer {
    pub async fn bind(addr: SocketAddr, evaluator: Arc<dyn Evaluator>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            evaluator,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires.
    ///
    /// Open connections are served to completion before the evaluator
    /// releases its sandboxes.
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "worker listening");
        }
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let evaluator = Arc::clone(&self.evaluator);
                        connections.spawn(
                            async move {
                                if let Err(e) = serve(stream, evaluator).await {
                                    warn!(error = %e, "connection failed");
                                }
                            }
                            .instrument(info_span!("connection", %peer)),
                        );
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
            }
        }

        debug!(open = connections.len(), "waiting for open connections");
        while connections.join_next().await.is_some() {}
        self.evaluator.shutdown().await;
        info!("worker stopped");
    }
}

async fn serve(stream: TcpStream, evaluator: Arc<dyn Evaluator>) -> Result<(), ProtocolError> {
    let (read, mut write) = stream.into_split();
    let mut frames = FrameReader::new(read);

    let first = match frames.next::<ClientMessage>().await {
        Ok(Some(message)) => message,
        Ok(None) => return Ok(()),
        Err(e) => {
            reply_error(&mut write, &e).await;
            return Err(e);
        }
    };

    match first {
        ClientMessage::Compile(request) => {
            debug!(submission = request.submission_id, "compile call");
            let reply = match evaluator.compile(request).await {
                Ok(response) => ServerMessage::Compiled(response),
                Err(e) => ServerMessage::Error {
                    message: e.to_string(),
                },
            };
            write_frame(&mut write, &reply).await
        }
        ClientMessage::Test(request) => {
            let submission_id = request.submission_id;
            debug!(submission = submission_id, "execute stream opened");
            let mut stream = match evaluator.execute(submission_id).await {
                Ok(stream) => stream,
                Err(e) => {
                    reply_error(&mut write, &e).await;
                    return Err(e);
                }
            };

            let pumped = pump(&mut stream, submission_id, request, &mut frames, &mut write).await;
            let finished = stream.finish().await;
            debug!(submission = submission_id, "execute stream closed");
            pumped.and(finished)
        }
        ClientMessage::Close => Ok(()),
    }
}

/// Answer test frames in order until the client closes the stream
async fn pump<W: AsyncWrite + Unpin>(
    stream: &mut Box<dyn ExecuteStream>,
    submission_id: u64,
    first: TestRequest,
    frames: &mut FrameReader<OwnedReadHalf>,
    write: &mut W,
) -> Result<(), ProtocolError> {
    let mut next = Some(first);

    while let Some(request) = next.take() {
        let reply = if request.submission_id != submission_id {
            ServerMessage::Error {
                message: format!(
                    "test for submission {} sent on the stream of submission {submission_id}",
                    request.submission_id
                ),
            }
        } else {
            match stream.run(request).await {
                Ok(response) => ServerMessage::TestResult(response),
                Err(e) => ServerMessage::Error {
                    message: e.to_string(),
                },
            }
        };
        write_frame(write, &reply).await?;

        next = match frames.next::<ClientMessage>().await {
            Ok(Some(ClientMessage::Test(request))) => Some(request),
            Ok(Some(ClientMessage::Close)) | Ok(None) => None,
            Ok(Some(other)) => {
                let e = ProtocolError::Unexpected(format!("{other:?} on an execute stream"));
                reply_error(write, &e).await;
                return Err(e);
            }
            Err(e) => {
                reply_error(write, &e).await;
                return Err(e);
            }
        };
    }

    Ok(())
}

async fn reply_error<W: AsyncWrite + Unpin>(write: &mut W, error: &ProtocolError) {
    let reply = ServerMessage::Error {
        message: error.to_string(),
    };
    if let Err(e) = write_frame(write, &reply).await {
        debug!(error = %e, "could not report protocol error");
    }
}
