use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ConnectionStatus, LinkObserver, MessageSink};
use crate::error::LinkError;
use crate::message::Message;

/// Delay between two connection attempts
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Subscribing side of a link, also used to reach the global channel.
pub struct LinkClient {
    addr: String,
    backoff: Duration,
    observer: Option<Arc<dyn LinkObserver>>,
    outbound: Option<mpsc::Receiver<Message>>,
}

/// Cloneable handle feeding the client's outbound queue.
#[derive(Clone)]
pub struct LinkSender {
    tx: mpsc::Sender<Message>,
}

impl MessageSink for LinkSender {
    fn send(&self, message: Message) -> Result<(), LinkError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::QueueFull,
            TrySendError::Closed(_) => LinkError::Closed,
        })
    }
}

/// Running client. Dropping the handle stops the client as well.
pub struct LinkClientHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LinkClientHandle {
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the client and waits for its task to wind down.
    pub async fn join(self) {
        self.stop();
        let LinkClientHandle { shutdown, task } = self;
        if let Err(e) = task.await {
            warn!(error = %e, "[link-client] task ended abnormally");
        }
        drop(shutdown);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Shutdown,
}

enum Event {
    Line(std::io::Result<Option<String>>),
    Outbound(Option<Message>),
    Shutdown,
}

/// Only forwards actual transitions, the reconnect loop reports `Lost` on
/// every failed attempt.
struct StatusReporter {
    observer: Option<Arc<dyn LinkObserver>>,
    last: Option<ConnectionStatus>,
}

impl StatusReporter {
    fn report(&mut self, status: ConnectionStatus) {
        if self.last == Some(status) {
            return;
        }
        self.last = Some(status);
        if let Some(observer) = &self.observer {
            observer.on_status(status);
        }
    }
}

impl LinkClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            backoff: RECONNECT_BACKOFF,
            observer: None,
            outbound: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LinkObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Enables the outbound queue; messages wait there while disconnected.
    pub fn sender(&mut self, capacity: usize) -> LinkSender {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.outbound = Some(rx);
        LinkSender { tx }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn spawn<F>(self, handler: F) -> LinkClientHandle
    where
        F: FnMut(Message) + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(handler, rx));
        LinkClientHandle { shutdown, task }
    }

    /// Connects, reads until the link drops, waits `backoff`, repeats, until
    /// `shutdown` flips or its sender goes away.
    pub async fn run<F>(self, mut handler: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(Message) + Send + 'static,
    {
        let LinkClient {
            addr,
            backoff,
            observer,
            mut outbound,
        } = self;
        let mut reporter = StatusReporter {
            observer,
            last: None,
        };

        loop {
            if *shutdown.borrow() {
                break;
            }

            let attempt = tokio::select! {
                _ = shutdown.changed() => break,
                attempt = TcpStream::connect(addr.as_str()) => attempt,
            };

            match attempt {
                Ok(stream) => {
                    info!(%addr, "[link-client] connected");
                    reporter.report(ConnectionStatus::Connected);
                    let end = session(stream, &addr, &mut handler, &mut outbound, &mut shutdown).await;
                    reporter.report(ConnectionStatus::Lost);
                    if end == SessionEnd::Shutdown {
                        break;
                    }
                    warn!(%addr, retry_in = ?backoff, "[link-client] connection lost");
                }
                Err(e) => {
                    reporter.report(ConnectionStatus::Lost);
                    warn!(%addr, error = %e, retry_in = ?backoff, "[link-client] connect failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(%addr, "[link-client] stopped");
    }
}

async fn session<F>(
    stream: TcpStream,
    addr: &str,
    handler: &mut F,
    outbound: &mut Option<mpsc::Receiver<Message>>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    F: FnMut(Message),
{
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let event = tokio::select! {
            line = lines.next_line() => Event::Line(line),
            msg = next_outbound(outbound) => Event::Outbound(msg),
            _ = shutdown.changed() => Event::Shutdown,
        };

        match event {
            Event::Line(Ok(Some(line))) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Message::from_frame(&line) {
                    Ok(message) => handler(message),
                    Err(e) => warn!(%addr, error = %e, "[link-client] dropping malformed message"),
                }
            }
            Event::Line(Ok(None)) => return SessionEnd::Closed,
            Event::Line(Err(e)) => {
                debug!(%addr, error = %e, "[link-client] read failed");
                return SessionEnd::Closed;
            }
            Event::Outbound(Some(message)) => {
                if let Err(e) = write_message(&mut writer, &message).await {
                    warn!(%addr, error = %e, "[link-client] send failed");
                    return SessionEnd::Closed;
                }
            }
            // Every LinkSender is gone, keep reading
            Event::Outbound(None) => *outbound = None,
            Event::Shutdown => {
                flush_outbound(&mut writer, outbound, addr).await;
                return SessionEnd::Shutdown;
            }
        }
    }
}

/// Writes what is still queued (typically a final heartbeat) before closing
async fn flush_outbound(writer: &mut OwnedWriteHalf, outbound: &mut Option<mpsc::Receiver<Message>>, addr: &str) {
    let Some(rx) = outbound else {
        return;
    };
    while let Ok(message) = rx.try_recv() {
        if let Err(e) = write_message(writer, &message).await {
            debug!(%addr, error = %e, "[link-client] flush on shutdown failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn next_outbound(outbound: &mut Option<mpsc::Receiver<Message>>) -> Option<Message> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_message(writer: &mut OwnedWriteHalf, message: &Message) -> Result<(), LinkError> {
    let mut frame = message.to_frame()?;
    frame.push('\n');
    writer.write_all(frame.as_bytes()).await?;
    Ok(())
}
