pub mod frame;
pub mod transport;

use std::{collections::BTreeMap, fmt, io, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task, time,
};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::error::LinkError;

use self::{
    frame::{Frame, RelayFrame},
    transport::{Connector, Transport},
};

/// Commands queued for a board beyond this make the caller wait for space.
const QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Handle: an open connection
// ---------------------------------------------------------------------------

/// An opened serial device. Owned by exactly one link worker.
pub struct Handle {
    transport: Box<dyn Transport>,
}

pub fn connect(connector: &dyn Connector, path: &str) -> Result<Handle, LinkError> {
    let transport = connector.open(path).map_err(|e| LinkError::Connection {
        path: path.to_owned(),
        reason: e.to_string(),
    })?;
    Ok(Handle { transport })
}

impl Handle {
    pub fn send(&mut self, frame: &Frame) -> Result<(), LinkError> {
        // Anything still buffered belongs to an earlier exchange.
        self.transport.discard_input().map_err(link_down)?;
        self.transport.write_frame(frame).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => LinkError::Timeout,
            io::ErrorKind::Interrupted | io::ErrorKind::WriteZero => LinkError::Send(e.to_string()),
            _ => link_down(e),
        })
    }

    pub fn receive_ack(&mut self) -> Result<RelayFrame, LinkError> {
        let bytes = self.transport.read_frame().map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => LinkError::Timeout,
            _ => link_down(e),
        })?;

        RelayFrame::decode(&bytes).inspect_err(|_| {
            // Resynchronise on the next exchange rather than reading into a torn frame.
            let _ = self.transport.discard_input();
        })
    }

    /// Sends one command and waits for the matching acknowledgement.
    pub fn exchange(&mut self, command: RelayFrame) -> Result<RelayFrame, LinkError> {
        self.send(&command.encode())?;
        let ack = self.receive_ack()?;
        if ack.channel != command.channel {
            let _ = self.transport.discard_input();
            return Err(LinkError::Parse(format!(
                "ack for channel {} while waiting on channel {}",
                ack.channel, command.channel
            )));
        }
        Ok(ack)
    }
}

fn link_down(e: io::Error) -> LinkError {
    debug!(error = %e, "Serial I/O failed");
    LinkError::LinkDown
}

// ---------------------------------------------------------------------------
// SerialLink: cloneable front-end to one worker task
// ---------------------------------------------------------------------------

struct Request {
    command: RelayFrame,
    reply: oneshot::Sender<Result<RelayFrame, LinkError>>,
}

/// One microcontroller board behind one serial device.
///
/// A background task owns the device, serves commands in the order they were
/// issued and reconnects on a fixed interval after any I/O failure. While the
/// link is not connected, commands fail immediately with
/// [`LinkError::LinkDown`].
///
/// An idle link is checked every `keepalive_interval` by re-sending the last
/// frame of each channel, so an unplugged or reset board is noticed (and
/// restored) without waiting for the next real command.
#[derive(Clone)]
pub struct SerialLink {
    board_id: String,
    path: String,
    tx: mpsc::Sender<Request>,
    state: watch::Receiver<LinkState>,
}

impl SerialLink {
    /// Starts the worker for `path`. Must be called inside a tokio runtime.
    pub fn spawn(
        board_id: impl Into<String>,
        path: impl Into<String>,
        connector: Arc<dyn Connector>,
        reconnect_interval: Duration,
        keepalive_interval: Duration,
    ) -> Self {
        let board_id = board_id.into();
        let path = path.into();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (state_tx, state) = watch::channel(LinkState::Disconnected);

        let worker = Worker {
            board_id: board_id.clone(),
            path: path.clone(),
            connector,
            reconnect_interval,
            keepalive_interval,
            last_sent: BTreeMap::new(),
            rx,
            state: state_tx,
        };
        tokio::spawn(worker.run());

        Self {
            board_id,
            path,
            tx,
            state,
        }
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Sends `command` to the board and returns its acknowledgement.
    pub async fn command(&self, command: RelayFrame) -> Result<RelayFrame, LinkError> {
        if self.state() != LinkState::Connected {
            return Err(LinkError::LinkDown);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { command, reply })
            .await
            .map_err(|_| LinkError::LinkDown)?;
        rx.await.map_err(|_| LinkError::LinkDown)?
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    board_id: String,
    path: String,
    connector: Arc<dyn Connector>,
    reconnect_interval: Duration,
    keepalive_interval: Duration,
    /// Last command that reached each channel.
    last_sent: BTreeMap<u8, RelayFrame>,
    rx: mpsc::Receiver<Request>,
    state: watch::Sender<LinkState>,
}

impl Worker {
    /// Connect, serve until the link drops, back off, repeat. Exits once
    /// every `SerialLink` clone has been dropped.
    async fn run(mut self) {
        loop {
            if let Some(handle) = self.connect().await {
                if !self.serve(handle).await {
                    break;
                }
            }
            if !self.back_off().await {
                break;
            }
        }
        self.state.send_replace(LinkState::Disconnected);
        debug!(board_id = %self.board_id, "Serial link worker stopped");
    }

    async fn connect(&mut self) -> Option<Handle> {
        self.state.send_replace(LinkState::Connecting);

        let connector = Arc::clone(&self.connector);
        let path = self.path.clone();
        match task::spawn_blocking(move || connect(connector.as_ref(), &path)).await {
            Ok(Ok(handle)) => {
                self.state.send_replace(LinkState::Connected);
                info!(board_id = %self.board_id, path = %self.path, "Serial link connected");
                Some(handle)
            }
            Ok(Err(e)) => {
                self.state.send_replace(LinkState::Disconnected);
                warn!(board_id = %self.board_id, error = %e, "Serial link connect failed");
                None
            }
            Err(e) => {
                self.state.send_replace(LinkState::Disconnected);
                error!(board_id = %self.board_id, error = %e, "Serial connect task panicked");
                None
            }
        }
    }

    /// Serves commands until the link drops (`true`) or the channel closes (`false`).
    async fn serve(&mut self, mut handle: Handle) -> bool {
        loop {
            let request = match time::timeout(self.keepalive_interval, self.rx.recv()).await {
                Ok(Some(request)) => request,
                Ok(None) => return false,
                Err(_idle) => match self.keepalive(handle).await {
                    Some(h) => {
                        handle = h;
                        continue;
                    }
                    None => {
                        self.lost();
                        return true;
                    }
                },
            };
            let Request { command, reply } = request;

            let Some((h, result)) = self.exchange(handle, command).await else {
                self.lost();
                let _ = reply.send(Err(LinkError::LinkDown));
                return true;
            };
            handle = h;

            match result {
                Ok(_) => {
                    self.last_sent.insert(command.channel, command);
                }
                Err(LinkError::LinkDown) => {
                    // State first, so the caller never sees a failed command on a "connected" link.
                    self.lost();
                    let _ = reply.send(result);
                    return true;
                }
                Err(_) => {}
            }
            let _ = reply.send(result);
        }
    }

    /// Re-sends the last frame of every channel. `None` once the board is
    /// gone or stops answering.
    async fn keepalive(&mut self, mut handle: Handle) -> Option<Handle> {
        let frames: Vec<RelayFrame> = self.last_sent.values().copied().collect();
        for command in frames {
            let (h, result) = self.exchange(handle, command).await?;
            handle = h;
            match result {
                Ok(ack) if ack.on != command.on => {
                    warn!(board_id = %self.board_id, channel = command.channel, on = ack.on, "Keepalive ack disagrees with last command");
                }
                Ok(_) => {}
                Err(LinkError::LinkDown | LinkError::Timeout) => return None,
                Err(e) => {
                    debug!(board_id = %self.board_id, channel = command.channel, error = %e, "Keepalive exchange failed");
                }
            }
        }
        Some(handle)
    }

    /// One blocking exchange; `None` if the I/O task panicked.
    async fn exchange(
        &self,
        mut handle: Handle,
        command: RelayFrame,
    ) -> Option<(Handle, Result<RelayFrame, LinkError>)> {
        let joined = task::spawn_blocking(move || {
            let result = handle.exchange(command);
            (handle, result)
        })
        .await;

        joined
            .inspect_err(|e| {
                error!(board_id = %self.board_id, error = %e, "Serial exchange task panicked");
            })
            .ok()
    }

    fn lost(&self) {
        self.state.send_replace(LinkState::Disconnected);
        warn!(board_id = %self.board_id, path = %self.path, "Serial link lost");
    }

    /// Waits out the reconnect interval, failing whatever arrives meanwhile.
    async fn back_off(&mut self) -> bool {
        let sleep = time::sleep(self.reconnect_interval);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                request = self.rx.recv() => match request {
                    Some(request) => {
                        let _ = request.reply.send(Err(LinkError::LinkDown));
                    }
                    None => return false,
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
