//! Framed transport of one replication session
//!
//! Wraps any ordered byte stream with the frame reader/writer and the
//! heartbeat monitor, and multiplexes inbound frames, locally queued live
//! messages, heartbeat deadlines and node shutdown into a single event
//! stream for the session driver.
//!
//! Writes are guarded too: while a frame is being written the reader keeps
//! draining the peer, and shutdown or the receive timeout abort the write.
//! A peer that stops reading therefore cannot wedge a session.

use super::config::ReplicationConfig;
use super::frame::{FrameReader, FrameWriter};
use super::heartbeat::{HeartbeatDecision, HeartbeatMonitor};
use super::message::Message;
use super::types::{ReplicationError, ReplicationResult};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace};

#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// A message arrived from the peer
    Inbound(Message),
    /// A locally produced live message is ready to be sent
    Live(Message),
    /// The peer ended the stream between frames
    PeerClosed,
    /// The node is shutting down
    Shutdown,
}

pub(crate) struct SessionIo<T> {
    reader: FrameReader<ReadHalf<T>>,
    writer: FrameWriter<WriteHalf<T>>,
    monitor: HeartbeatMonitor,
    shutdown: watch::Receiver<bool>,
    /// Messages read while a write was in flight, in arrival order
    inbound: VecDeque<Message>,
    peer_closed: bool,
}

impl<T: AsyncRead + AsyncWrite> SessionIo<T> {
    pub(crate) fn new(
        transport: T,
        config: &ReplicationConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        Self {
            reader: FrameReader::new(read_half, config.max_frame_bytes),
            writer: FrameWriter::new(write_half, config.max_frame_bytes),
            monitor: HeartbeatMonitor::new(
                config.heartbeat_interval(),
                config.heartbeat_timeout(),
                Instant::now(),
            ),
            shutdown,
            inbound: VecDeque::new(),
            peer_closed: false,
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Write one message
    ///
    /// Fails with [`ReplicationError::ShuttingDown`] if the node stops and
    /// with [`ReplicationError::HeartbeatTimeout`] if the peer goes quiet
    /// before the frame is out.
    pub(crate) async fn send(&mut self, msg: &Message) -> ReplicationResult<()> {
        if matches!(msg, Message::Heartbeat) {
            trace!("-> {}", msg);
        } else {
            debug!("-> {}", msg);
        }

        let write = self.writer.write_message(msg);
        tokio::pin!(write);

        loop {
            let timeout_at = self.monitor.timeout_deadline();

            tokio::select! {
                biased;

                _ = stopped(&mut self.shutdown) => return Err(ReplicationError::ShuttingDown),

                read = self.reader.read_message(), if !self.peer_closed => match read? {
                    Some(inbound) => {
                        self.monitor.note_recv(Instant::now());
                        log_inbound(&inbound);
                        self.inbound.push_back(inbound);
                    }
                    None => self.peer_closed = true,
                },

                written = &mut write => {
                    written?;
                    break;
                }

                _ = sleep_until(timeout_at) => {
                    return Err(ReplicationError::HeartbeatTimeout(self.monitor.timeout()));
                }
            }
        }

        self.monitor.note_send(Instant::now());
        Ok(())
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.reader.bytes_read()
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.writer.bytes_written()
    }

    /// Wait for the next event, sending heartbeats on schedule
    ///
    /// Inbound frames take priority over the receive deadline so that
    /// traffic queued while the driver was busy still counts as liveness.
    pub(crate) async fn next_event(
        &mut self,
        live: &mut Option<mpsc::UnboundedReceiver<Message>>,
    ) -> ReplicationResult<SessionEvent> {
        loop {
            if let Some(msg) = self.inbound.pop_front() {
                return Ok(SessionEvent::Inbound(msg));
            }
            if self.peer_closed {
                return Ok(SessionEvent::PeerClosed);
            }
            // Checked before the select so a busy inbound stream cannot starve it
            if self.monitor.heartbeat_due(Instant::now()) {
                self.send(&Message::Heartbeat).await?;
                continue;
            }

            let deadline = self.monitor.next_deadline();

            tokio::select! {
                biased;

                _ = stopped(&mut self.shutdown) => return Ok(SessionEvent::Shutdown),

                read = self.reader.read_message() => {
                    return match read? {
                        Some(msg) => {
                            self.monitor.note_recv(Instant::now());
                            log_inbound(&msg);
                            Ok(SessionEvent::Inbound(msg))
                        }
                        None => Ok(SessionEvent::PeerClosed),
                    };
                }

                queued = recv_live(live) => match queued {
                    Some(msg) => return Ok(SessionEvent::Live(msg)),
                    // Producer side went away; stop polling it
                    None => *live = None,
                },

                _ = sleep_until(deadline) => {
                    if let Some(HeartbeatDecision::TimedOut) = self.monitor.poll(Instant::now()) {
                        return Err(ReplicationError::HeartbeatTimeout(self.monitor.timeout()));
                    }
                }
            }
        }
    }

    /// Close the write side; the peer observes end of stream
    pub(crate) async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("Transport shutdown failed: {}", e);
        }
    }
}

fn log_inbound(msg: &Message) {
    if matches!(msg, Message::Heartbeat) {
        trace!("<- {}", msg);
    } else {
        debug!("<- {}", msg);
    }
}

/// Resolves once the node is stopping (or its shutdown handle is gone)
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn recv_live(live: &mut Option<mpsc::UnboundedReceiver<Message>>) -> Option<Message> {
    match live {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
