use super::IpcError;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::trace;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Default, Clone)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rejected_frames: u64,
    pub last_activity: Option<Instant>,
}

/// One side of a duplex frame channel. Frames are serialized JSON strings;
/// nothing else crosses between the two sides.
pub struct ChannelEndpoint {
    sender: FrameSender,
    receiver: FrameReceiver,
}

#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<String>,
    stats: Arc<RwLock<ChannelStats>>,
    max_frame_bytes: usize,
}

pub struct FrameReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    stats: Arc<RwLock<ChannelStats>>,
}

pub struct IpcChannel;

impl IpcChannel {
    /// Creates two connected endpoints sharing one set of statistics.
    pub fn pair(max_frame_bytes: usize) -> (ChannelEndpoint, ChannelEndpoint) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let stats = Arc::new(RwLock::new(ChannelStats::default()));

        let a = ChannelEndpoint {
            sender: FrameSender {
                tx: tx_a,
                stats: Arc::clone(&stats),
                max_frame_bytes,
            },
            receiver: FrameReceiver {
                rx: rx_b,
                stats: Arc::clone(&stats),
            },
        };
        let b = ChannelEndpoint {
            sender: FrameSender {
                tx: tx_b,
                stats: Arc::clone(&stats),
                max_frame_bytes,
            },
            receiver: FrameReceiver {
                rx: rx_a,
                stats,
            },
        };
        (a, b)
    }
}

impl ChannelEndpoint {
    pub fn send(&self, frame: String) -> Result<(), IpcError> {
        self.sender.send(frame)
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn stats(&self) -> ChannelStats {
        self.sender.stats.read().clone()
    }

    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }
}

impl FrameSender {
    pub fn send(&self, frame: String) -> Result<(), IpcError> {
        let size = frame.len();
        if size > self.max_frame_bytes {
            self.stats.write().rejected_frames += 1;
            return Err(IpcError::FrameTooLarge {
                size,
                limit: self.max_frame_bytes,
            });
        }

        self.tx.send(frame).map_err(|_| IpcError::ChannelClosed)?;

        let mut stats = self.stats.write();
        stats.frames_sent += 1;
        stats.bytes_sent += size as u64;
        stats.last_activity = Some(Instant::now());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl FrameReceiver {
    pub async fn recv(&mut self) -> Option<String> {
        let frame = self.rx.recv().await?;
        trace!(bytes = frame.len(), "frame received");

        let mut stats = self.stats.write();
        stats.frames_received += 1;
        stats.bytes_received += frame.len() as u64;
        stats.last_activity = Some(Instant::now());
        Some(frame)
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}
