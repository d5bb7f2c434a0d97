//! Response delivery.
//!
//! The upgrade machine answers whoever acts as its host. On a primary that
//! is the host transport; on a secondary it is the peer link back to the
//! primary's relay. Both are [`ResponseSink`]s, picked by device role.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::protocol::*;
use crate::sm::DeviceRole;
use crate::store::ResumePoint;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("{0} link is not connected")]
    Disconnected(&'static str),

    #[error("{link} queue full ({capacity} frames)")]
    QueueFull { link: &'static str, capacity: usize },
}

/// Outbound channel for device responses.
pub trait ResponseSink: Send {
    /// Deliver one response.
    fn send(&mut self, response: &HostResponse) -> Result<(), SinkError>;

    /// Name of the link, for logging.
    fn link(&self) -> &'static str;

    fn send_short(&mut self, short: ShortResponse) -> Result<(), SinkError> {
        self.send(&short.into())
    }

    fn send_sync_cfm(&mut self, resume_point: ResumePoint, upgrade_id: u32) -> Result<(), SinkError> {
        self.send(&HostResponse::SyncCfm {
            resume_point,
            upgrade_id,
            protocol_version: PROTOCOL_VERSION,
        })
    }

    fn send_start_cfm(&mut self, status: UpgradeStatus) -> Result<(), SinkError> {
        self.send(&HostResponse::StartCfm {
            status: status.code() as u8,
            battery_level: START_CFM_BATTERY_LEVEL,
        })
    }

    fn send_bytes_req(&mut self, count: u32, offset: u32) -> Result<(), SinkError> {
        self.send(&HostResponse::DataBytesReq { count, offset })
    }

    fn send_error_ind(&mut self, status: UpgradeStatus) -> Result<(), SinkError> {
        self.send(&HostResponse::ErrorWarnInd { code: status.code() })
    }

    fn send_is_valid_done_cfm(&mut self, backoff_ms: u16) -> Result<(), SinkError> {
        self.send(&HostResponse::IsValidationDoneCfm { backoff_ms })
    }

    fn send_version_cfm(&mut self, major: u16, minor: u16, config: u16) -> Result<(), SinkError> {
        self.send(&HostResponse::VersionCfm { major, minor, config })
    }

    fn send_variant_cfm(&mut self, variant: [u8; VARIANT_SIZE]) -> Result<(), SinkError> {
        self.send(&HostResponse::VariantCfm { variant })
    }
}

// ============================================================================
// Frame queues
// ============================================================================

/// Shared FIFO of encoded frames, drained by whoever owns the link.
#[derive(Debug, Clone, Default)]
pub struct FrameQueue {
    frames: Arc<Mutex<VecDeque<Vec<u8>>>>,
    connected: Arc<Mutex<bool>>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: Vec<u8>) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(frame);
    }

    /// Take every queued frame in order.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner) = connected;
    }
}

fn push_frame(queue: &FrameQueue, link: &'static str, frame: Vec<u8>) -> Result<(), SinkError> {
    if !queue.is_connected() {
        return Err(SinkError::Disconnected(link));
    }
    if queue.len() >= MAX_QUEUED_FRAMES {
        return Err(SinkError::QueueFull {
            link,
            capacity: MAX_QUEUED_FRAMES,
        });
    }
    tracing::trace!(link, len = frame.len(), "Frame queued");
    queue.push(frame);
    Ok(())
}

/// Frames left undrained before a sink refuses more.
pub const MAX_QUEUED_FRAMES: usize = 1024;

/// Responses for the host transport.
#[derive(Debug, Clone)]
pub struct HostSink {
    queue: FrameQueue,
}

impl HostSink {
    pub fn new(queue: FrameQueue) -> Self {
        Self { queue }
    }
}

impl ResponseSink for HostSink {
    fn send(&mut self, response: &HostResponse) -> Result<(), SinkError> {
        push_frame(&self.queue, self.link(), response.encode())
    }

    fn link(&self) -> &'static str {
        "host"
    }
}

/// Responses for the peer link; a secondary answers the primary's relay here.
#[derive(Debug, Clone)]
pub struct PeerSink {
    queue: FrameQueue,
}

impl PeerSink {
    pub fn new(queue: FrameQueue) -> Self {
        Self { queue }
    }
}

impl ResponseSink for PeerSink {
    fn send(&mut self, response: &HostResponse) -> Result<(), SinkError> {
        push_frame(&self.queue, self.link(), response.encode())
    }

    fn link(&self) -> &'static str {
        "peer"
    }
}

/// Sink answering for `role`: the host transport on a primary, the peer link on a secondary.
pub fn sink_for_role(role: DeviceRole, host: &FrameQueue, peer: &FrameQueue) -> Box<dyn ResponseSink> {
    match role {
        DeviceRole::Primary => Box::new(HostSink::new(host.clone())),
        DeviceRole::Secondary => Box::new(PeerSink::new(peer.clone())),
    }
}

/// Sink that keeps decoded responses, for tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<HostResponse>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<HostResponse> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn take(&self) -> Vec<HostResponse> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Make every send fail as if the link dropped.
    pub fn set_disconnected(&self, disconnected: bool) {
        *self.fail.lock().unwrap_or_else(PoisonError::into_inner) = disconnected;
    }
}

impl ResponseSink for RecordingSink {
    fn send(&mut self, response: &HostResponse) -> Result<(), SinkError> {
        if *self.fail.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(SinkError::Disconnected("recording"));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(response.clone());
        Ok(())
    }

    fn link(&self) -> &'static str {
        "recording"
    }
}
