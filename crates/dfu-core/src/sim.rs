//! Scripted host and earbud pair for running whole upgrades in memory.
//!
//! [`HostDriver`] plays the phone side of the protocol against a
//! [`DfuSession`]. [`run_single`] drives one device through reboots;
//! [`DevicePair`] also carries the peer link between a primary and a
//! secondary.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::events::DfuObserver;
use crate::partition::PartitionIo;
use crate::protocol::*;
use crate::session::{DfuSession, PeerLinkRequest};
use crate::sm::AppIndication;
use crate::store::{KeyStore, ResumePoint};

/// Upper bound on loop iterations before a run is declared stuck.
const MAX_STEPS: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostOptions {
    pub upgrade_id: u32,
    /// Largest DATA payload the host sends.
    pub chunk_size: usize,
    /// Drop the connection once this many file bytes have gone out.
    pub interrupt_at: Option<u64>,
    pub need_data_cfm: bool,
    pub request_multiple_blocks: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            upgrade_id: 0x0100_0001,
            chunk_size: PEER_MAX_DATA_PACKET,
            interrupt_at: None,
            need_data_cfm: false,
            request_multiple_blocks: false,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOutcome {
    Complete,
    Aborted,
    Failed(UpgradeStatus),
    /// The host stopped sending at the configured byte count.
    Interrupted { sent: u64 },
    /// Nothing left to do and nothing scheduled.
    Stalled,
}

/// The host side of the protocol, reacting to each device response.
#[derive(Debug, Clone)]
pub struct HostDriver {
    file: Vec<u8>,
    options: HostOptions,
    resume_point: ResumePoint,
    position: usize,
    outbox: VecDeque<HostMessage>,
    /// Message to resend once the device clock reaches the deadline.
    retry: Option<(u64, HostMessage)>,
    sent: u64,
    outcome: Option<HostOutcome>,
    failed: Option<UpgradeStatus>,
    received: Vec<HostResponse>,
}

impl HostDriver {
    pub fn new(file: Vec<u8>, options: HostOptions) -> Self {
        Self {
            file,
            options,
            resume_point: ResumePoint::Start,
            position: 0,
            outbox: VecDeque::new(),
            retry: None,
            sent: 0,
            outcome: None,
            failed: None,
            received: Vec::new(),
        }
    }

    pub fn outcome(&self) -> Option<HostOutcome> {
        self.outcome
    }

    /// File bytes sent over every connection so far.
    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    /// Every response the host has seen, in order.
    pub fn responses(&self) -> &[HostResponse] {
        &self.received
    }

    /// Open the transport and start a fresh conversation.
    pub fn connect<F: PartitionIo, K: KeyStore, O: DfuObserver>(&mut self, session: &mut DfuSession<F, K, O>) {
        debug!(upgrade_id = self.options.upgrade_id, "Host connecting");
        self.outbox.clear();
        self.retry = None;
        self.outcome = None;
        session.transport_connect(self.options.need_data_cfm, self.options.request_multiple_blocks);
        self.outbox.push_back(HostMessage::SyncReq {
            upgrade_id: self.options.upgrade_id,
        });
    }

    /// Carry on after an interruption without counting it again.
    pub fn clear_interrupt(&mut self) {
        self.options.interrupt_at = None;
    }

    /// Queue a message outside the scripted flow, e.g. an abort.
    pub fn queue(&mut self, msg: HostMessage) {
        self.outbox.push_back(msg);
    }

    /// Device clock time at which the pending retry is due.
    pub fn retry_due(&self) -> Option<u64> {
        self.retry.as_ref().map(|(due, _)| *due)
    }

    /// Send what is queued and react to what comes back. Returns false when
    /// nothing moved.
    pub fn pump<F: PartitionIo, K: KeyStore, O: DfuObserver>(&mut self, session: &mut DfuSession<F, K, O>) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        if self.retry_due().is_some_and(|due| due <= session.now()) {
            if let Some((_, msg)) = self.retry.take() {
                self.outbox.push_back(msg);
            }
        }

        let mut progressed = self.flush(session);
        if self.outcome.is_some() {
            return progressed;
        }
        session.run_until_idle();
        for response in session.take_host_responses() {
            progressed = true;
            self.react(response, session.now());
        }

        if let Some(status) = self.failed.take() {
            // Acknowledge the error before giving up.
            self.flush(session);
            session.run_until_idle();
            self.received.extend(session.take_host_responses());
            self.outcome = Some(HostOutcome::Failed(status));
        }
        progressed
    }

    /// Hand queued messages to the transport until it refuses one.
    fn flush<F: PartitionIo, K: KeyStore, O: DfuObserver>(&mut self, session: &mut DfuSession<F, K, O>) -> bool {
        let mut progressed = false;
        while let Some(msg) = self.outbox.pop_front() {
            let data_len = match &msg {
                HostMessage::Data { bytes, .. } => Some(bytes.len() as u64),
                _ => None,
            };
            if data_len.is_some() && self.options.interrupt_at.is_some_and(|at| self.sent >= at) {
                info!(sent = self.sent, "Host dropping the connection");
                self.outbox.clear();
                self.outcome = Some(HostOutcome::Interrupted { sent: self.sent });
                session.transport_disconnect();
                return true;
            }
            if !session.process_data_request(&msg.encode()) {
                self.outbox.push_front(msg);
                break;
            }
            self.sent += data_len.unwrap_or_default();
            progressed = true;
        }
        progressed
    }

    fn react(&mut self, response: HostResponse, now: u64) {
        debug!(msg = response.name(), "Host received");
        self.received.push(response.clone());
        match response {
            HostResponse::SyncCfm { resume_point, .. } => {
                self.resume_point = resume_point;
                self.outbox.push_back(HostMessage::StartReq);
            }
            HostResponse::StartCfm { status, .. } if u16::from(status) != UpgradeStatus::Success.code() => {
                warn!(status, "Device refused START_REQ");
                self.outcome = Some(HostOutcome::Failed(
                    UpgradeStatus::try_from(u16::from(status)).unwrap_or(UpgradeStatus::UpdateFailed),
                ));
            }
            HostResponse::StartCfm { .. } => match self.resume_point {
                ResumePoint::Start => {
                    self.position = 0;
                    self.outbox.push_back(HostMessage::StartDataReq);
                }
                ResumePoint::PreValidate => self.outbox.push_back(HostMessage::IsValidationDoneReq),
                ResumePoint::PostReboot => self.outbox.push_back(HostMessage::SyncAfterRebootReq),
                point => debug!(resume_point = %point, "Waiting for the device"),
            },
            HostResponse::DataBytesReq { count, offset } => self.send_data(count, offset),
            HostResponse::IsValidationDoneCfm { backoff_ms } => {
                self.retry = Some((now + u64::from(backoff_ms), HostMessage::IsValidationDoneReq));
            }
            HostResponse::TransferCompleteInd => self.outbox.push_back(HostMessage::TransferCompleteRes {
                action: Action::Continue,
            }),
            HostResponse::InProgressInd => self.outbox.push_back(HostMessage::InProgressRes {
                action: Action::Continue,
            }),
            HostResponse::CommitReq => self.outbox.push_back(HostMessage::CommitCfm {
                action: Action::Continue,
            }),
            HostResponse::CompleteInd => self.outcome = Some(HostOutcome::Complete),
            HostResponse::AbortCfm => self.outcome = Some(HostOutcome::Aborted),
            HostResponse::ErrorWarnInd { code } => {
                let status = UpgradeStatus::try_from(code).unwrap_or(UpgradeStatus::UpdateFailed);
                warn!(code, "Device reported {}", status);
                self.outbox.clear();
                self.retry = None;
                self.outbox.push_back(HostMessage::ErrorWarnRes { code });
                // The device floods its key store and reboots; the host just reconnects.
                if status != UpgradeStatus::PartitionCloseFailedPsSpace {
                    self.failed = Some(status);
                }
            }
            HostResponse::VersionCfm { .. } | HostResponse::VariantCfm { .. } => {}
        }
    }

    /// `offset` skips forward from the current position.
    fn send_data(&mut self, count: u32, offset: u32) {
        let len = self.file.len();
        let start = (self.position + offset as usize).min(len);
        let end = (start + count as usize).min(len);
        if start == end {
            self.outbox.push_back(HostMessage::Data {
                last_packet: true,
                bytes: Vec::new(),
            });
        }
        for chunk_start in (start..end).step_by(self.options.chunk_size.max(1)) {
            let chunk_end = (chunk_start + self.options.chunk_size.max(1)).min(end);
            self.outbox.push_back(HostMessage::Data {
                last_packet: chunk_end == len,
                bytes: self.file[chunk_start..chunk_end].to_vec(),
            });
        }
        self.position = end;
        if end == len {
            self.outbox.push_back(HostMessage::IsValidationDoneReq);
        }
    }
}

/// Answer the application questions the engine asks; returns what it asked.
fn answer_application<F: PartitionIo, K: KeyStore, O: DfuObserver>(
    session: &mut DfuSession<F, K, O>,
) -> Vec<AppIndication> {
    let indications = session.take_indications();
    for indication in &indications {
        match indication {
            AppIndication::ApplyInd => session.apply_response(0),
            AppIndication::BlockingInd => session.blocking_response(0),
            _ => {}
        }
    }
    indications
}

/// Drive one device until the host finishes. Reboots are carried out as
/// they are requested, and the host reconnects after each.
pub fn run_single<F: PartitionIo, K: KeyStore, O: DfuObserver>(
    mut session: DfuSession<F, K, O>,
    host: &mut HostDriver,
) -> (DfuSession<F, K, O>, HostOutcome) {
    for _ in 0..MAX_STEPS {
        if session.is_reboot_pending() {
            session = session.reboot();
            host.connect(&mut session);
            continue;
        }
        let mut progressed = host.pump(&mut session);
        if let Some(outcome) = host.outcome() {
            return (session, outcome);
        }
        progressed |= !answer_application(&mut session).is_empty();
        if progressed || session.is_reboot_pending() {
            continue;
        }

        let retry = host.retry_due().map(|due| due.saturating_sub(session.now()));
        match [session.next_timer_in(), retry].into_iter().flatten().min() {
            Some(wait) => session.advance(wait.max(1)),
            None => return (session, HostOutcome::Stalled),
        }
    }
    warn!("Simulation did not settle");
    (session, HostOutcome::Stalled)
}

/// A primary and a secondary joined by a peer link.
pub struct DevicePair<F: PartitionIo, K: KeyStore, O: DfuObserver> {
    pub primary: DfuSession<F, K, O>,
    pub secondary: DfuSession<F, K, O>,
    link_up: bool,
}

impl<F: PartitionIo, K: KeyStore, O: DfuObserver> DevicePair<F, K, O> {
    /// Takes two initialised sessions and fixes their roles.
    pub fn new(mut primary: DfuSession<F, K, O>, mut secondary: DfuSession<F, K, O>) -> Self {
        primary.set_role(true);
        secondary.set_role(false);
        Self {
            primary,
            secondary,
            link_up: false,
        }
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    /// Carry link requests and frames across. Returns false when idle.
    fn shuttle(&mut self) -> bool {
        let mut moved = false;
        for request in self.primary.take_peer_link_requests() {
            moved = true;
            match request {
                PeerLinkRequest::Connect => {
                    debug!("Peer link up");
                    self.link_up = true;
                    self.secondary.peer_link_connected(true);
                    self.primary.peer_link_connected(true);
                }
                PeerLinkRequest::Disconnect => {
                    debug!("Peer link down");
                    self.link_up = false;
                    self.secondary.peer_link_disconnected();
                    self.primary.peer_link_disconnected();
                }
            }
        }
        for frame in self.primary.take_peer_output() {
            moved = true;
            self.secondary.peer_link_data(&frame);
        }
        for frame in self.secondary.take_peer_output() {
            moved = true;
            self.primary.peer_link_data(&frame);
        }
        moved
    }

    /// Run the host against the primary until it finishes.
    pub fn run(mut self, host: &mut HostDriver) -> (Self, HostOutcome) {
        for _ in 0..MAX_STEPS {
            if self.secondary.is_reboot_pending() {
                info!("Secondary rebooting");
                self.secondary = self.secondary.reboot();
                self.link_up = false;
                self.primary.peer_link_disconnected();
                continue;
            }
            if self.primary.is_reboot_pending() {
                info!("Primary rebooting");
                self.primary = self.primary.reboot();
                self.link_up = false;
                self.secondary.peer_link_disconnected();
                host.connect(&mut self.primary);
                continue;
            }

            let mut progressed = host.pump(&mut self.primary);
            if let Some(outcome) = host.outcome() {
                return (self, outcome);
            }
            progressed |= self.shuttle();
            progressed |= !answer_application(&mut self.primary).is_empty();
            progressed |= !answer_application(&mut self.secondary).is_empty();
            if progressed || self.primary.is_reboot_pending() || self.secondary.is_reboot_pending() {
                continue;
            }

            let retry = host.retry_due().map(|due| due.saturating_sub(self.primary.now()));
            let wait = [self.primary.next_timer_in(), self.secondary.next_timer_in(), retry]
                .into_iter()
                .flatten()
                .min();
            match wait {
                Some(wait) => {
                    let wait = wait.max(1);
                    self.primary.advance(wait);
                    self.secondary.advance(wait);
                }
                None => return (self, HostOutcome::Stalled),
            }
        }
        warn!("Simulation did not settle");
        (self, HostOutcome::Stalled)
    }
}
