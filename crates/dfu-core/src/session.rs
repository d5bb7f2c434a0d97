//! DFU Session - event loop around the upgrade machine and the peer relay.
//!
//! The session owns everything volatile on one earbud: the upgrade machine,
//! the relay, a work queue, a virtual clock and the outbound links. Inputs
//! arrive through the application, transport and peer-link calls below;
//! each is processed to completion before the next one, and outputs are
//! collected for the caller to drain.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::events::{DfuEvent, DfuObserver, Link, PacketDirection, TracingObserver};
use crate::file::{variant_bytes, Version};
use crate::partition::{MemoryPartitions, PartitionIo, PartitionTable, PartitionType, UpgradablePartition};
use crate::peer::{self, DfuInfo, PeerRelay, RelayEffect, RelayEnv, RelayInput, RelaySettings, RelayState};
use crate::protocol::*;
use crate::sink::{sink_for_role, FrameQueue, ResponseSink, MAX_QUEUED_FRAMES};
use crate::sm::{
    self, AppIndication, DeviceRole, Effect, Permission, PermissionError, UpgradeContext, UpgradeEvent,
    UpgradeSettings, UpgradeState,
};
use crate::store::{KeyStore, ResumePoint, ResumeStore, StoreError};
use crate::timer::TimerQueue;

// ============================================================================
// Configuration
// ============================================================================

/// Peer relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Relay the upgrade to the peer earbud.
    pub enabled: bool,
    pub start_retry_limit: u32,
    pub start_retry_delay_ms: u32,
    /// How often the upgrade machine re-checks the relay before erasing.
    pub poll_interval_ms: u32,
    pub max_data_packet: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_retry_limit: PEER_START_RETRY_LIMIT,
            start_retry_delay_ms: PEER_START_RETRY_DELAY_MS,
            poll_interval_ms: PEER_POLL_INTERVAL_MS,
            max_data_packet: PEER_MAX_DATA_PACKET,
        }
    }
}

/// One physical partition of the simulated flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashPartition {
    pub kind: PartitionType,
    pub size: u32,
}

/// Configuration for a DFU session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DfuConfig {
    /// Device variant matched against upgrade file headers.
    pub variant: String,
    pub factory_config_version: u16,
    pub permission: Permission,
    pub reconnection_timeout_ms: u32,
    pub validation_backoff_ms: u16,
    pub complete_status_delay_ms: u32,
    /// Host messages accepted before flow is turned off.
    pub flow_control_window: usize,
    pub request_multiple_blocks: bool,
    /// Confirm every accepted data request to the transport.
    pub need_data_cfm: bool,
    pub factory_version: Version,
    pub peer: PeerConfig,
    /// Logical partitions, indexed by logical number.
    pub partitions: PartitionTable,
    /// Physical layout of the in-memory flash.
    pub flash: Vec<FlashPartition>,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            variant: "EARBUD".to_string(),
            factory_config_version: 1,
            permission: Permission::AutoApprove,
            reconnection_timeout_ms: DEFAULT_RECONNECTION_TIMEOUT_MS,
            validation_backoff_ms: VALIDATION_BACKOFF_MS,
            complete_status_delay_ms: COMPLETE_STATUS_DELAY_MS,
            flow_control_window: MAX_PENDING_DATA_REQ,
            request_multiple_blocks: false,
            need_data_cfm: false,
            factory_version: Version::new(1, 0),
            peer: PeerConfig::default(),
            partitions: PartitionTable::new(vec![
                UpgradablePartition::double(0, 1, PartitionType::Exe),
                UpgradablePartition::double(2, 3, PartitionType::Data),
            ]),
            flash: vec![
                FlashPartition {
                    kind: PartitionType::Exe,
                    size: 64 * 1024,
                },
                FlashPartition {
                    kind: PartitionType::Exe,
                    size: 64 * 1024,
                },
                FlashPartition {
                    kind: PartitionType::Data,
                    size: 16 * 1024,
                },
                FlashPartition {
                    kind: PartitionType::Data,
                    size: 16 * 1024,
                },
            ],
        }
    }
}

impl DfuConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: DfuConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn upgrade_settings(&self) -> UpgradeSettings {
        UpgradeSettings {
            reconnection_timeout_ms: self.reconnection_timeout_ms,
            validation_backoff_ms: self.validation_backoff_ms,
            complete_status_delay_ms: self.complete_status_delay_ms,
            peer_poll_interval_ms: self.peer.poll_interval_ms,
            peer_enabled: self.peer.enabled,
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            start_retry_limit: self.peer.start_retry_limit,
            start_retry_delay_ms: self.peer.start_retry_delay_ms,
            max_data_packet: self.peer.max_data_packet,
        }
    }

    /// Blank in-memory flash laid out as configured.
    pub fn memory_partitions(&self) -> MemoryPartitions {
        let layout: Vec<(PartitionType, u32)> = self.flash.iter().map(|p| (p.kind, p.size)).collect();
        MemoryPartitions::new(&layout)
    }
}

// ============================================================================
// Outputs
// ============================================================================

/// Messages for the host transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportNotice {
    ConnectCfm,
    /// A data request was accepted; carries its opcode.
    DataCfm { opcode: u8 },
    /// Data requests are accepted again after a refusal.
    FlowOn,
    DisconnectCfm,
}

/// What the relay asks of the peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLinkRequest {
    Connect,
    Disconnect,
}

#[derive(Debug)]
enum Work {
    Event(UpgradeEvent),
    /// Raw frame from the host transport; counts against the flow window.
    HostFrame(Vec<u8>),
    PeerFrame(Vec<u8>),
    Relay(RelayInput),
}

#[derive(Debug)]
enum Timed {
    Event(UpgradeEvent),
    Indication(AppIndication),
    Relay(RelayInput),
}

/// Outbound host traffic held back during a voice call.
#[derive(Debug)]
enum Held {
    Response(HostResponse),
    DataCfm(u8),
}

// ============================================================================
// Session
// ============================================================================

/// DFU Session - one earbud's upgrade engine.
pub struct DfuSession<F: PartitionIo, K: KeyStore, O: DfuObserver> {
    config: DfuConfig,
    ctx: UpgradeContext<F, K>,
    relay: PeerRelay,
    /// Follow-ups of the step being processed; run before new input.
    urgent: VecDeque<Work>,
    inbox: VecDeque<Work>,
    timers: TimerQueue<Timed>,
    host: FrameQueue,
    peer: FrameQueue,
    sink: Box<dyn ResponseSink>,
    observer: Arc<O>,
    indications: Vec<AppIndication>,
    notices: Vec<TransportNotice>,
    link_requests: Vec<PeerLinkRequest>,
    held: VecDeque<Held>,
    sco_active: bool,
    transport_connected: bool,
    need_data_cfm: bool,
    pending_data_req: usize,
    flow_off: bool,
    reboot_pending: bool,
    received: u64,
}

impl<F: PartitionIo, K: KeyStore> DfuSession<F, K, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: DfuConfig, flash: F, keys: K) -> Self {
        Self::with_observer(config, flash, keys, Arc::new(TracingObserver))
    }
}

impl<F: PartitionIo, K: KeyStore, O: DfuObserver> DfuSession<F, K, O> {
    /// Create a new session with a custom observer. Nothing runs until
    /// [`init`](Self::init).
    pub fn with_observer(config: DfuConfig, flash: F, keys: K, observer: Arc<O>) -> Self {
        let ctx = UpgradeContext::new(flash, keys, config.partitions.clone(), config.upgrade_settings());
        let host = FrameQueue::new();
        let peer = FrameQueue::new();
        let sink = sink_for_role(ctx.role, &host, &peer);
        Self {
            relay: PeerRelay::new(config.relay_settings()),
            config,
            ctx,
            urgent: VecDeque::new(),
            inbox: VecDeque::new(),
            timers: TimerQueue::new(),
            host,
            peer,
            sink,
            observer,
            indications: Vec::new(),
            notices: Vec::new(),
            link_requests: Vec::new(),
            held: VecDeque::new(),
            sco_active: false,
            transport_connected: false,
            need_data_cfm: false,
            pending_data_req: 0,
            flow_off: false,
            reboot_pending: false,
            received: 0,
        }
    }

    // ========================================================================
    // Application API
    // ========================================================================

    /// Start the engine: decide where to continue from the persisted record.
    pub fn init(&mut self, table: PartitionTable, permission: Permission, variant: &str, factory_version: Version) {
        self.config.partitions = table.clone();
        self.config.permission = permission;
        self.config.variant = variant.to_string();
        self.config.factory_version = factory_version;
        self.ctx.table = table;

        let before = self.ctx.state;
        let effects = self
            .ctx
            .init(
                permission,
                variant_bytes(variant),
                factory_version,
                self.config.factory_config_version,
            )
            .into_vec();
        self.sink = sink_for_role(self.ctx.role, &self.host, &self.peer);
        self.report_state(before, self.relay.state());
        self.apply(effects);

        if self.ctx.peer_supported() {
            let relay_before = self.relay.state();
            let effects = self.relay.restore(&self.ctx.store);
            self.ctx.peer = self.relay.status();
            self.apply_relay(effects);
            self.report_state(self.ctx.state, relay_before);
        }
        self.run_until_idle();
    }

    /// [`init`](Self::init) with the values from the configuration.
    pub fn init_from_config(&mut self) {
        let table = self.config.partitions.clone();
        let variant = self.config.variant.clone();
        self.init(table, self.config.permission, &variant, self.config.factory_version);
    }

    pub fn set_permission(&mut self, permission: Permission) -> Result<(), PermissionError> {
        self.ctx.set_permission(permission)?;
        self.config.permission = permission;
        Ok(())
    }

    /// Answer to `ApplyInd`: 0 reboots now, otherwise ask again after `postpone_ms`.
    pub fn apply_response(&mut self, postpone_ms: u32) {
        let effects = self.ctx.apply_response(postpone_ms).into_vec();
        self.apply(effects);
        self.run_until_idle();
    }

    /// Answer to `BlockingInd`: 0 erases now, otherwise ask again after `postpone_ms`.
    pub fn blocking_response(&mut self, postpone_ms: u32) {
        let effects = self.ctx.blocking_response(postpone_ms).into_vec();
        self.apply(effects);
        self.run_until_idle();
    }

    pub fn battery_state_changed(&mut self, low: bool) {
        info!(low, "Battery state changed");
        self.ctx.battery_low = low;
        if low {
            self.inbox.push_back(Work::Event(UpgradeEvent::BatteryLow));
        }
        self.run_until_idle();
    }

    /// Voice call started or ended. Host traffic waits while it lasts.
    pub fn set_sco_active(&mut self, active: bool) {
        debug!(active, "SCO state changed");
        self.sco_active = active;
        if self.ctx.peer_supported() {
            self.inbox.push_back(Work::Relay(RelayInput::Sco(active)));
        }
        if !active {
            self.flush_held();
        }
        self.run_until_idle();
    }

    /// Persist the earbud role and answer through the matching link.
    pub fn set_role(&mut self, primary: bool) {
        if let Err(e) = peer::set_role(&mut self.ctx.store, primary) {
            warn!(error = %e, "Role not saved");
        }
        self.ctx.role = if primary {
            DeviceRole::Primary
        } else {
            DeviceRole::Secondary
        };
        self.sink = sink_for_role(self.ctx.role, &self.host, &self.peer);
    }

    pub fn set_dfu_mode(&mut self, dfu_mode: bool) -> Result<(), StoreError> {
        peer::set_dfu_mode(&mut self.ctx.store, dfu_mode)
    }

    pub fn dfu_info(&self) -> DfuInfo {
        peer::dfu_info(&self.ctx.store)
    }

    // ========================================================================
    // Transport API
    // ========================================================================

    pub fn transport_connect(&mut self, need_data_cfm: bool, request_multiple_blocks: bool) {
        info!(need_data_cfm, request_multiple_blocks, "Host transport connected");
        self.transport_connected = true;
        self.need_data_cfm = need_data_cfm;
        self.ctx.request_multiple_blocks = request_multiple_blocks;
        self.host.set_connected(true);
        self.notices.push(TransportNotice::ConnectCfm);
    }

    /// Queue one host frame. Returns false when the transport must hold it
    /// and offer it again later: no transport, or the flow window is full.
    ///
    /// Frames are processed by [`run_until_idle`](Self::run_until_idle).
    pub fn process_data_request(&mut self, frame: &[u8]) -> bool {
        if !self.transport_connected {
            debug!("Data request with no transport");
            return false;
        }
        if self.pending_data_req >= self.config.flow_control_window {
            debug!(pending = self.pending_data_req, "Flow off");
            self.flow_off = true;
            return false;
        }
        self.pending_data_req += 1;
        self.inbox.push_back(Work::HostFrame(frame.to_vec()));

        if self.need_data_cfm {
            let opcode = frame.first().copied().unwrap_or_default();
            if self.sco_active {
                self.held.push_back(Held::DataCfm(opcode));
            } else {
                self.notices.push(TransportNotice::DataCfm { opcode });
            }
        }
        true
    }

    pub fn transport_disconnect(&mut self) {
        if !self.transport_connected {
            return;
        }
        info!(held = self.held.len(), "Host transport disconnected");
        self.transport_connected = false;
        self.host.set_connected(false);
        self.pending_data_req = 0;
        self.flow_off = false;
        self.held.clear();
        self.notices.push(TransportNotice::DisconnectCfm);
    }

    // ========================================================================
    // Peer link API
    // ========================================================================

    /// Result of a connection the relay asked for, or a secondary seeing
    /// its primary arrive.
    pub fn peer_link_connected(&mut self, ok: bool) {
        self.peer.set_connected(ok);
        if self.ctx.role == DeviceRole::Primary {
            self.inbox.push_back(Work::Relay(RelayInput::LinkConnected(ok)));
        }
        self.run_until_idle();
    }

    pub fn peer_link_disconnected(&mut self) {
        self.peer.set_connected(false);
        if self.ctx.role == DeviceRole::Primary {
            self.inbox.push_back(Work::Relay(RelayInput::LinkDisconnected));
        }
        self.run_until_idle();
    }

    /// One frame from the peer: host messages on a secondary, relay
    /// responses on a primary.
    pub fn peer_link_data(&mut self, frame: &[u8]) {
        self.inbox.push_back(Work::PeerFrame(frame.to_vec()));
        self.run_until_idle();
    }

    // ========================================================================
    // Clock and loop
    // ========================================================================

    /// Move the clock forward, firing every timer that falls due on the way.
    pub fn advance(&mut self, ms: u64) {
        let target = self.timers.now().saturating_add(ms);
        while !self.reboot_pending {
            let Some(due) = self.timers.next_due().filter(|due| *due <= target) else {
                break;
            };
            let fired = self.timers.advance(due.saturating_sub(self.timers.now()));
            self.fire(fired);
            self.run_until_idle();
        }
        let rest = target.saturating_sub(self.timers.now());
        let fired = self.timers.advance(rest);
        self.fire(fired);
        self.run_until_idle();
    }

    /// Process queued work and flash completions until nothing is left.
    /// Stops early once a reboot has been requested.
    pub fn run_until_idle(&mut self) {
        while !self.reboot_pending {
            let next = self.urgent.pop_front().or_else(|| self.inbox.pop_front());
            let work = match next {
                Some(work) => work,
                None => match self.ctx.flash.poll_event() {
                    Some(event) => Work::Event(event.into()),
                    None => {
                        let due = self.timers.pop_due();
                        if due.is_empty() {
                            break;
                        }
                        self.fire(due);
                        continue;
                    }
                },
            };
            self.step(work);
        }
    }

    /// Power-cycle the device: keep flash and key store, rebuild the rest.
    pub fn reboot(self) -> Self {
        info!(state = %self.ctx.state, "Rebooting");
        let Self {
            config,
            ctx,
            observer,
            ..
        } = self;
        let (mut flash, keys) = ctx.into_parts();
        flash.power_cycle();
        let mut session = Self::with_observer(config, flash, keys, observer);
        session.init_from_config();
        session
    }

    // ========================================================================
    // Outputs and inspection
    // ========================================================================

    /// Encoded frames for the host transport.
    pub fn take_host_output(&mut self) -> Vec<Vec<u8>> {
        self.host.drain()
    }

    /// Encoded frames for the peer link.
    pub fn take_peer_output(&mut self) -> Vec<Vec<u8>> {
        self.peer.drain()
    }

    /// Host frames decoded back into responses.
    pub fn take_host_responses(&mut self) -> Vec<HostResponse> {
        self.take_host_output()
            .iter()
            .filter_map(|frame| HostResponse::decode(frame).ok())
            .collect()
    }

    pub fn take_indications(&mut self) -> Vec<AppIndication> {
        std::mem::take(&mut self.indications)
    }

    pub fn take_transport_notices(&mut self) -> Vec<TransportNotice> {
        std::mem::take(&mut self.notices)
    }

    pub fn take_peer_link_requests(&mut self) -> Vec<PeerLinkRequest> {
        std::mem::take(&mut self.link_requests)
    }

    pub fn state(&self) -> UpgradeState {
        self.ctx.state
    }

    pub fn relay_state(&self) -> RelayState {
        self.relay.state()
    }

    pub fn resume_point(&self) -> ResumePoint {
        self.ctx.resume_point()
    }

    pub fn role(&self) -> DeviceRole {
        self.ctx.role
    }

    pub fn context(&self) -> &UpgradeContext<F, K> {
        &self.ctx
    }

    pub fn store(&self) -> &ResumeStore<K> {
        &self.ctx.store
    }

    pub fn flash(&self) -> &F {
        &self.ctx.flash
    }

    pub fn config(&self) -> &DfuConfig {
        &self.config
    }

    pub fn observer(&self) -> &Arc<O> {
        &self.observer
    }

    /// Virtual milliseconds since boot.
    pub fn now(&self) -> u64 {
        self.timers.now()
    }

    /// Milliseconds until the next timer fires.
    pub fn next_timer_in(&self) -> Option<u64> {
        self.timers
            .next_due()
            .map(|due| due.saturating_sub(self.timers.now()))
    }

    pub fn is_reboot_pending(&self) -> bool {
        self.reboot_pending
    }

    pub fn pending_data_requests(&self) -> usize {
        self.pending_data_req
    }

    /// Upgrade file bytes accepted since boot.
    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn step(&mut self, work: Work) {
        let state_before = self.ctx.state;
        let relay_before = self.relay.state();
        match work {
            Work::Event(event) => self.dispatch(event),
            Work::HostFrame(frame) => {
                self.receive_host_frame(&frame, Link::Host);
                self.pending_data_req = self.pending_data_req.saturating_sub(1);
                if self.flow_off {
                    self.flow_off = false;
                    self.notices.push(TransportNotice::FlowOn);
                }
            }
            Work::PeerFrame(frame) => match self.ctx.role {
                DeviceRole::Secondary => self.receive_host_frame(&frame, Link::Peer),
                DeviceRole::Primary => self.receive_relay_frame(&frame),
            },
            Work::Relay(input) => self.relay_step(input),
        }
        self.report_state(state_before, relay_before);
    }

    fn dispatch(&mut self, event: UpgradeEvent) {
        let effects = sm::handle(&mut self.ctx, event);
        self.apply(effects);
    }

    fn receive_host_frame(&mut self, frame: &[u8], link: Link) {
        let msg = match HostMessage::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(link = %link, error = %e, len = frame.len(), "Undecodable host frame dropped");
                return;
            }
        };
        self.observer.on_event(&DfuEvent::Packet {
            link,
            direction: PacketDirection::Rx,
            name: msg.name(),
            length: frame.len(),
        });
        if let HostMessage::Data { bytes, .. } = &msg {
            self.received += bytes.len() as u64;
            self.observer.on_event(&DfuEvent::Progress {
                received: self.received,
            });
        }
        self.dispatch(UpgradeEvent::Host(msg));
    }

    fn receive_relay_frame(&mut self, frame: &[u8]) {
        match HostResponse::decode(frame) {
            Ok(response) => {
                self.observer.on_event(&DfuEvent::Packet {
                    link: Link::Peer,
                    direction: PacketDirection::Rx,
                    name: response.name(),
                    length: frame.len(),
                });
                self.relay_step(RelayInput::Received(response));
            }
            Err(e) => warn!(error = %e, len = frame.len(), "Undecodable peer frame dropped"),
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Respond(response) => self.respond(response),
                Effect::Indicate(indication) => self.indicate(indication),
                Effect::IndicateLater { indication, delay_ms } => {
                    self.timers.schedule(delay_ms, Timed::Indication(indication));
                }
                Effect::Schedule { event, delay_ms } => {
                    self.timers.schedule(delay_ms, Timed::Event(event));
                }
                Effect::Internal(event) => self.urgent.push_back(Work::Event(event)),
                Effect::Peer(command) if self.ctx.peer_supported() => {
                    self.urgent.push_back(Work::Relay(RelayInput::Command(command)));
                }
                Effect::Peer(command) => debug!(?command, "No peer relay on this device"),
                Effect::Reboot => {
                    info!("Reboot requested");
                    self.reboot_pending = true;
                    self.observer.on_event(&DfuEvent::Reboot);
                }
            }
        }
    }

    fn respond(&mut self, response: HostResponse) {
        let link = match self.ctx.role {
            DeviceRole::Primary => Link::Host,
            DeviceRole::Secondary => Link::Peer,
        };
        self.observer.on_event(&DfuEvent::Packet {
            link,
            direction: PacketDirection::Tx,
            name: response.name(),
            length: response.encode().len(),
        });
        match &response {
            HostResponse::ErrorWarnInd { code } => {
                if let Ok(status) = UpgradeStatus::try_from(*code) {
                    self.observer.on_event(&DfuEvent::Error { status });
                }
            }
            HostResponse::CompleteInd => self.observer.on_event(&DfuEvent::Complete),
            _ => {}
        }

        if self.sco_active && link == Link::Host {
            debug!(msg = response.name(), "Voice call active, holding response");
            self.held.push_back(Held::Response(response));
        } else {
            self.deliver(&response);
        }
    }

    fn deliver(&mut self, response: &HostResponse) {
        if let Err(e) = self.sink.send(response) {
            warn!(link = self.sink.link(), msg = response.name(), error = %e, "Response dropped");
        }
    }

    fn flush_held(&mut self) {
        if !self.held.is_empty() {
            debug!(count = self.held.len(), "Voice call ended, releasing held traffic");
        }
        while let Some(held) = self.held.pop_front() {
            match held {
                Held::Response(response) => self.deliver(&response),
                Held::DataCfm(opcode) => self.notices.push(TransportNotice::DataCfm { opcode }),
            }
        }
    }

    fn indicate(&mut self, indication: AppIndication) {
        debug!(?indication, "Indication");
        self.observer.on_event(&DfuEvent::Indication(indication));
        self.indications.push(indication);
    }

    fn fire(&mut self, fired: Vec<Timed>) {
        for timed in fired {
            match timed {
                Timed::Event(event) => self.inbox.push_back(Work::Event(event)),
                Timed::Relay(input) => self.inbox.push_back(Work::Relay(input)),
                Timed::Indication(indication) => self.indicate(indication),
            }
        }
    }

    fn relay_step(&mut self, input: RelayInput) {
        let mut env = RelayEnv {
            flash: &self.ctx.flash,
            store: &mut self.ctx.store,
            header_log: &self.ctx.header_log,
            table: &self.ctx.table,
        };
        let effects = self.relay.handle(input, &mut env);
        self.ctx.peer = self.relay.status();
        self.apply_relay(effects);
    }

    fn apply_relay(&mut self, effects: Vec<RelayEffect>) {
        for effect in effects {
            match effect {
                RelayEffect::Send(msg) => self.send_to_peer(&msg),
                RelayEffect::Notify(notification) => {
                    self.urgent.push_back(Work::Event(UpgradeEvent::Peer(notification)));
                }
                RelayEffect::Schedule { input, delay_ms } => {
                    self.timers.schedule(delay_ms, Timed::Relay(input));
                }
                RelayEffect::Connect => self.link_requests.push(PeerLinkRequest::Connect),
                RelayEffect::Disconnect => self.link_requests.push(PeerLinkRequest::Disconnect),
            }
        }
    }

    fn send_to_peer(&mut self, msg: &HostMessage) {
        let frame = msg.encode();
        self.observer.on_event(&DfuEvent::Packet {
            link: Link::Peer,
            direction: PacketDirection::Tx,
            name: msg.name(),
            length: frame.len(),
        });
        if !self.peer.is_connected() {
            warn!(msg = msg.name(), "Peer link down, message dropped");
        } else if self.peer.len() >= MAX_QUEUED_FRAMES {
            warn!(msg = msg.name(), "Peer queue full, message dropped");
        } else {
            self.peer.push(frame);
        }
    }

    fn report_state(&self, before: UpgradeState, relay_before: RelayState) {
        if self.ctx.state != before {
            self.observer.on_event(&DfuEvent::StateChanged {
                from: before,
                to: self.ctx.state,
            });
        }
        if self.relay.state() != relay_before {
            self.observer.on_event(&DfuEvent::RelayStateChanged {
                from: relay_before,
                to: self.relay.state(),
            });
        }
    }
}
