//! NAT traversal and peer connection lifecycle
//!
//! [`NatTraversal`] owns at most one live peer connection at a time. The
//! transport behind it is pluggable through [`PeerConnector`]; the default
//! one is built on `webrtc`.
//!
//! Transport callbacks never see the owner directly. They hold a
//! [`PeerEvents`] tagged with the generation they were created for, and only
//! reach the registered handlers while that generation is still active.

pub mod generation;
pub mod ice;
#[cfg(feature = "webrtc-transport")]
pub mod rtc;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::NatConfig;
use crate::constants::{DRAIN_GRACE, MAX_DRAINING_CONNECTIONS};
use crate::error::NegotiationError;

pub use generation::{DrainQueue, Generation, GenerationGate};
pub use ice::{IceCandidate, IceServer};
#[cfg(feature = "webrtc-transport")]
pub use rtc::WebRtcConnector;

/// Peer connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

pub type IceCandidateHandler = Arc<dyn Fn(IceCandidate) + Send + Sync>;
pub type ConnectionStateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type AudioFrameHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type LocalDescriptionHandler = Arc<dyn Fn(&str, SdpType) + Send + Sync>;

/// One established transport-level peer connection with its audio track
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(&self) -> Result<String, NegotiationError>;
    async fn create_answer(&self) -> Result<String, NegotiationError>;
    async fn set_remote_description(&self, kind: SdpType, sdp: &str) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError>;
    async fn send_audio_frame(&self, data: &[u8], duration: Duration) -> Result<(), NegotiationError>;
    async fn close(&self);
}

/// Creates peer sessions. Implementations report asynchronous transport
/// events through the supplied [`PeerEvents`].
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        servers: &[IceServer],
        config: &NatConfig,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerSession>, NegotiationError>;
}

#[derive(Default, Clone)]
struct Handlers {
    ice_candidate: Option<IceCandidateHandler>,
    connection_state: Option<ConnectionStateHandler>,
    audio_frame: Option<AudioFrameHandler>,
    local_description: Option<LocalDescriptionHandler>,
}

struct Shared {
    gate: GenerationGate,
    closing: AtomicBool,
    handlers: RwLock<Handlers>,
    state: Mutex<ConnectionState>,
    drain: Mutex<DrainQueue<Arc<dyn PeerSession>>>,
}

/// Event sink handed to the transport for one generation
#[derive(Clone)]
pub struct PeerEvents {
    generation: Generation,
    shared: Weak<Shared>,
}

/// Proof that the generation was active when the event arrived
struct Admitted<'a> {
    events: &'a PeerEvents,
    shared: Arc<Shared>,
}

impl PeerEvents {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.admit().is_some()
    }

    /// Enter the handler scope, or `None` if this generation is stale.
    fn admit(&self) -> Option<Admitted<'_>> {
        let shared = self.shared.upgrade()?;
        if !shared.gate.is_active(self.generation) {
            return None;
        }
        Some(Admitted {
            events: self,
            shared,
        })
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        if let Some(scope) = self.admit() {
            scope.local_candidate(candidate);
        }
    }

    pub fn local_description(&self, sdp: &str, kind: SdpType) {
        if let Some(scope) = self.admit() {
            scope.local_description(sdp, kind);
        }
    }

    pub fn audio_frame(&self, data: &[u8]) {
        if let Some(scope) = self.admit() {
            scope.audio_frame(data);
        }
    }

    /// `Closed` is recorded for the drain queue even when the generation is
    /// stale, and even before the connection has been parked.
    pub fn state_changed(&self, state: ConnectionState) {
        if state == ConnectionState::Closed {
            if let Some(shared) = self.shared.upgrade() {
                if shared.drain.lock().mark_closed(self.generation, Instant::now()) {
                    tracing::debug!(generation = %self.generation, "Drained connection reported closed");
                }
            }
        }

        if let Some(scope) = self.admit() {
            scope.state_changed(state);
        }
    }
}

impl Admitted<'_> {
    fn handlers(&self) -> Handlers {
        self.shared.handlers.read().clone()
    }

    fn local_candidate(&self, candidate: IceCandidate) {
        if let Some(handler) = self.handlers().ice_candidate {
            handler(candidate);
        }
    }

    fn local_description(&self, sdp: &str, kind: SdpType) {
        if let Some(handler) = self.handlers().local_description {
            handler(sdp, kind);
        }
    }

    fn audio_frame(&self, data: &[u8]) {
        if let Some(handler) = self.handlers().audio_frame {
            handler(data);
        }
    }

    fn state_changed(&self, state: ConnectionState) {
        *self.shared.state.lock() = state;
        tracing::info!(generation = %self.events.generation, state = %state, "Peer connection state");
        if let Some(handler) = self.handlers().connection_state {
            handler(state);
        }
    }
}

/// Per-call ICE negotiation and media transport
pub struct NatTraversal {
    connector: Arc<dyn PeerConnector>,
    shared: Arc<Shared>,
    current: Mutex<Option<(Generation, Arc<dyn PeerSession>)>>,
}

impl NatTraversal {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            shared: Arc::new(Shared {
                gate: GenerationGate::new(),
                closing: AtomicBool::new(false),
                handlers: RwLock::new(Handlers::default()),
                state: Mutex::new(ConnectionState::New),
                drain: Mutex::new(DrainQueue::new(DRAIN_GRACE, MAX_DRAINING_CONNECTIONS)),
            }),
            current: Mutex::new(None),
        }
    }

    #[cfg(feature = "webrtc-transport")]
    pub fn with_webrtc() -> Self {
        Self::new(Arc::new(WebRtcConnector::new()))
    }

    /// Start a new connection attempt, superseding any previous one.
    pub async fn initialize(&self, config: NatConfig) -> Result<Generation, NegotiationError> {
        let servers = ice::servers_from_config(&config)?;

        if self.current.lock().is_some() {
            self.close().await;
        }

        self.shared
            .drain
            .lock()
            .reconfigure(Duration::from_millis(config.drain_grace_ms), config.max_draining);
        self.reclaim_drained();

        let generation = self.shared.gate.advance();
        self.shared.closing.store(false, Ordering::Release);
        *self.shared.state.lock() = ConnectionState::New;

        let events = PeerEvents {
            generation,
            shared: Arc::downgrade(&self.shared),
        };

        let session = match self.connector.connect(&servers, &config, events).await {
            Ok(session) => session,
            Err(e) => {
                self.shared.gate.invalidate_if(generation);
                tracing::error!(generation = %generation, "Failed to create peer connection: {}", e);
                return Err(e);
            }
        };

        let superseded = {
            let mut current = self.current.lock();
            if self.shared.gate.is_active(generation) {
                *current = Some((generation, Arc::clone(&session)));
                false
            } else {
                true
            }
        };

        if superseded {
            // close() ran while the transport was still being built
            self.park(generation, Arc::clone(&session));
            session.close().await;
            return Err(NegotiationError::StaleGeneration(generation.get()));
        }

        tracing::info!(
            generation = %generation,
            stun = config.stun_servers.len(),
            turn = config.turn_servers.len(),
            "NAT traversal initialized"
        );
        Ok(generation)
    }

    fn active_session(&self) -> Result<(Generation, Arc<dyn PeerSession>), NegotiationError> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(NegotiationError::Closing);
        }
        let current = self.current.lock();
        let (generation, session) = current.as_ref().ok_or(NegotiationError::NoPeerConnection)?;
        if !self.shared.gate.is_active(*generation) {
            return Err(NegotiationError::StaleGeneration(generation.get()));
        }
        Ok((*generation, Arc::clone(session)))
    }

    fn still_active(&self, generation: Generation) -> Result<(), NegotiationError> {
        if self.shared.gate.is_active(generation) {
            Ok(())
        } else {
            Err(NegotiationError::StaleGeneration(generation.get()))
        }
    }

    pub async fn create_offer(&self) -> Result<String, NegotiationError> {
        let (generation, session) = self.active_session()?;
        let sdp = session.create_offer().await.map_err(|e| {
            tracing::error!("Failed to create offer: {}", e);
            e
        })?;
        self.still_active(generation)?;
        Ok(sdp)
    }

    pub async fn create_answer(&self) -> Result<String, NegotiationError> {
        let (generation, session) = self.active_session()?;
        let sdp = session.create_answer().await.map_err(|e| {
            tracing::error!("Failed to create answer: {}", e);
            e
        })?;
        self.still_active(generation)?;
        Ok(sdp)
    }

    pub async fn set_remote_offer(&self, sdp: &str) -> Result<(), NegotiationError> {
        self.set_remote(SdpType::Offer, sdp).await
    }

    pub async fn set_remote_answer(&self, sdp: &str) -> Result<(), NegotiationError> {
        self.set_remote(SdpType::Answer, sdp).await
    }

    async fn set_remote(&self, kind: SdpType, sdp: &str) -> Result<(), NegotiationError> {
        if sdp.trim().is_empty() {
            return Err(NegotiationError::InvalidSdp(format!("empty {}", kind.as_str())));
        }
        let (_, session) = self.active_session()?;
        session.set_remote_description(kind, sdp).await.map_err(|e| {
            tracing::error!("Failed to set remote {}: {}", kind.as_str(), e);
            e
        })
    }

    pub async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        candidate.validate()?;
        let (_, session) = self.active_session()?;
        session.add_ice_candidate(candidate).await.map_err(|e| {
            tracing::warn!("Failed to add ICE candidate: {}", e);
            e
        })
    }

    /// Send one encoded frame covering `duration` of audio
    pub async fn send_audio_frame(&self, data: &[u8], duration: Duration) -> Result<(), NegotiationError> {
        let (_, session) = self.active_session()?;
        session.send_audio_frame(data, duration).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn active_generation(&self) -> Option<Generation> {
        self.shared.gate.active()
    }

    /// Connections waiting for their transport to confirm closure
    pub fn draining_count(&self) -> usize {
        self.shared.drain.lock().len()
    }

    fn reclaim_drained(&self) {
        let now = Instant::now();
        let released = {
            let mut drain = self.shared.drain.lock();
            let released = drain.reclaim(now);
            if let Some(age) = drain.oldest_age(now) {
                tracing::debug!(
                    waiting = drain.len(),
                    oldest_ms = age.as_millis() as u64,
                    "Connections still draining"
                );
            }
            released
        };
        if !released.is_empty() {
            tracing::debug!(count = released.len(), "Released drained connections");
        }
    }

    fn park(&self, generation: Generation, session: Arc<dyn PeerSession>) {
        let mut drain = self.shared.drain.lock();
        // Overflow hands back a session we no longer track; dropping it is the release
        drop(drain.park(generation, session, Instant::now()));
    }

    /// Invalidate the current generation and close its connection.
    ///
    /// The connection stays parked until its own state callback reports it
    /// closed and the grace period elapses.
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::Release);
        let invalidated = self.shared.gate.invalidate();

        self.reclaim_drained();

        let session = self.current.lock().take();
        *self.shared.state.lock() = ConnectionState::Closed;

        if let Some((generation, session)) = session {
            if invalidated.is_some() {
                self.park(generation, Arc::clone(&session));
            }
            tracing::info!(generation = %generation, "Closing peer connection");
            session.close().await;
        }
    }

    pub async fn reset(&self) {
        self.close().await;
    }

    pub fn set_on_ice_candidate<F>(&self, handler: F)
    where
        F: Fn(IceCandidate) + Send + Sync + 'static,
    {
        self.shared.handlers.write().ice_candidate = Some(Arc::new(handler));
    }

    pub fn set_on_connection_state<F>(&self, handler: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.shared.handlers.write().connection_state = Some(Arc::new(handler));
    }

    pub fn set_on_audio_frame<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.shared.handlers.write().audio_frame = Some(Arc::new(handler));
    }

    pub fn set_on_local_description<F>(&self, handler: F)
    where
        F: Fn(&str, SdpType) + Send + Sync + 'static,
    {
        self.shared.handlers.write().local_description = Some(Arc::new(handler));
    }

    pub fn clear_handlers(&self) {
        *self.shared.handlers.write() = Handlers::default();
    }
}

impl Drop for NatTraversal {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        self.shared.gate.invalidate();
        if let Some((generation, session)) = self.current.get_mut().take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { session.close().await });
                }
                Err(_) => {
                    tracing::warn!(generation = %generation, "No runtime to close peer connection on drop");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for exercising the lifecycle without a network

    use super::*;

    #[derive(Default)]
    pub struct FakeSession {
        pub remote: Mutex<Vec<(SdpType, String)>>,
        pub candidates: Mutex<Vec<IceCandidate>>,
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub closed: AtomicBool,
    }

    #[async_trait]
    impl PeerSession for FakeSession {
        async fn create_offer(&self) -> Result<String, NegotiationError> {
            Ok("v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=offer\r\n".into())
        }

        async fn create_answer(&self) -> Result<String, NegotiationError> {
            if !self.remote.lock().iter().any(|(kind, _)| *kind == SdpType::Offer) {
                return Err(NegotiationError::InvalidSdp("no remote offer".into()));
            }
            Ok("v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\ns=answer\r\n".into())
        }

        async fn set_remote_description(&self, kind: SdpType, sdp: &str) -> Result<(), NegotiationError> {
            if !sdp.starts_with("v=0") {
                return Err(NegotiationError::InvalidSdp(sdp.into()));
            }
            self.remote.lock().push((kind, sdp.to_string()));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
            self.candidates.lock().push(candidate.clone());
            Ok(())
        }

        async fn send_audio_frame(&self, data: &[u8], _duration: Duration) -> Result<(), NegotiationError> {
            self.sent.lock().push(data.to_vec());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Hands out fake sessions and keeps every event sink so tests can fire
    /// transport callbacks whenever they like.
    #[derive(Default)]
    pub struct FakeConnector {
        pub sessions: Mutex<Vec<(PeerEvents, Arc<FakeSession>)>>,
        pub fail: AtomicBool,
    }

    impl FakeConnector {
        pub fn events(&self, index: usize) -> PeerEvents {
            self.sessions.lock()[index].0.clone()
        }

        pub fn session(&self, index: usize) -> Arc<FakeSession> {
            Arc::clone(&self.sessions.lock()[index].1)
        }
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn connect(
            &self,
            _servers: &[IceServer],
            _config: &NatConfig,
            events: PeerEvents,
        ) -> Result<Arc<dyn PeerSession>, NegotiationError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(NegotiationError::Transport("refused".into()));
            }
            let session = Arc::new(FakeSession::default());
            self.sessions.lock().push((events, Arc::clone(&session)));
            Ok(session)
        }
    }
}
