//! Client-side call session
//!
//! Binds one [`NatTraversal`] to a shared [`AudioEngine`] for a call between
//! two users. Outbound signaling goes to a caller-supplied sink; inbound
//! signaling is fed through [`CallSession::handle_signaling`]. The engine's
//! lifecycle stays with its owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::{AudioEngine, AudioStatistics};
use crate::config::NatConfig;
use crate::constants::DEFAULT_FRAME_SIZE_MS;
use crate::error::Result;
use crate::nat::{ConnectionState, IceCandidate, NatTraversal};
use crate::signaling::protocol::{self, SignalingMessage};

/// Receives outbound signaling JSON
pub type SignalingSink = Arc<dyn Fn(String) + Send + Sync>;

/// Encoded frames waiting for the transport
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStatistics {
    pub local_user: String,
    pub remote_user: String,
    pub role: CallRole,
    pub connection_state: ConnectionState,
    pub duration_secs: u64,
    pub audio: AudioStatistics,
}

struct Parties {
    local: String,
    remote: String,
    role: Mutex<CallRole>,
}

impl Parties {
    /// (caller, callee) for message construction
    fn ids(&self) -> (&str, &str) {
        match *self.role.lock() {
            CallRole::Caller => (&self.local, &self.remote),
            CallRole::Callee => (&self.remote, &self.local),
        }
    }

    /// Address an outbound message to the remote party
    fn outbound(&self, json: String) -> String {
        match *self.role.lock() {
            CallRole::Caller => json,
            CallRole::Callee => protocol::reply_to_caller(&json),
        }
    }
}

pub struct CallSession {
    parties: Arc<Parties>,
    nat: Arc<NatTraversal>,
    engine: Arc<AudioEngine>,
    sink: SignalingSink,
    sender: Mutex<Option<JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,
    ended: AtomicBool,
}

impl CallSession {
    pub fn new(
        local_user: impl Into<String>,
        remote_user: impl Into<String>,
        nat: Arc<NatTraversal>,
        engine: Arc<AudioEngine>,
        sink: SignalingSink,
    ) -> Self {
        Self {
            parties: Arc::new(Parties {
                local: local_user.into(),
                remote: remote_user.into(),
                role: Mutex::new(CallRole::Caller),
            }),
            nat,
            engine,
            sink,
            sender: Mutex::new(None),
            started_at: Mutex::new(None),
            ended: AtomicBool::new(false),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.parties.local
    }

    pub fn remote_user(&self) -> &str {
        &self.parties.remote
    }

    pub fn role(&self) -> CallRole {
        *self.parties.role.lock()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Open the peer connection and wire media and candidate plumbing
    pub async fn start(&self, config: NatConfig) -> Result<()> {
        self.nat.initialize(config).await?;
        self.ended.store(false, Ordering::Release);
        *self.started_at.lock() = Some(Instant::now());

        let parties = Arc::clone(&self.parties);
        let sink = Arc::clone(&self.sink);
        self.nat.set_on_ice_candidate(move |candidate: IceCandidate| {
            let (caller, callee) = parties.ids();
            let json = protocol::create_call_ice_candidate(caller, callee, &candidate);
            sink(parties.outbound(json));
        });

        let engine = Arc::clone(&self.engine);
        self.nat.set_on_audio_frame(move |frame| {
            engine.feed_encoded_audio(frame);
        });

        let remote = self.parties.remote.clone();
        self.nat.set_on_connection_state(move |state| {
            tracing::info!(remote = %remote, state = %state, "Call connection state");
        });

        let frame_duration = Duration::from_millis(u64::from(
            self.engine
                .config()
                .map(|c| c.frame_size_ms)
                .unwrap_or(DEFAULT_FRAME_SIZE_MS),
        ));

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        self.engine.set_network_callback(move |packet| {
            if tx.try_send(packet.to_vec()).is_err() {
                tracing::debug!("Outbound audio queue full, dropping frame");
            }
        });

        let nat = Arc::clone(&self.nat);
        let task = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = nat.send_audio_frame(&packet, frame_duration).await {
                    tracing::trace!("Audio frame not sent: {}", e);
                }
            }
        });
        if let Some(previous) = self.sender.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Create an offer and send it to the remote user
    pub async fn start_offer(&self) -> Result<()> {
        *self.parties.role.lock() = CallRole::Caller;
        let offer = self.nat.create_offer().await?;
        (self.sink)(protocol::create_call_offer(&self.parties.local, &self.parties.remote, &offer));
        tracing::info!(to = %self.parties.remote, "Sent call offer");
        Ok(())
    }

    /// Apply one inbound signaling message
    pub async fn handle_signaling(&self, json: &str) -> Result<()> {
        match SignalingMessage::from_json(json)? {
            SignalingMessage::CallInit { call_type, .. } => {
                tracing::info!(from = %self.parties.remote, call_type = %call_type, "Incoming call");
            }
            SignalingMessage::CallOffer { offer, .. } => {
                *self.parties.role.lock() = CallRole::Callee;
                self.nat.set_remote_offer(&offer).await?;
                let answer = self.nat.create_answer().await?;
                let json = protocol::create_call_answer(&self.parties.remote, &self.parties.local, &answer);
                (self.sink)(self.parties.outbound(json));
                tracing::info!(to = %self.parties.remote, "Sent call answer");
            }
            SignalingMessage::CallAnswer { answer, .. } => {
                self.nat.set_remote_answer(&answer).await?;
            }
            SignalingMessage::CallIceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => {
                self.nat
                    .add_ice_candidate(&IceCandidate::new(candidate, sdp_mid, sdp_mline_index))
                    .await?;
            }
            SignalingMessage::CallEnd { reason, .. } => {
                tracing::info!(remote = %self.parties.remote, reason = %reason, "Remote ended call");
                self.terminate().await;
            }
            SignalingMessage::CallError {
                error_code,
                error_message,
                ..
            } => {
                let code = protocol::ErrorCode::from_code(error_code);
                tracing::warn!(code = ?code, message = %error_message, "Call rejected");
                self.terminate().await;
            }
        }
        Ok(())
    }

    /// Notify the remote user and tear down
    pub async fn hang_up(&self, reason: &str) {
        if self.is_ended() {
            return;
        }
        let (caller, callee) = self.parties.ids();
        let json = protocol::create_call_end(caller, callee, reason);
        (self.sink)(self.parties.outbound(json));
        self.terminate().await;
    }

    async fn terminate(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.engine.clear_network_callback();
        if let Some(task) = self.sender.lock().take() {
            task.abort();
        }
        self.nat.close().await;
        self.nat.clear_handlers();
    }

    pub fn statistics(&self) -> CallStatistics {
        CallStatistics {
            local_user: self.parties.local.clone(),
            remote_user: self.parties.remote.clone(),
            role: self.role(),
            connection_state: self.nat.connection_state(),
            duration_secs: self
                .started_at
                .lock()
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            audio: self.engine.statistics(),
        }
    }
}
