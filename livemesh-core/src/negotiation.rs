//! Offer/answer negotiation
//!
//! One state machine per stream session. It applies incoming offers,
//! answers and candidates to the matching peer session and drives outgoing
//! offers. Mailboxes may deliver a message more than once and in any order,
//! so every message goes through a per-`(peer, kind)` seen-set first.
//!
//! Every await point is followed by a check of the session gate; once the
//! session is no longer active the round is dropped without touching peers
//! or publishing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::connection::SignalingState;
use crate::peer::{NegotiationState, PeerConnectionManager, PeerSession, Role};
use crate::session::{SessionGate, SessionTicket};
use crate::signaling::{
    IceCandidate, MessageKind, SdpType, SessionDescription, SignalPayload, SignalingChannel,
    SignalingHandler, SignalingMessage,
};
use crate::types::PeerId;
use crate::{Error, Result};

/// Last processed message for a `(peer, kind)` pair
#[derive(Debug, Clone)]
struct SeenMark {
    sent_at: DateTime<Utc>,
    id: String,
}

/// Outcome of checking a message against the seen-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    New,
    Duplicate,
    Older,
}

pub struct NegotiationStateMachine {
    channel: SignalingChannel,
    peers: Arc<PeerConnectionManager>,
    gate: Arc<SessionGate>,
    ticket: SessionTicket,
    offer_timeout: Duration,
    seen: Mutex<HashMap<(PeerId, MessageKind), SeenMark>>,
}

impl NegotiationStateMachine {
    pub fn new(
        channel: SignalingChannel,
        peers: Arc<PeerConnectionManager>,
        gate: Arc<SessionGate>,
        ticket: SessionTicket,
        offer_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            peers,
            gate,
            ticket,
            offer_timeout,
            seen: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn channel(&self) -> &SignalingChannel {
        &self.channel
    }

    fn is_active(&self) -> bool {
        self.gate.is_active(self.ticket)
    }

    /// Forget every processed message.
    pub fn reset(&self) {
        self.seen.lock().clear();
    }

    #[must_use]
    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }

    fn admit(&self, message: &SignalingMessage) -> Admission {
        let mut seen = self.seen.lock();
        let key = (message.from.clone(), message.kind());

        if let Some(mark) = seen.get(&key) {
            if mark.id == message.id {
                return Admission::Duplicate;
            }
            if message.sent_at < mark.sent_at {
                return Admission::Older;
            }
        }

        seen.insert(
            key,
            SeenMark {
                sent_at: message.sent_at,
                id: message.id.clone(),
            },
        );
        Admission::New
    }

    /// Start an offer round towards `peer_id`.
    ///
    /// Ignored while a round is in flight, unless the pending offer has
    /// outlived the offer timeout, in which case the round starts over.
    pub async fn negotiation_needed(&self, peer_id: &PeerId) {
        if !self.is_active() {
            return;
        }
        let Some(session) = self.peers.get(peer_id) else {
            debug!(peer_id = %peer_id, "Negotiation needed for unknown peer");
            return;
        };

        if !session.try_begin_negotiation() {
            if session.offer_expired(self.offer_timeout) {
                warn!(peer_id = %peer_id, "Offer went unanswered, restarting negotiation");
            } else {
                debug!(peer_id = %peer_id, "Negotiation already in flight");
                return;
            }
        } else if session.signaling_state() != SignalingState::Stable {
            // Nothing is in flight, so this is left over from an abandoned round
            self.roll_back(&session).await;
            if session.signaling_state() != SignalingState::Stable {
                debug!(
                    peer_id = %peer_id,
                    state = ?session.signaling_state(),
                    "Skipping offer while not stable"
                );
                session.end_negotiation();
                return;
            }
        }

        match self.run_offer_round(&session).await {
            Ok(true) => {}
            Ok(false) => {
                // Session ended mid-round
                session.end_negotiation();
            }
            Err(e) => {
                match &e {
                    Error::MalformedSignalingPayload(_) => {
                        error!(peer_id = %peer_id, error = %e, "Generated offer is malformed, round aborted");
                    }
                    _ => {
                        warn!(peer_id = %peer_id, error = %e, "Offer round abandoned");
                    }
                }
                self.abandon_round(&session).await;
            }
        }
    }

    /// Undo whatever the aborted round applied so the next one starts from
    /// stable, then release the guard.
    async fn abandon_round(&self, session: &PeerSession) {
        self.roll_back(session).await;
        session.set_negotiation_state(NegotiationState::Idle);
        session.end_negotiation();
    }

    async fn roll_back(&self, session: &PeerSession) {
        let connection = session.connection();
        let state = connection.signaling_state();
        let result = match state {
            SignalingState::HaveLocalOffer | SignalingState::HaveLocalPranswer => {
                connection
                    .set_local_description(SessionDescription::rollback())
                    .await
            }
            SignalingState::HaveRemoteOffer | SignalingState::HaveRemotePranswer => {
                connection
                    .set_remote_description(SessionDescription::rollback())
                    .await
            }
            SignalingState::Stable | SignalingState::Closed => return,
        };

        match result {
            Ok(()) => debug!(peer_id = %session.peer_id, from = ?state, "Rolled back to stable"),
            Err(e) => warn!(peer_id = %session.peer_id, error = %e, "Rollback failed"),
        }
    }

    /// Returns false when the session stopped during the round.
    async fn run_offer_round(&self, session: &PeerSession) -> Result<bool> {
        let connection = session.connection();

        let offer = connection.create_offer().await?;
        offer.validate(SdpType::Offer)?;
        if !self.is_active() {
            return Ok(false);
        }

        connection.set_local_description(offer.clone()).await?;
        if !self.is_active() {
            return Ok(false);
        }

        let message = self.channel.prepare(
            &session.peer_id,
            SignalPayload::Offer { description: offer },
        );
        session.begin_offer(message.id.as_str());
        self.channel.send(&message).await?;

        info!(peer_id = %session.peer_id, offer_id = %message.id, "Offer published");
        Ok(true)
    }

    async fn handle_offer(&self, message: &SignalingMessage, description: &SessionDescription) {
        let peer_id = &message.from;

        if let Err(e) = description.validate(SdpType::Offer) {
            warn!(peer_id = %peer_id, error = %e, "Dropping malformed offer");
            return;
        }

        // A new remote session means the old connection is dead
        if let Some(existing) = self.peers.get(peer_id) {
            if existing
                .remote_session()
                .is_some_and(|s| s != message.session_id)
            {
                info!(peer_id = %peer_id, "Remote peer restarted, replacing connection");
                self.peers.close_session(peer_id).await;
            }
        }

        let session = match self.peers.create_session(peer_id, Role::Responder).await {
            Ok(session) => session,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Failed to create session for offer");
                return;
            }
        };
        if !self.is_active() {
            return;
        }

        if !session.try_begin_negotiation() {
            let e = Error::StaleSignalingMessage(format!(
                "offer {} arrived while negotiation is in flight",
                message.id
            ));
            warn!(peer_id = %peer_id, error = %e, "Offer rejected");
            return;
        }

        let state = session.signaling_state();
        if state != SignalingState::Stable {
            session.end_negotiation();
            let e = Error::StaleSignalingMessage(format!(
                "offer {} arrived in state {state:?}",
                message.id
            ));
            warn!(peer_id = %peer_id, error = %e, "Offer rejected");
            return;
        }

        session.set_remote_session(message.session_id.as_str());
        session.set_negotiation_state(NegotiationState::AnswerPending);

        match self.answer_offer(&session, message, description).await {
            Ok(true) => {
                session.set_negotiation_state(NegotiationState::Stable);
                session.end_negotiation();
                self.republish_candidates(&session).await;
            }
            Ok(false) => session.end_negotiation(),
            Err(e) => {
                match &e {
                    Error::MalformedSignalingPayload(_) => {
                        error!(peer_id = %peer_id, error = %e, "Generated answer is malformed, round aborted");
                    }
                    _ => {
                        warn!(peer_id = %peer_id, error = %e, "Answer round abandoned");
                    }
                }
                self.abandon_round(&session).await;
            }
        }
    }

    async fn answer_offer(
        &self,
        session: &PeerSession,
        offer: &SignalingMessage,
        description: &SessionDescription,
    ) -> Result<bool> {
        let connection = session.connection();

        connection.set_remote_description(description.clone()).await?;
        if !self.is_active() {
            return Ok(false);
        }

        let answer = connection.create_answer().await?;
        answer.validate(SdpType::Answer)?;
        if !self.is_active() {
            return Ok(false);
        }

        connection.set_local_description(answer.clone()).await?;
        if !self.is_active() {
            return Ok(false);
        }

        let message = self
            .channel
            .publish(
                &session.peer_id,
                SignalPayload::Answer {
                    description: answer,
                    reply_to: offer.id.clone(),
                },
            )
            .await?;

        info!(
            peer_id = %session.peer_id,
            offer_id = %offer.id,
            answer_id = %message.id,
            "Answer published"
        );
        Ok(true)
    }

    async fn handle_answer(
        &self,
        message: &SignalingMessage,
        description: &SessionDescription,
        reply_to: &str,
    ) {
        let peer_id = &message.from;
        let Some(session) = self.peers.get(peer_id) else {
            debug!(peer_id = %peer_id, "Dropping answer from unknown peer");
            return;
        };

        if let Err(e) = description.validate(SdpType::Answer) {
            warn!(peer_id = %peer_id, error = %e, "Dropping malformed answer");
            return;
        }

        if session.pending_offer_id().as_deref() != Some(reply_to) {
            let e = Error::StaleSignalingMessage(format!(
                "answer {} replies to {reply_to}, not the pending offer",
                message.id
            ));
            warn!(peer_id = %peer_id, error = %e, "Answer rejected");
            return;
        }

        let state = session.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            let e = Error::StaleSignalingMessage(format!(
                "answer {} arrived in state {state:?}",
                message.id
            ));
            warn!(peer_id = %peer_id, error = %e, "Answer rejected");
            return;
        }

        if let Err(e) = session
            .connection()
            .set_remote_description(description.clone())
            .await
        {
            warn!(peer_id = %peer_id, error = %e, "Failed to apply answer");
            self.abandon_round(&session).await;
            return;
        }
        if !self.is_active() {
            return;
        }

        session.set_remote_session(message.session_id.as_str());
        session.set_negotiation_state(NegotiationState::Stable);
        session.end_negotiation();
        info!(peer_id = %peer_id, "Negotiation complete");

        self.republish_candidates(&session).await;
    }

    async fn handle_candidates(&self, message: &SignalingMessage, candidates: &[IceCandidate]) {
        let peer_id = &message.from;
        let Some(session) = self.peers.get(peer_id) else {
            debug!(peer_id = %peer_id, count = candidates.len(), "Dropping candidates from unknown peer");
            return;
        };

        if session
            .remote_session()
            .is_some_and(|s| s != message.session_id)
        {
            debug!(peer_id = %peer_id, "Dropping candidates from a previous remote session");
            return;
        }

        let mut applied = 0usize;
        for candidate in candidates {
            if !self.is_active() {
                return;
            }
            if !session.mark_candidate_applied(candidate) {
                continue;
            }
            match session.connection().add_ice_candidate(candidate.clone()).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    session.unmark_candidate(candidate);
                    warn!(peer_id = %peer_id, error = %e, "Failed to apply ICE candidate");
                }
            }
        }

        if applied > 0 {
            debug!(peer_id = %peer_id, applied = applied, "Applied remote ICE candidates");
        }
    }

    /// Publish the full candidate batch after a local candidate was gathered.
    pub async fn local_candidate(&self, peer_id: &PeerId, candidate: IceCandidate) {
        if !self.is_active() {
            return;
        }
        let Some(session) = self.peers.get(peer_id) else {
            return;
        };
        let Some(batch) = session.push_local_candidate(candidate) else {
            return;
        };
        self.publish_candidates(&session, batch).await;
    }

    /// The remote side drops candidates that arrive before it knows us, so
    /// send the batch again once negotiation completes.
    async fn republish_candidates(&self, session: &PeerSession) {
        let batch = session.local_candidates();
        if !batch.is_empty() && self.is_active() {
            self.publish_candidates(session, batch).await;
        }
    }

    async fn publish_candidates(&self, session: &PeerSession, candidates: Vec<IceCandidate>) {
        let count = candidates.len();
        if let Err(e) = self
            .channel
            .publish(&session.peer_id, SignalPayload::Candidates { candidates })
            .await
        {
            warn!(peer_id = %session.peer_id, error = %e, "Failed to publish ICE candidates");
        } else {
            debug!(peer_id = %session.peer_id, count = count, "Published ICE candidates");
        }
    }
}

#[async_trait]
impl SignalingHandler for NegotiationStateMachine {
    async fn on_message(&self, message: SignalingMessage) {
        if !self.is_active() {
            return;
        }

        match self.admit(&message) {
            Admission::New => {}
            Admission::Duplicate => {
                debug!(
                    peer_id = %message.from,
                    kind = ?message.kind(),
                    message_id = %message.id,
                    "Skipping already processed message"
                );
                return;
            }
            Admission::Older => {
                let e = Error::StaleSignalingMessage(format!(
                    "{:?} {} is older than the last one processed",
                    message.kind(),
                    message.id
                ));
                debug!(peer_id = %message.from, error = %e, "Skipping message");
                return;
            }
        }

        match &message.payload {
            SignalPayload::Offer { description } => self.handle_offer(&message, description).await,
            SignalPayload::Answer {
                description,
                reply_to,
            } => self.handle_answer(&message, description, reply_to).await,
            SignalPayload::Candidates { candidates } => {
                self.handle_candidates(&message, candidates).await;
            }
        }
    }
}
