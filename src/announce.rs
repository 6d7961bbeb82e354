//! The announcement session.
//!
//! An [`AnnounceSender`] pushes one noderef toward a target location,
//! collecting noderefs of the peers met along the way. It runs to
//! completion in its own task and exists in two modes:
//!
//! - **relay**: constructed from an inbound `AnnouncementRequest`; the
//!   originator's noderef is received from the upstream source, forwarded
//!   downstream, and every reply is relayed back upstream on the same uid.
//! - **originator**: constructed locally; our own noderef is announced and
//!   replies are offered to the peer set, with progress reported through
//!   an [`AnnouncementCallback`].
//!
//! ## Per-hop sequence
//!
//! | Phase | Waiting for | Timeout | On failure |
//! |-------|-------------|---------|------------|
//! | admission | `Accepted` / rejections | 5 s | try next peer |
//! | body | completion, replies, rejections | 240 s | fatal: report overload upstream |
//! | drain | late `AnnounceReply` / `NodeNotWanted` | 30 s from arming | finish quietly |
//!
//! Backtracking never revisits a peer: everything routed to lands in
//! `routed_to` for the life of the session. HTL only decreases, except
//! when this node is closer to the target than anything seen so far, which
//! resets it to the maximum.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bucket::TempBucketPool;
use crate::counter::ByteCounter;
use crate::filter::{MessageFilter, MessagePattern, MessageWaiter, WaitOutcome};
use crate::location::Location;
use crate::messages::{Body, Message, MessageKind, RejectCode};
use crate::peers::{Peer, PeerId};
use crate::protocols::{
    AnnouncementCallback, HtlPolicy, MessageRouter, NoderefValidator, PeerSet, SessionRegistry,
};
use crate::transfer::{
    self, finish_announcement, send_announcement_reply, start_announcement, wait_for_noderef,
    TransferError,
};

/// How long a hop gets to admit or reject the announcement.
const ACCEPTED_TIMEOUT: Duration = Duration::from_millis(5_000);

/// How long a hop gets between body messages. Much longer than a normal
/// request: noderefs are transferred hop by hop behind this.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_millis(240_000);

/// After the completion message, how long to keep draining late reordered
/// replies. One wall-clock budget, not per message.
const END_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Everything a session needs from the rest of the node.
#[derive(Clone)]
pub struct AnnounceContext {
    pub router: Arc<dyn MessageRouter>,
    pub waiter: Arc<MessageWaiter>,
    pub peers: Arc<dyn PeerSet>,
    pub validator: Arc<dyn NoderefValidator>,
    pub policy: Arc<dyn HtlPolicy>,
    pub registry: Arc<dyn SessionRegistry>,
    pub pool: TempBucketPool,
    /// Our own compressed noderef, announced in originator mode and sent
    /// back upstream when we take the announced node ourselves.
    pub our_noderef: Vec<u8>,
    pub our_location: Location,
}

/// Header fields of the pending inbound noderef transfer that accompanies
/// an admission.
#[derive(Clone, Copy, Debug)]
pub struct InboundTransfer {
    pub transfer_uid: u64,
    pub noderef_length: u32,
    pub padded_length: u32,
}

/// A decoded inbound `AnnouncementRequest`, as handed over by the
/// transport's dispatch layer.
#[derive(Clone, Copy, Debug)]
pub struct IncomingAnnouncement {
    pub uid: u64,
    pub htl: u16,
    pub nearest_location: Location,
    pub target_location: Location,
    pub transfer: InboundTransfer,
}

pub struct AnnounceSender {
    ctx: AnnounceContext,
    uid: u64,
    /// Upstream peer in relay mode; None makes this an originator.
    source: Option<Arc<Peer>>,
    /// Pending inbound transfer, consumed during admission (relay mode).
    inbound: Option<InboundTransfer>,
    htl: u16,
    nearest: Location,
    target: Location,
    /// Local originator callback; present exactly when `source` is None.
    callback: Option<Arc<dyn AnnouncementCallback>>,
    only_peer: Option<Arc<Peer>>,
    /// The noderef we forward downstream: ours in originator mode, the
    /// originator's (received in admission) in relay mode.
    noderef: Vec<u8>,
    counter: ByteCounter,
}

impl AnnounceSender {
    /// Relay mode: route an announcement arriving from `source` onward.
    pub fn incoming(
        ctx: AnnounceContext,
        source: Arc<Peer>,
        announcement: IncomingAnnouncement,
    ) -> AnnounceSender {
        let htl = announcement.htl.min(ctx.policy.max_htl());
        AnnounceSender {
            uid: announcement.uid,
            source: Some(source),
            inbound: Some(announcement.transfer),
            htl,
            nearest: announcement.nearest_location,
            target: announcement.target_location,
            callback: None,
            only_peer: None,
            noderef: Vec::new(),
            counter: ByteCounter::new(),
            ctx,
        }
    }

    /// Originator mode: announce our own noderef toward `target`. With
    /// `only_peer` set, routing is pinned to that single peer.
    pub fn local(
        ctx: AnnounceContext,
        target: Location,
        callback: Arc<dyn AnnouncementCallback>,
        only_peer: Option<Arc<Peer>>,
    ) -> AnnounceSender {
        AnnounceSender {
            uid: rand::random::<u64>(),
            source: None,
            inbound: None,
            htl: ctx.policy.max_htl(),
            nearest: Location::INVALID,
            target,
            callback: Some(callback),
            only_peer,
            noderef: ctx.our_noderef.clone(),
            counter: ByteCounter::new(),
            ctx,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn byte_counter(&self) -> ByteCounter {
        self.counter.clone()
    }

    /// Run the session to completion. Always ends with the same cleanup:
    /// the registry releases the uid, and the originator callback gets its
    /// single `completed()`.
    pub async fn run(mut self) {
        let uid = self.uid;
        let registry = self.ctx.registry.clone();
        let source = self.source.clone();
        let callback = self.callback.clone();
        if let Err(e) = self.real_run().await {
            error!(uid, error = %e, "announcement session died unexpectedly");
        }
        if let Some(source) = &source {
            registry.peer_session_completed(source.id(), uid);
        }
        registry.session_completed(uid);
        if let Some(cb) = &callback {
            cb.completed();
        }
    }

    async fn real_run(&mut self) -> Result<()> {
        let uid = self.uid;

        if let Some(source) = self.source.clone() {
            // Admit the announcement so the upstream noderef transfer can
            // complete, then pull it in.
            if self
                .ctx
                .router
                .send(source.id(), Message::new(uid, Body::Accepted), &self.counter)
                .await
                .is_err()
            {
                return Ok(());
            }
            if !self.receive_inbound_noderef(&source).await? {
                return Ok(());
            }
        }

        // Reset hops if we are the closest node the announcement has seen;
        // otherwise this hop costs one.
        let my_loc = self.ctx.our_location;
        if my_loc.distance(self.target) < self.nearest.distance(self.target) {
            self.nearest = my_loc;
            self.htl = self.ctx.policy.max_htl();
        } else if let Some(source) = &self.source {
            self.htl = self.ctx.policy.decrement_htl(Some(source.id()), self.htl);
        }

        let mut routed_to: HashSet<PeerId> = HashSet::new();
        let mut has_forwarded = false;
        let mut decremented_for_attempt = false;

        'route: loop {
            debug!(uid, htl = self.htl, "routing announcement");
            if self.htl == 0 {
                self.complete().await;
                return Ok(());
            }

            let next = match &self.only_peer {
                Some(pinned) => {
                    if routed_to.contains(pinned.id()) {
                        self.rnf(Some(pinned.clone())).await;
                        return Ok(());
                    }
                    pinned.clone()
                }
                None => {
                    let source_id = self.source.as_ref().map(|s| *s.id());
                    match self
                        .ctx
                        .peers
                        .closer_peer(source_id.as_ref(), &routed_to, self.target)
                    {
                        Some(peer) => peer,
                        None => {
                            self.rnf(None).await;
                            return Ok(());
                        }
                    }
                }
            };
            debug!(uid, next = %next.id(), "picked next hop");
            routed_to.insert(*next.id());

            if has_forwarded && !decremented_for_attempt {
                let source_id = self.source.as_ref().map(|s| *s.id());
                self.htl = self.ctx.policy.decrement_htl(source_id.as_ref(), self.htl);
                decremented_for_attempt = true;
            }

            let started = match start_announcement(
                self.ctx.router.as_ref(),
                &self.ctx.pool,
                next.id(),
                uid,
                &self.noderef,
                self.htl,
                self.nearest,
                self.target,
                &self.counter,
            )
            .await
            {
                Ok(started) => started,
                Err(e) => {
                    debug!(uid, next = %next.id(), error = %e, "could not start transfer");
                    // No second decrement for the replacement peer.
                    continue 'route;
                }
            };
            has_forwarded = true;
            decremented_for_attempt = false;

            // Admission: will they take it?
            let admit = MessageFilter::any(vec![
                MessagePattern::new(MessageKind::Accepted, *next.id(), uid, ACCEPTED_TIMEOUT),
                MessagePattern::new(MessageKind::RejectedLoop, *next.id(), uid, ACCEPTED_TIMEOUT),
                MessagePattern::new(
                    MessageKind::RejectedOverload,
                    *next.id(),
                    uid,
                    ACCEPTED_TIMEOUT,
                ),
                MessagePattern::new(
                    MessageKind::OpennetDisabled,
                    *next.id(),
                    uid,
                    ACCEPTED_TIMEOUT,
                ),
            ]);
            let accepted = match self.ctx.waiter.wait_for(&admit, &self.counter).await {
                WaitOutcome::Matched(msg) => match msg.body {
                    Body::Accepted => true,
                    Body::RejectedLoop => {
                        debug!(uid, next = %next.id(), "rejected: loop");
                        false
                    }
                    Body::RejectedOverload { .. } => {
                        debug!(uid, next = %next.id(), "rejected: overload");
                        false
                    }
                    Body::OpennetDisabled => {
                        debug!(uid, next = %next.id(), "opennet disabled");
                        false
                    }
                    other => {
                        error!(uid, body = ?other, "unexpected admission message");
                        false
                    }
                },
                WaitOutcome::TimedOut => {
                    debug!(uid, next = %next.id(), "timeout waiting for accepted");
                    false
                }
                WaitOutcome::Disconnected(peer) => {
                    info!(uid, %peer, "disconnected while waiting for accepted");
                    false
                }
            };
            if !accepted {
                continue 'route;
            }
            debug!(uid, next = %next.id(), "got accepted");

            // Admitted; drain the rest of the noderef to them.
            if finish_announcement(self.ctx.router.as_ref(), next.id(), started, &self.counter)
                .await
                .is_err()
            {
                debug!(uid, next = %next.id(), "not connected while sending noderef");
                continue 'route;
            }

            // Body: replies, completion, or backtracking hints.
            loop {
                let body_filter = MessageFilter::any(vec![
                    MessagePattern::new(
                        MessageKind::AnnounceCompleted,
                        *next.id(),
                        uid,
                        ANNOUNCE_TIMEOUT,
                    ),
                    MessagePattern::new(
                        MessageKind::RouteNotFound,
                        *next.id(),
                        uid,
                        ANNOUNCE_TIMEOUT,
                    ),
                    MessagePattern::new(
                        MessageKind::RejectedOverload,
                        *next.id(),
                        uid,
                        ANNOUNCE_TIMEOUT,
                    ),
                    MessagePattern::new(
                        MessageKind::AnnounceReply,
                        *next.id(),
                        uid,
                        ANNOUNCE_TIMEOUT,
                    ),
                    MessagePattern::new(
                        MessageKind::OpennetDisabled,
                        *next.id(),
                        uid,
                        ANNOUNCE_TIMEOUT,
                    ),
                    MessagePattern::new(
                        MessageKind::NodeNotWanted,
                        *next.id(),
                        uid,
                        ANNOUNCE_TIMEOUT,
                    ),
                    // Only meaningful while the body is still uploading.
                    MessagePattern::new(
                        MessageKind::NoderefRejected,
                        *next.id(),
                        uid,
                        ACCEPTED_TIMEOUT,
                    ),
                ]);

                match self.ctx.waiter.wait_for(&body_filter, &self.counter).await {
                    WaitOutcome::Disconnected(peer) => {
                        info!(uid, %peer, "disconnected while waiting for announcement");
                        continue 'route;
                    }
                    WaitOutcome::TimedOut => {
                        // Nothing at all for the whole window: the hop is
                        // assumed lost, and so is the session.
                        warn!(uid, next = %next.id(), "fatal timeout waiting for announcement");
                        self.timed_out(&next).await;
                        return Ok(());
                    }
                    WaitOutcome::Matched(msg) => match msg.body {
                        Body::NoderefRejected { code } => {
                            info!(uid, next = %next.id(), %code, "announce rejected");
                            continue 'route;
                        }
                        Body::AnnounceCompleted => {
                            // Propagate right away: thirty seconds of drain
                            // per hop must not accumulate along the path.
                            self.complete().await;
                            self.drain(&next).await;
                            return Ok(());
                        }
                        Body::RouteNotFound { htl: new_htl } => {
                            if new_htl < self.htl {
                                self.htl = new_htl;
                            }
                            continue 'route;
                        }
                        Body::RejectedOverload { .. } => {
                            continue 'route;
                        }
                        Body::OpennetDisabled => {
                            debug!(uid, next = %next.id(), "opennet disabled");
                            continue 'route;
                        }
                        Body::AnnounceReply {
                            transfer_uid,
                            noderef_length,
                            padded_length,
                        } => {
                            if !self
                                .validate_forward_reply(
                                    &next,
                                    transfer_uid,
                                    noderef_length,
                                    padded_length,
                                )
                                .await
                            {
                                return Ok(());
                            }
                            // There may be more.
                        }
                        Body::NodeNotWanted => {
                            if !self.handle_not_wanted().await {
                                return Ok(());
                            }
                            // Propagated; they will still send a
                            // Completed or RouteNotFound.
                        }
                        other => {
                            error!(uid, body = ?other, "unexpected announcement message");
                        }
                    },
                }
            }
        }
    }

    /// Relay-mode admission: pull the originator's noderef in from the
    /// source, decide whether we want them ourselves, and keep the blob
    /// for forwarding. False means the session is over.
    async fn receive_inbound_noderef(&mut self, source: &Arc<Peer>) -> Result<bool> {
        let uid = self.uid;
        let Some(inbound) = self.inbound.take() else {
            anyhow::bail!("relay session without a pending inbound transfer");
        };
        let Some(blob) = wait_for_noderef(
            self.ctx.router.as_ref(),
            &self.ctx.pool,
            source.id(),
            inbound.transfer_uid,
            inbound.noderef_length,
            inbound.padded_length,
            &self.counter,
        )
        .await
        else {
            return Ok(false);
        };
        let Some(parsed) = self.ctx.validator.validate(&blob) else {
            let _ = transfer::reject_noderef(
                self.ctx.router.as_ref(),
                source.id(),
                uid,
                RejectCode::Invalid,
                &self.counter,
            )
            .await;
            return Ok(false);
        };
        self.noderef = blob;

        if self.ctx.peers.add_announced_node(&parsed).is_some() {
            // We took them; give them our ref as the first reply upstream.
            if let Err(e) = send_announcement_reply(
                self.ctx.router.as_ref(),
                &self.ctx.pool,
                source.id(),
                uid,
                &self.ctx.our_noderef,
                &self.counter,
            )
            .await
            {
                info!(uid, error = %e, "could not send our noderef back");
                return Ok(false);
            }
        } else {
            debug!(uid, "don't need the announced node, routing anyway");
            if !self.handle_not_wanted().await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Pull a reply noderef in, validate it, and either relay it upstream
    /// (relay mode) or offer it to the peer set (originator mode). False
    /// means we lost the upstream connection.
    async fn validate_forward_reply(
        &self,
        next: &Arc<Peer>,
        transfer_uid: u64,
        noderef_length: u32,
        padded_length: u32,
    ) -> bool {
        let uid = self.uid;
        let Some(blob) = wait_for_noderef(
            self.ctx.router.as_ref(),
            &self.ctx.pool,
            next.id(),
            transfer_uid,
            noderef_length,
            padded_length,
            &self.counter,
        )
        .await
        else {
            // Don't relay what we never got.
            return true;
        };
        let Some(parsed) = self.ctx.validator.validate(&blob) else {
            info!(uid, next = %next.id(), "reply noderef failed validation");
            if let Some(cb) = &self.callback {
                cb.bogus_noderef("invalid noderef");
            }
            return true;
        };

        if let Some(source) = &self.source {
            match send_announcement_reply(
                self.ctx.router.as_ref(),
                &self.ctx.pool,
                source.id(),
                uid,
                &blob,
                &self.counter,
            )
            .await
            {
                Ok(()) => true,
                Err(TransferError::NotConnected) => false,
                Err(e) => {
                    warn!(uid, error = %e, "could not relay reply");
                    true
                }
            }
        } else {
            match self.ctx.peers.add_announced_node(&parsed) {
                Some(peer) => {
                    if let Some(cb) = &self.callback {
                        cb.added_node(&peer);
                    }
                }
                None => {
                    if let Some(cb) = &self.callback {
                        cb.node_not_added();
                    }
                }
            }
            true
        }
    }

    /// Completion has been propagated; keep accepting late reordered
    /// replies from `next` under one 30-second wall-clock budget.
    async fn drain(&self, next: &Arc<Peer>) {
        let uid = self.uid;
        let drain_filter = MessageFilter::any(vec![
            MessagePattern::new(MessageKind::AnnounceReply, *next.id(), uid, END_TIMEOUT)
                .timeout_relative_to_creation(),
            MessagePattern::new(MessageKind::NodeNotWanted, *next.id(), uid, END_TIMEOUT)
                .timeout_relative_to_creation(),
        ]);
        loop {
            match self.ctx.waiter.wait_for(&drain_filter, &self.counter).await {
                WaitOutcome::TimedOut => return,
                WaitOutcome::Disconnected(_) => return,
                WaitOutcome::Matched(msg) => match msg.body {
                    Body::AnnounceReply {
                        transfer_uid,
                        noderef_length,
                        padded_length,
                    } => {
                        if !self
                            .validate_forward_reply(next, transfer_uid, noderef_length, padded_length)
                            .await
                        {
                            return;
                        }
                    }
                    Body::NodeNotWanted => {
                        if !self.handle_not_wanted().await {
                            return;
                        }
                    }
                    other => {
                        error!(uid, body = ?other, "unexpected message while draining");
                    }
                },
            }
        }
    }

    /// A node on the path does not want the announced node. Tell the
    /// callback, and pass it along upstream. False means the upstream
    /// connection is gone.
    async fn handle_not_wanted(&self) -> bool {
        if let Some(cb) = &self.callback {
            cb.node_not_wanted();
        }
        if let Some(source) = &self.source {
            if self
                .ctx
                .router
                .send(
                    source.id(),
                    Message::new(self.uid, Body::NodeNotWanted),
                    &self.counter,
                )
                .await
                .is_err()
            {
                error!(uid = self.uid, "lost connection to source");
                return false;
            }
        }
        true
    }

    /// The announcement ran its course here. Only the upstream cares.
    async fn complete(&self) {
        if let Some(source) = &self.source {
            let _ = self
                .ctx
                .router
                .send(
                    source.id(),
                    Message::new(self.uid, Body::AnnounceCompleted),
                    &self.counter,
                )
                .await;
        }
    }

    /// Backtracking ran out of peers within the hops we have.
    async fn rnf(&self, next: Option<Arc<Peer>>) {
        if let Some(source) = &self.source {
            let _ = self
                .ctx
                .router
                .send(
                    source.id(),
                    Message::new(self.uid, Body::RouteNotFound { htl: self.htl }),
                    &self.counter,
                )
                .await;
        }
        if let Some(cb) = &self.callback {
            match &next {
                Some(peer) => cb.node_failed(peer.id(), "route not found"),
                None => cb.no_more_nodes(),
            }
        }
    }

    /// Fatal body-phase timeout: the hop is assumed lost. Report a local
    /// overload upstream and fail the callback.
    async fn timed_out(&self, next: &Arc<Peer>) {
        if let Some(source) = &self.source {
            let _ = self
                .ctx
                .router
                .send(
                    source.id(),
                    Message::new(self.uid, Body::RejectedOverload { is_local: true }),
                    &self.counter,
                )
                .await;
        }
        if let Some(cb) = &self.callback {
            cb.node_failed(next.id(), "timed out");
        }
    }
}
