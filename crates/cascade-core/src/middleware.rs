//! Middleware pipeline for gating socket actions.
//!
//! The server runs five named stages: `handshake`, `emit`, `subscribe`,
//! `publishIn`, and `publishOut`. Each stage holds an ordered list of
//! gates. A run invokes the gates sequentially; every gate receives the
//! stage's request record plus a single-shot [`GateControl`] and must
//! settle it exactly once with allow, silent block, or an error. The
//! first non-allow decision short-circuits the run.

use crate::error::CascadeError;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::debug;

/// The named stages of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MiddlewareStage {
    /// Gates the transport upgrade, before a session exists.
    Handshake,
    /// Gates non-reserved inbound events.
    Emit,
    /// Gates `#subscribe`.
    Subscribe,
    /// Gates inbound `#publish`.
    PublishIn,
    /// Gates each outbound channel delivery, per subscriber.
    PublishOut,
}

impl fmt::Display for MiddlewareStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MiddlewareStage::Handshake => "handshake",
            MiddlewareStage::Emit => "emit",
            MiddlewareStage::Subscribe => "subscribe",
            MiddlewareStage::PublishIn => "publishIn",
            MiddlewareStage::PublishOut => "publishOut",
        };
        write!(f, "{name}")
    }
}

/// A read-only view of the session a request belongs to.
#[derive(Debug, Clone)]
pub struct SocketRef {
    /// Server-assigned socket id.
    pub id: String,
    /// Decoded auth token, if the session is authenticated.
    pub auth_token: Option<Value>,
    /// Peer address, when the transport knows it.
    pub remote_addr: Option<String>,
}

/// Request record for the `handshake` stage.
///
/// The origin policy has already accepted this request.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// The `Origin` header of the upgrade request.
    pub origin: Option<String>,
    /// The request path.
    pub path: String,
    /// Peer address.
    pub remote_addr: Option<String>,
}

/// Request record for the `emit` stage.
#[derive(Debug, Clone)]
pub struct EmitRequest {
    /// The emitting session.
    pub socket: SocketRef,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub data: Option<Value>,
    /// Present when the session's token expired at dispatch time.
    pub auth_token_expired_error: Option<CascadeError>,
}

/// Request record for the `subscribe` stage.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    /// The subscribing session.
    pub socket: SocketRef,
    /// Target channel.
    pub channel: String,
    /// Present when the session's token expired at dispatch time.
    pub auth_token_expired_error: Option<CascadeError>,
}

/// Request record for the `publishIn` stage.
#[derive(Debug, Clone)]
pub struct PublishInRequest {
    /// The publishing session.
    pub socket: SocketRef,
    /// Target channel.
    pub channel: String,
    /// Published value.
    pub data: Option<Value>,
    /// Present when the session's token expired at dispatch time.
    pub auth_token_expired_error: Option<CascadeError>,
}

/// Request record for the `publishOut` stage.
#[derive(Debug, Clone)]
pub struct PublishOutRequest {
    /// The receiving session.
    pub socket: SocketRef,
    /// Source channel.
    pub channel: String,
    /// Published value.
    pub data: Option<Value>,
}

/// A gate's verdict on one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Let the action proceed to the next gate.
    Allow,
    /// Reject without emitting a warning.
    SilentBlock,
    /// Reject with a descriptive error.
    Block(CascadeError),
}

/// The outcome of running a full stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Every gate allowed the action.
    Allowed,
    /// A gate rejected the action.
    Blocked {
        /// The rejection delivered to the caller.
        error: CascadeError,
        /// Whether the rejection suppressed the warning path.
        silent: bool,
    },
}

impl StageOutcome {
    /// Whether the action may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, StageOutcome::Allowed)
    }
}

/// Sink for pipeline warnings (rejections and double callbacks).
pub type WarningSink = Arc<dyn Fn(CascadeError) + Send + Sync>;

/// Single-shot continuation handed to each gate.
///
/// A gate settles it exactly once; a second settlement emits a
/// `MiddlewareDoubleCallback` warning and is otherwise ignored. Dropping
/// the control without settling abandons the request (silent block).
pub struct GateControl {
    stage: MiddlewareStage,
    slot: Mutex<Option<oneshot::Sender<Decision>>>,
    warnings: WarningSink,
}

impl GateControl {
    fn new(
        stage: MiddlewareStage,
        sender: oneshot::Sender<Decision>,
        warnings: WarningSink,
    ) -> Self {
        Self {
            stage,
            slot: Mutex::new(Some(sender)),
            warnings,
        }
    }

    /// Let the request proceed to the next gate.
    pub fn allow(&self) {
        self.settle(Decision::Allow);
    }

    /// Reject the request without a server-side warning.
    pub fn block_silently(&self) {
        self.settle(Decision::SilentBlock);
    }

    /// Reject the request with a descriptive error.
    pub fn block(&self, error: impl Into<CascadeError>) {
        self.settle(Decision::Block(error.into()));
    }

    fn settle(&self, decision: Decision) {
        let sender = self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        match sender {
            Some(sender) => {
                // The run may have been abandoned; a dead receiver is fine.
                let _ = sender.send(decision);
            }
            None => (self.warnings)(CascadeError::MiddlewareDoubleCallback { stage: self.stage }),
        }
    }
}

impl fmt::Debug for GateControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateControl")
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

/// Identity of a registered gate, used for removal.
pub type GateId = u64;

type Gate<R> = Arc<dyn Fn(&R, GateControl) + Send + Sync>;

struct StageList<R> {
    gates: RwLock<Vec<(GateId, Gate<R>)>>,
}

impl<R> StageList<R> {
    fn new() -> Self {
        Self {
            gates: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, id: GateId, gate: Gate<R>) {
        self.gates
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, gate));
    }

    fn remove(&self, id: GateId) -> bool {
        let mut gates = self.gates.write().unwrap_or_else(|e| e.into_inner());
        let before = gates.len();
        gates.retain(|(gate_id, _)| *gate_id != id);
        gates.len() != before
    }

    /// Snapshot the list so registration during a run affects later runs only.
    fn snapshot(&self) -> Vec<Gate<R>> {
        self.gates
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, gate)| Arc::clone(gate))
            .collect()
    }
}

/// The five-stage middleware pipeline.
pub struct MiddlewarePipeline {
    next_id: AtomicU64,
    emit_warnings: bool,
    warnings: WarningSink,
    handshake: StageList<HandshakeRequest>,
    emit: StageList<EmitRequest>,
    subscribe: StageList<SubscribeRequest>,
    publish_in: StageList<PublishInRequest>,
    publish_out: StageList<PublishOutRequest>,
}

impl MiddlewarePipeline {
    /// Create a pipeline.
    ///
    /// `emit_warnings` controls whether non-silent rejections are
    /// reported through `warnings`; double-callback warnings are always
    /// reported.
    #[must_use]
    pub fn new(emit_warnings: bool, warnings: WarningSink) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            emit_warnings,
            warnings,
            handshake: StageList::new(),
            emit: StageList::new(),
            subscribe: StageList::new(),
            publish_in: StageList::new(),
            publish_out: StageList::new(),
        }
    }

    fn allocate_id(&self) -> GateId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a `handshake` gate; returns its id for removal.
    pub fn add_handshake(
        &self,
        gate: impl Fn(&HandshakeRequest, GateControl) + Send + Sync + 'static,
    ) -> GateId {
        let id = self.allocate_id();
        self.handshake.add(id, Arc::new(gate));
        id
    }

    /// Register an `emit` gate; returns its id for removal.
    pub fn add_emit(
        &self,
        gate: impl Fn(&EmitRequest, GateControl) + Send + Sync + 'static,
    ) -> GateId {
        let id = self.allocate_id();
        self.emit.add(id, Arc::new(gate));
        id
    }

    /// Register a `subscribe` gate; returns its id for removal.
    pub fn add_subscribe(
        &self,
        gate: impl Fn(&SubscribeRequest, GateControl) + Send + Sync + 'static,
    ) -> GateId {
        let id = self.allocate_id();
        self.subscribe.add(id, Arc::new(gate));
        id
    }

    /// Register a `publishIn` gate; returns its id for removal.
    pub fn add_publish_in(
        &self,
        gate: impl Fn(&PublishInRequest, GateControl) + Send + Sync + 'static,
    ) -> GateId {
        let id = self.allocate_id();
        self.publish_in.add(id, Arc::new(gate));
        id
    }

    /// Register a `publishOut` gate; returns its id for removal.
    pub fn add_publish_out(
        &self,
        gate: impl Fn(&PublishOutRequest, GateControl) + Send + Sync + 'static,
    ) -> GateId {
        let id = self.allocate_id();
        self.publish_out.add(id, Arc::new(gate));
        id
    }

    /// Remove a gate by stage and identity.
    ///
    /// Returns `false` when no such gate is registered.
    pub fn remove(&self, stage: MiddlewareStage, id: GateId) -> bool {
        match stage {
            MiddlewareStage::Handshake => self.handshake.remove(id),
            MiddlewareStage::Emit => self.emit.remove(id),
            MiddlewareStage::Subscribe => self.subscribe.remove(id),
            MiddlewareStage::PublishIn => self.publish_in.remove(id),
            MiddlewareStage::PublishOut => self.publish_out.remove(id),
        }
    }

    async fn run<R>(&self, stage: MiddlewareStage, list: &StageList<R>, request: &R) -> StageOutcome {
        for gate in list.snapshot() {
            let (sender, receiver) = oneshot::channel();
            let control = GateControl::new(stage, sender, Arc::clone(&self.warnings));
            gate(request, control);

            // A dropped control abandons the request.
            let decision = receiver.await.unwrap_or(Decision::SilentBlock);

            match decision {
                Decision::Allow => continue,
                Decision::SilentBlock => {
                    debug!(stage = %stage, "middleware silently blocked request");
                    return StageOutcome::Blocked {
                        error: CascadeError::SilentMiddlewareBlocked { stage },
                        silent: true,
                    };
                }
                Decision::Block(error) => {
                    if self.emit_warnings {
                        (self.warnings)(error.clone());
                    }
                    return StageOutcome::Blocked {
                        error,
                        silent: false,
                    };
                }
            }
        }

        StageOutcome::Allowed
    }

    /// Run the `handshake` stage.
    pub async fn run_handshake(&self, request: &HandshakeRequest) -> StageOutcome {
        self.run(MiddlewareStage::Handshake, &self.handshake, request)
            .await
    }

    /// Run the `emit` stage.
    pub async fn run_emit(&self, request: &EmitRequest) -> StageOutcome {
        self.run(MiddlewareStage::Emit, &self.emit, request).await
    }

    /// Run the `subscribe` stage.
    pub async fn run_subscribe(&self, request: &SubscribeRequest) -> StageOutcome {
        self.run(MiddlewareStage::Subscribe, &self.subscribe, request)
            .await
    }

    /// Run the `publishIn` stage.
    pub async fn run_publish_in(&self, request: &PublishInRequest) -> StageOutcome {
        self.run(MiddlewareStage::PublishIn, &self.publish_in, request)
            .await
    }

    /// Run the `publishOut` stage.
    pub async fn run_publish_out(&self, request: &PublishOutRequest) -> StageOutcome {
        self.run(MiddlewareStage::PublishOut, &self.publish_out, request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn collecting_sink() -> (WarningSink, Arc<Mutex<Vec<CascadeError>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink_target = Arc::clone(&collected);
        let sink: WarningSink = Arc::new(move |error| {
            sink_target.lock().unwrap().push(error);
        });
        (sink, collected)
    }

    fn emit_request() -> EmitRequest {
        EmitRequest {
            socket: SocketRef {
                id: "socket-1".into(),
                auth_token: None,
                remote_addr: None,
            },
            event: "chat".into(),
            data: None,
            auth_token_expired_error: None,
        }
    }

    #[tokio::test]
    async fn test_empty_stage_allows() {
        let (sink, _) = collecting_sink();
        let pipeline = MiddlewarePipeline::new(true, sink);
        assert!(pipeline.run_emit(&emit_request()).await.is_allowed());
    }

    #[tokio::test]
    async fn test_gates_run_in_registration_order() {
        let (sink, _) = collecting_sink();
        let pipeline = MiddlewarePipeline::new(true, sink);
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            pipeline.add_emit(move |_, control| {
                order.lock().unwrap().push(label);
                control.allow();
            });
        }

        assert!(pipeline.run_emit(&emit_request()).await.is_allowed());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_rejection_short_circuits_and_warns() {
        let (sink, warnings) = collecting_sink();
        let pipeline = MiddlewarePipeline::new(true, sink);
        let later_ran = Arc::new(AtomicUsize::new(0));

        pipeline.add_emit(|_, control| control.block(CascadeError::custom("Denied", "no")));
        let counter = Arc::clone(&later_ran);
        pipeline.add_emit(move |_, control| {
            counter.fetch_add(1, Ordering::SeqCst);
            control.allow();
        });

        let outcome = pipeline.run_emit(&emit_request()).await;
        match outcome {
            StageOutcome::Blocked { error, silent } => {
                assert_eq!(error.name(), "Denied");
                assert!(!silent);
            }
            StageOutcome::Allowed => panic!("expected a block"),
        }
        assert_eq!(later_ran.load(Ordering::SeqCst), 0);
        assert_eq!(warnings.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_without_warnings_configured() {
        let (sink, warnings) = collecting_sink();
        let pipeline = MiddlewarePipeline::new(false, sink);

        pipeline.add_subscribe(|_, control| control.block(CascadeError::custom("Denied", "no")));

        let request = SubscribeRequest {
            socket: emit_request().socket,
            channel: "room".into(),
            auth_token_expired_error: None,
        };
        assert!(!pipeline.run_subscribe(&request).await.is_allowed());
        assert!(warnings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_silent_block_emits_no_warning() {
        let (sink, warnings) = collecting_sink();
        let pipeline = MiddlewarePipeline::new(true, sink);

        pipeline.add_subscribe(|_, control| control.block_silently());

        let request = SubscribeRequest {
            socket: emit_request().socket,
            channel: "room".into(),
            auth_token_expired_error: None,
        };
        match pipeline.run_subscribe(&request).await {
            StageOutcome::Blocked { error, silent } => {
                assert_eq!(error.name(), "SilentMiddlewareBlocked");
                assert!(silent);
            }
            StageOutcome::Allowed => panic!("expected a block"),
        }
        assert!(warnings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_double_callback_warns_and_keeps_first_decision() {
        let (sink, warnings) = collecting_sink();
        let pipeline = MiddlewarePipeline::new(true, sink);

        pipeline.add_emit(|_, control| {
            control.allow();
            control.block(CascadeError::custom("Late", "too late"));
        });

        assert!(pipeline.run_emit(&emit_request()).await.is_allowed());
        let warnings = warnings.lock().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].name(), "MiddlewareDoubleCallback");
    }

    #[tokio::test]
    async fn test_asynchronous_gate_decision() {
        let (sink, _) = collecting_sink();
        let pipeline = MiddlewarePipeline::new(true, sink);

        pipeline.add_emit(|_, control| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                control.allow();
            });
        });

        assert!(pipeline.run_emit(&emit_request()).await.is_allowed());
    }

    #[tokio::test]
    async fn test_dropped_control_abandons_request() {
        let (sink, warnings) = collecting_sink();
        let pipeline = MiddlewarePipeline::new(true, sink);

        pipeline.add_emit(|_, _control| {
            // Dropped without settling.
        });

        match pipeline.run_emit(&emit_request()).await {
            StageOutcome::Blocked { silent, .. } => assert!(silent),
            StageOutcome::Allowed => panic!("expected a block"),
        }
        assert!(warnings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_by_identity() {
        let (sink, _) = collecting_sink();
        let pipeline = MiddlewarePipeline::new(true, sink);

        let id = pipeline.add_emit(|_, control| control.block_silently());
        assert!(!pipeline.run_emit(&emit_request()).await.is_allowed());

        assert!(pipeline.remove(MiddlewareStage::Emit, id));
        assert!(pipeline.run_emit(&emit_request()).await.is_allowed());

        // Second removal is a no-op.
        assert!(!pipeline.remove(MiddlewareStage::Emit, id));
    }

    #[tokio::test]
    async fn test_stage_name_rendering() {
        assert_eq!(MiddlewareStage::PublishIn.to_string(), "publishIn");
        assert_eq!(MiddlewareStage::PublishOut.to_string(), "publishOut");
        assert_eq!(MiddlewareStage::Handshake.to_string(), "handshake");
    }
}
