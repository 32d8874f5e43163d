//! Query orchestration
//!
//! Drives one query from submission to its terminal event: admission,
//! permission check, account resolution, session binding, then streaming
//! runtime frames through the normalizer. Every query's output ends in
//! exactly one terminal event, and its registry entry is released before the
//! event stream closes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::collab::{
    AccountDirectory, AuditEntry, AuditSink, ChatMessage, ChatStore, MessageRole, MetricsSink,
};
use crate::config::QuerySection;
use crate::constants;
use crate::error::QueryError;
use crate::events::{CompletionMeta, EventEnvelope, QueryEvent, StatusKind, TokenUsage};
use crate::normalizer::Normalizer;
use crate::registry::QueryRegistry;
use crate::runtime::{InvokeRequest, RuntimeBridge};
use crate::types::{Account, Attachment, Principal, ResourceKind, ResourceSelection};

mod prompt;

/// Lifecycle of one query. Transitions are logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Initializing,
    PermissionCheck,
    AccountResolution,
    SessionBinding,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// A submitted query
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query_id: String,
    pub query_text: String,
    pub principal: Principal,
    pub selection: ResourceSelection,
    pub session_id: Option<String>,
    pub model_id: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// External services the orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn AccountDirectory>,
    pub chat_store: Arc<dyn ChatStore>,
    pub audit: Arc<dyn AuditSink>,
    pub metrics: Arc<dyn MetricsSink>,
}

pub struct QueryOrchestrator {
    registry: QueryRegistry,
    bridge: RuntimeBridge,
    collab: Collaborators,
    config: QuerySection,
}

/// The event consumer went away
struct ConsumerGone;

/// Sends events for one query, stamping the bound session on each
struct Emitter {
    tx: mpsc::Sender<EventEnvelope>,
    cancel: CancellationToken,
    session_id: Option<String>,
    terminal_sent: bool,
    /// The runtime was already told to stop the bound session
    upstream_stopped: bool,
}

impl Emitter {
    async fn emit(&mut self, event: QueryEvent) -> Result<(), ConsumerGone> {
        let terminal = event.is_terminal();
        let envelope = EventEnvelope::new(event, self.session_id.clone());
        if self.tx.send(envelope).await.is_err() {
            // Nobody is listening; stop the query as if it were cancelled
            self.cancel.cancel();
            return Err(ConsumerGone);
        }
        self.terminal_sent |= terminal;
        Ok(())
    }

    async fn fail(&mut self, error: QueryError) -> Result<QueryState, ConsumerGone> {
        self.emit(QueryEvent::error(error.to_string())).await?;
        Ok(QueryState::Failed)
    }
}

/// What the streaming loop gathered
#[derive(Default)]
struct Streamed {
    reply: String,
    usage: Option<TokenUsage>,
    stop_reason: Option<String>,
}

impl Streamed {
    /// Emit normalized events, keeping the reply and usage. The completion is
    /// held back for the caller. Returns true when the runtime reported an error.
    async fn forward(
        &mut self,
        events: Vec<QueryEvent>,
        out: &mut Emitter,
    ) -> Result<bool, ConsumerGone> {
        for event in events {
            match &event {
                QueryEvent::Complete { stop_reason, .. } => {
                    self.stop_reason = stop_reason.clone();
                    continue;
                }
                QueryEvent::Chunk { content } => self.reply.push_str(content),
                QueryEvent::TokenUsage { usage } => self.usage = Some(usage.clone()),
                _ => {}
            }

            let upstream_error = matches!(event, QueryEvent::Error { .. });
            out.emit(event).await?;
            if upstream_error {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

enum StreamEnd {
    Finished(Streamed),
    Cancelled,
    Failed,
}

impl QueryOrchestrator {
    pub fn new(
        registry: QueryRegistry,
        bridge: RuntimeBridge,
        collab: Collaborators,
        config: QuerySection,
    ) -> Self {
        Self {
            registry,
            bridge,
            collab,
            config,
        }
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    /// Start a query. Events arrive on the returned stream in production order.
    ///
    /// The query runs on its own task. Cancelling `cancel` (or dropping the
    /// stream) stops it at the next frame boundary.
    pub fn run(
        self: &Arc<Self>,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> ReceiverStream<EventEnvelope> {
        let (tx, rx) = mpsc::channel(constants::query::EVENT_BUFFER);
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let query_id = request.query_id.clone();
            let registration = this.registry.register(
                &query_id,
                request.session_id.clone(),
                &request.principal.user_id,
                cancel.clone(),
            );

            let mut out = Emitter {
                tx,
                cancel: cancel.clone(),
                session_id: None,
                terminal_sent: false,
                upstream_stopped: false,
            };

            let state = match this.drive(request, &cancel, &mut out).await {
                Ok(state) => state,
                Err(ConsumerGone) => {
                    tracing::info!("Consumer of query {} went away, stopping", query_id);
                    match out.session_id.clone() {
                        Some(session_id) if !out.upstream_stopped => {
                            this.bridge.stop_session(&session_id).await;
                        }
                        _ => {}
                    }
                    QueryState::Cancelled
                }
            };
            if !out.terminal_sent && state != QueryState::Cancelled {
                tracing::warn!("Query {} ended without a terminal event", query_id);
            }

            // Release the registry entry before the event stream closes
            drop(registration);
            tracing::info!("Query {} finished: {:?}", query_id, state);
        });

        ReceiverStream::new(rx)
    }

    /// Request cancellation of a running query. False when the id is unknown.
    pub fn cancel(&self, query_id: &str) -> bool {
        self.registry.request_cancel(query_id)
    }

    fn enter(&self, query_id: &str, state: QueryState) {
        tracing::debug!("Query {} -> {:?}", query_id, state);
    }

    async fn drive(
        &self,
        request: QueryRequest,
        cancel: &CancellationToken,
        out: &mut Emitter,
    ) -> Result<QueryState, ConsumerGone> {
        let query_id = request.query_id.as_str();
        let principal = &request.principal;
        let started = Instant::now();
        self.enter(query_id, QueryState::Initializing);

        let limit = self.config.max_concurrent_per_principal;
        let active = self.registry.active_for(&principal.user_id);
        if active > limit {
            tracing::warn!(
                "User {} has {} active queries (limit {}), rejecting {}",
                principal.user_id,
                active,
                limit,
                query_id
            );
            return out.fail(QueryError::QuotaExceeded { limit }).await;
        }

        self.audit(&request);

        self.enter(query_id, QueryState::PermissionCheck);
        let resolution = match self
            .collab
            .directory
            .resolve(principal, &request.selection)
            .await
        {
            Ok(resolution) => resolution,
            Err(e) => {
                tracing::error!("Account lookup for query {} failed: {:#}", query_id, e);
                return out.fail(QueryError::AccountLookup(e.to_string())).await;
            }
        };
        if principal.is_elevated() {
            tracing::debug!("Elevated principal {} skips permission check", principal.user_id);
        } else if !resolution.allowed() {
            tracing::warn!(
                "User {} denied access to {:?}",
                principal.user_id,
                resolution.denied
            );
            let denied = prompt::denied_list(&resolution.denied);
            return out.fail(QueryError::Unauthorized(denied)).await;
        }

        self.enter(query_id, QueryState::AccountResolution);
        let Some(account) = pick_account(&request.selection, &resolution.resources) else {
            tracing::info!("User {} has no cloud accounts configured", principal.user_id);
            out.emit(QueryEvent::Response {
                content: prompt::NO_ACCOUNT_GUIDANCE.to_string(),
            })
            .await?;
            return Ok(QueryState::Completed);
        };

        self.enter(query_id, QueryState::SessionBinding);
        if let Some((session_id, created)) = self.bind_session(&request).await {
            self.registry.set_session(query_id, Some(session_id.clone()));
            out.session_id = Some(session_id.clone());
            if created {
                out.emit(QueryEvent::SessionCreated { session_id }).await?;
            }
        }

        out.emit(QueryEvent::Status {
            status_type: StatusKind::Initializing,
            message: "Preparing account connection...".to_string(),
        })
        .await?;

        let prompt_text = prompt::enhanced_prompt(&request.query_text, &account);
        self.persist(
            out.session_id.as_deref(),
            principal,
            MessageRole::User,
            &request.query_text,
            prompt::user_message_metadata(&request.attachments),
        )
        .await;

        out.emit(QueryEvent::Status {
            status_type: StatusKind::Processing,
            message: format!("Connected to {}, starting analysis...", account.display_name),
        })
        .await?;

        self.enter(query_id, QueryState::Streaming);
        tracing::info!(
            "Starting query {} for user {} on {} account {} (session: {:?})",
            query_id,
            principal.user_id,
            account.kind.as_str(),
            account.id,
            out.session_id
        );

        let mut invoke = InvokeRequest::new(
            prompt_text,
            account.id.clone(),
            account.kind,
            principal.user_id.clone(),
        );
        invoke.session_id = out.session_id.clone();
        invoke.org_id = principal.org_id.clone();
        invoke.model_id = request.model_id.clone();
        invoke.attachments = request.attachments.clone();

        let streamed = match self.stream(query_id, invoke, cancel, out).await? {
            StreamEnd::Finished(streamed) => streamed,
            StreamEnd::Cancelled => return Ok(QueryState::Cancelled),
            StreamEnd::Failed => return Ok(QueryState::Failed),
        };

        let elapsed = started.elapsed();
        self.collab.metrics.record_query(&account.id, elapsed);
        self.finish(&request, streamed, elapsed, out).await
    }

    /// Pump frames through the normalizer until the stream ends, fails, or is cancelled
    async fn stream(
        &self,
        query_id: &str,
        invoke: InvokeRequest,
        cancel: &CancellationToken,
        out: &mut Emitter,
    ) -> Result<StreamEnd, ConsumerGone> {
        if cancel.is_cancelled() {
            return self.acknowledge_cancel(query_id, out).await;
        }

        let mut frames = self.bridge.invoke(invoke);
        let mut normalizer = Normalizer::new();
        let mut streamed = Streamed::default();
        let mut frame_count = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                frame = frames.next() => Some(frame),
            };
            let Some(next) = next else {
                return self.acknowledge_cancel(query_id, out).await;
            };

            let frame = match next {
                None => break,
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::error!(
                        "Runtime stream for query {} failed after {} frames: {}",
                        query_id,
                        frame_count,
                        e
                    );
                    out.fail(QueryError::Bridge(e)).await?;
                    return Ok(StreamEnd::Failed);
                }
            };
            frame_count += 1;

            if streamed.forward(normalizer.parse(frame), out).await? {
                tracing::error!("Runtime reported an error for query {}", query_id);
                return Ok(StreamEnd::Failed);
            }
        }

        // A stream cut short of its message stop may still hold buffered text
        streamed.forward(normalizer.finish(), out).await?;

        tracing::debug!("Runtime stream for query {} ended after {} frames", query_id, frame_count);
        Ok(StreamEnd::Finished(streamed))
    }

    async fn acknowledge_cancel(
        &self,
        query_id: &str,
        out: &mut Emitter,
    ) -> Result<StreamEnd, ConsumerGone> {
        tracing::info!("Query {} cancelled", query_id);
        let sent = out
            .emit(QueryEvent::GenerationCancelled {
                query_id: query_id.to_string(),
                message: "Generation cancelled".to_string(),
            })
            .await;
        if let Some(session_id) = out.session_id.clone() {
            self.bridge.stop_session(&session_id).await;
            out.upstream_stopped = true;
        }
        sent.map(|_| StreamEnd::Cancelled)
    }

    async fn finish(
        &self,
        request: &QueryRequest,
        streamed: Streamed,
        elapsed: Duration,
        out: &mut Emitter,
    ) -> Result<QueryState, ConsumerGone> {
        let duration_ms = elapsed.as_millis() as u64;

        if streamed.reply.trim().is_empty() {
            tracing::error!(
                "Runtime returned an empty reply for query {} after {}ms",
                request.query_id,
                duration_ms
            );
            out.emit(QueryEvent::Complete {
                success: false,
                stop_reason: streamed.stop_reason,
                error: Some(
                    "The runtime returned no response, please retry or simplify the question"
                        .to_string(),
                ),
                meta: CompletionMeta {
                    query_id: Some(request.query_id.clone()),
                    duration_ms: Some(duration_ms),
                    response_length: Some(0),
                },
                token_usage: streamed.usage,
            })
            .await?;
            return Ok(QueryState::Failed);
        }

        let metadata = match &streamed.usage {
            Some(usage) => json!({ "token_usage": usage }),
            None => json!({}),
        };
        self.persist(
            out.session_id.as_deref(),
            &request.principal,
            MessageRole::Assistant,
            streamed.reply.trim(),
            metadata,
        )
        .await;

        tracing::info!(
            "Query {} completed in {}ms ({} chars)",
            request.query_id,
            duration_ms,
            streamed.reply.len()
        );
        out.emit(QueryEvent::Complete {
            success: true,
            stop_reason: streamed.stop_reason,
            error: None,
            meta: CompletionMeta {
                query_id: Some(request.query_id.clone()),
                duration_ms: Some(duration_ms),
                response_length: Some(streamed.reply.len()),
            },
            token_usage: streamed.usage,
        })
        .await?;
        Ok(QueryState::Completed)
    }

    fn audit(&self, request: &QueryRequest) {
        for (kind, ids) in [
            (ResourceKind::Aws, &request.selection.aws),
            (ResourceKind::Gcp, &request.selection.gcp),
        ] {
            if !ids.is_empty() {
                self.collab.audit.record(AuditEntry::query(
                    &request.principal,
                    kind,
                    ids,
                    request.session_id.as_deref(),
                ));
            }
        }
    }

    /// Reuse, adopt or create the query's session.
    ///
    /// Returns the session id and whether it was newly created. Any storage
    /// failure leaves the query without a session.
    async fn bind_session(&self, request: &QueryRequest) -> Option<(String, bool)> {
        let store = Arc::clone(&self.collab.chat_store);
        let principal = request.principal.clone();
        let requested = request.session_id.clone();
        let title = prompt::session_title(&request.query_text);

        let bound = tokio::task::spawn_blocking(move || -> anyhow::Result<(String, bool)> {
            if let Some(id) = requested.as_deref() {
                match store.get_session(id)? {
                    Some(session) if session.user_id == principal.user_id => {
                        tracing::debug!("Reusing session {}", id);
                        return Ok((session.id, false));
                    }
                    Some(_) => {
                        tracing::warn!(
                            "Session {} belongs to another user, starting a new one for {}",
                            id,
                            principal.user_id
                        );
                    }
                    None => {
                        let session = store.create_session(&principal, &title, Some(id))?;
                        return Ok((session.id, true));
                    }
                }
            }
            let session = store.create_session(&principal, &title, None)?;
            tracing::info!("Created session {}", session.id);
            Ok((session.id, true))
        })
        .await;

        match bound {
            Ok(Ok(bound)) => Some(bound),
            Ok(Err(e)) => {
                tracing::warn!(
                    "Session binding for query {} failed, continuing without a session: {:#}",
                    request.query_id,
                    e
                );
                None
            }
            Err(e) => {
                tracing::warn!("Session binding task for {} panicked: {}", request.query_id, e);
                None
            }
        }
    }

    /// Best-effort write of one turn. Failures are logged only.
    async fn persist(
        &self,
        session_id: Option<&str>,
        principal: &Principal,
        role: MessageRole,
        content: &str,
        metadata: serde_json::Value,
    ) {
        let Some(session_id) = session_id else {
            return;
        };
        let store = Arc::clone(&self.collab.chat_store);
        let message = ChatMessage {
            session_id: session_id.to_string(),
            user_id: principal.user_id.clone(),
            role,
            content: content.to_string(),
            metadata,
        };

        match tokio::task::spawn_blocking(move || store.save_message(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                "Failed to save {} message to session {}: {:#}",
                role.as_str(),
                session_id,
                e
            ),
            Err(e) => tracing::warn!("Save task for session {} panicked: {}", session_id, e),
        }
    }
}

/// First requested account the principal can use, else their first account
fn pick_account(selection: &ResourceSelection, resources: &[Account]) -> Option<Account> {
    selection
        .ids()
        .find_map(|(id, kind)| resources.iter().find(|a| a.id == id && a.kind == kind))
        .or_else(|| resources.first())
        .cloned()
}
