//! Streaming Generation Controller.
//!
//! `start` runs every step up to the first engine token while the request
//! is still open (validating, searching, debiting, prompting), so any failure
//! in that window is returned as a JSON error. After the first stream opens,
//! a task drives it and forwards text through a bounded channel to the
//! response body:
//!
//! ```text
//! idle -> validating -> [searching] -> debiting -> prompting -> generating <-> tool_call
//!                                                             -> finished | aborted | errored
//! ```
//!
//! Dropping the response body cancels the session. After an abort nothing
//! more is written and the auditor does not run. A mid-stream engine failure
//! ends the prose but still closes the response with the suffix markers.

use crate::config::ChatConfig;
use crate::error::PipelineError;
use crate::models::{ChatRequest, GenerationSession, Role, SearchResult, SessionState, ToolCallRecord};
use crate::services::auditor;
use crate::services::gate::{AdmittedRequest, Caller, Identity, RequestGate};
use crate::services::ledger::{DebitContext, LedgerGuard};
use crate::services::markers::{self, MarkerFilter, RetrievalCard};
use crate::services::metrics;
use crate::services::prompt::{self, PromptContext};
use crate::services::providers::{
    EngineEvent, EngineStream, GenerationEngine, GenerationRequest, ProviderError, ToolInvocation,
    Turn,
};
use crate::services::search::{
    ParallelBackend, QueryExpander, SearchKeys, SearchOrchestrator, SearchPlan, TavilyBackend,
};
use crate::services::stores::{CreditStore, GuestQuotaStore, PreferenceStore};
use crate::services::tier::{TierAuthority, TierReason};
use crate::services::tools::{first_url, PageFetcher, ToolBox, ToolName, ToolScope, WeatherClient};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::json;
use service_core::error::AppError;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

const CHANNEL_CAPACITY: usize = 64;
const ENGINE_KEY_NAME: &str = "generation engine";
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborators the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn GenerationEngine>,
    pub credits: Arc<dyn CreditStore>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub guest_quota: Arc<dyn GuestQuotaStore>,
}

pub struct ChatPipeline {
    config: Arc<ChatConfig>,
    engine: Arc<dyn GenerationEngine>,
    preferences: Arc<dyn PreferenceStore>,
    orchestrator: Arc<SearchOrchestrator>,
    pages: Arc<PageFetcher>,
    gate: RequestGate,
    tier: TierAuthority,
    ledger: LedgerGuard,
    tools: ToolBox,
}

/// Body of an accepted request. Dropping it cancels generation.
pub struct ChatStream {
    pub request_id: String,
    receiver: mpsc::Receiver<String>,
    guard: DropGuard,
}

impl ChatStream {
    pub fn into_body_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        let guard = self.guard;
        ReceiverStream::new(self.receiver).map(move |chunk| {
            let _cancel_on_drop = &guard;
            Ok(Bytes::from(chunk))
        })
    }
}

/// State handed from the request to the drive task.
struct Prepared {
    request: GenerationRequest,
    stream: EngineStream,
    tools: Vec<ToolName>,
    search_plan: Option<SearchPlan>,
    card: RetrievalCard,
    model_id: String,
}

enum TurnEnd {
    Done,
    Tools {
        text: String,
        calls: Vec<ToolInvocation>,
    },
    Failed,
    Aborted,
}

/// Writes chunks to the client and mirrors them into the session transcript.
struct Emitter {
    sender: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Emitter {
    /// Returns false once the client is gone. That also cancels the session.
    async fn emit(&self, session: &mut GenerationSession, chunk: String) -> bool {
        if chunk.is_empty() {
            return !self.cancel.is_cancelled();
        }
        session.text.push_str(&chunk);
        if self.sender.send(chunk).await.is_err() {
            self.cancel.cancel();
            return false;
        }
        true
    }
}

fn history_turns(request: &ChatRequest) -> Vec<Turn> {
    request
        .messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| match m.role {
            Role::User => Turn::User(m.content.clone()),
            Role::Assistant => Turn::Assistant(markers::strip_markers(&m.content)),
        })
        .collect()
}

fn nonblank(key: Option<&String>) -> Option<String> {
    key.map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

impl ChatPipeline {
    /// Wire the pipeline from configuration and collaborators.
    pub fn from_config(config: Arc<ChatConfig>, deps: Collaborators) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;

        let search = &config.search;
        let orchestrator = Arc::new(SearchOrchestrator::new(
            Arc::new(ParallelBackend::new(
                http.clone(),
                &search.parallel_base_url,
                search.search_timeout,
            )),
            Arc::new(TavilyBackend::new(
                http.clone(),
                &search.tavily_base_url,
                search.search_timeout,
            )),
            QueryExpander::new(
                deps.engine.clone(),
                &search.expansion_model,
                search.expansion_timeout,
            ),
            SearchKeys {
                parallel: search.parallel_api_key.clone(),
                tavily: search.tavily_api_key.clone(),
            },
        ));
        let pages = Arc::new(PageFetcher::new(
            http.clone(),
            config.tools.retrieval_max_chars,
            config.tools.retrieval_timeout,
        ));
        let weather = WeatherClient::new(
            http,
            &config.tools.geocoding_base_url,
            &config.tools.forecast_base_url,
        );

        Ok(Self::new(config, deps, orchestrator, pages, weather))
    }

    pub fn new(
        config: Arc<ChatConfig>,
        deps: Collaborators,
        orchestrator: Arc<SearchOrchestrator>,
        pages: Arc<PageFetcher>,
        weather: WeatherClient,
    ) -> Self {
        Self {
            gate: RequestGate::new(config.clone(), deps.guest_quota),
            tier: TierAuthority::new(deps.credits.clone()),
            ledger: LedgerGuard::new(deps.credits, config.credits.debit_timeout),
            tools: ToolBox::new(orchestrator.clone(), pages.clone(), weather),
            engine: deps.engine,
            preferences: deps.preferences,
            orchestrator,
            pages,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<dyn GenerationEngine> {
        &self.engine
    }

    /// Admit the request and open the first engine stream. Nothing has been
    /// written to the client when this returns an error.
    #[tracing::instrument(skip_all, fields(request_id = %request_id))]
    pub async fn start(
        self: &Arc<Self>,
        request: ChatRequest,
        identity: Identity,
        request_id: String,
    ) -> Result<ChatStream, PipelineError> {
        let cancel = CancellationToken::new();
        let mut session = GenerationSession::new(request_id.clone(), cancel.clone());

        let prepared = match self.prepare(&mut session, request, &identity).await {
            Ok(prepared) => prepared,
            Err(e) => {
                session.transition(SessionState::Errored);
                return Err(e);
            }
        };

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.drive(session, prepared, sender).await });

        Ok(ChatStream {
            request_id,
            receiver,
            guard: cancel.drop_guard(),
        })
    }

    async fn prepare(
        &self,
        session: &mut GenerationSession,
        request: ChatRequest,
        identity: &Identity,
    ) -> Result<Prepared, PipelineError> {
        session.transition(SessionState::Validating);
        let AdmittedRequest {
            request,
            caller,
            model,
            query,
        } = self.gate.admit(request, identity).await?;
        let own_key = request.has_own_key();

        let decision = self
            .tier
            .evaluate(&model, &caller, own_key)
            .await?
            .into_result(&model)?;

        tracing::info!(
            caller = %caller.log_id(),
            guest = caller.is_guest(),
            model = %model.id,
            own_key,
            web_search = request.web_search,
            "Request admitted"
        );

        // Keys are fixed here, before any external call.
        let search_plan = match &caller {
            Caller::Guest { .. } => None,
            Caller::User { user_id, .. } => {
                let prefs = self
                    .preferences
                    .search_preferences(user_id)
                    .await
                    .map_err(|e| PipelineError::Processing(anyhow::Error::new(e)))?;
                let backend = prefs.backend.unwrap_or(self.config.search.default_backend);
                let planned = self.orchestrator.plan(
                    backend,
                    &prefs.keys(),
                    request.user_search_api_key.as_deref(),
                );
                match planned {
                    Ok(plan) => Some(plan),
                    Err(e) if request.web_search => return Err(e.into()),
                    Err(e) => {
                        tracing::debug!(error = %e, "Search tool disabled for this request");
                        None
                    }
                }
            }
        };
        let engine_key = nonblank(request.user_api_key.as_ref());
        if engine_key.is_none() && !self.engine.has_service_key() {
            return Err(PipelineError::MissingKey(ENGINE_KEY_NAME.to_string()));
        }

        let mut card = RetrievalCard::default();
        if let (true, Some(plan)) = (request.web_search, &search_plan) {
            session.transition(SessionState::Searching);
            let page_url = first_url(&query);

            let (outcome, page) = tokio::join!(
                self.orchestrator.search(plan, &query, engine_key.as_deref()),
                async {
                    match &page_url {
                        Some(url) => Some(self.pages.fetch(url).await),
                        None => None,
                    }
                }
            );
            let outcome = outcome?;

            match page {
                Some(Ok(page)) => {
                    session.add_results(vec![SearchResult {
                        rank: 0,
                        title: page.card.title.clone(),
                        url: page.card.url.clone(),
                        excerpt: page.text,
                    }]);
                    card = page.card;
                }
                Some(Err(e)) => {
                    tracing::warn!(url = ?page_url, error = %e, "Retrieval card fetch failed");
                }
                None => {}
            }

            session.add_results(outcome.results);
            session.images.extend(outcome.images.as_slice());
            tracing::info!(
                backend = plan.backend.as_str(),
                sub_queries = outcome.query.sub_queries.len(),
                results = session.results.len(),
                images = session.images.len(),
                "Search completed"
            );
        }

        session.transition(SessionState::Debiting);
        match (&caller, decision.reason) {
            (Caller::Guest { .. }, _) => {}
            (_, TierReason::Admin) => tracing::debug!("Admin caller, debit skipped"),
            (Caller::User { user_id, .. }, _) => {
                let txn = self
                    .ledger
                    .debit(&DebitContext {
                        request_id: session.request_id.clone(),
                        user_id: user_id.clone(),
                        model: model.id.clone(),
                        model_class: model.class,
                        using_own_key: own_key,
                    })
                    .await?;
                tracing::info!(
                    transaction_id = %txn.transaction_id,
                    outcome = txn.outcome.as_str(),
                    "Debit settled"
                );
            }
        }

        session.transition(SessionState::Prompting);
        let mut tools = Vec::with_capacity(ToolName::ALL.len());
        if !caller.is_guest() {
            if search_plan.is_some() {
                tools.push(ToolName::Search);
            }
            tools.push(ToolName::Retrieval);
        }
        tools.extend([ToolName::Weather, ToolName::Greeting]);

        let system_instruction = prompt::build_system_instruction(&PromptContext {
            style: request.conversation_style,
            results: &session.results,
            images: session.images.as_slice(),
            search_tool: tools.contains(&ToolName::Search),
            now: Utc::now(),
        });

        let generation = GenerationRequest {
            model: model.provider_model.clone(),
            system_instruction: Some(system_instruction),
            turns: history_turns(&request),
            tools: tools.iter().map(ToolName::declaration).collect(),
            temperature: Some(prompt::temperature_for(request.conversation_style)),
            api_key: engine_key,
        };

        let stream = self
            .engine
            .generate_stream(&generation, session.abort.child_token())
            .await
            .map_err(|e| match e {
                ProviderError::NotConfigured(_) => {
                    PipelineError::MissingKey(ENGINE_KEY_NAME.to_string())
                }
                e => PipelineError::Upstream(anyhow::Error::new(e)),
            })?;
        session.transition(SessionState::Generating);

        Ok(Prepared {
            request: generation,
            stream,
            tools,
            search_plan,
            card,
            model_id: model.id,
        })
    }

    async fn drive(
        &self,
        mut session: GenerationSession,
        prepared: Prepared,
        sender: mpsc::Sender<String>,
    ) {
        let Prepared {
            mut request,
            mut stream,
            tools,
            search_plan,
            card,
            model_id,
        } = prepared;
        let cancel = session.abort.clone();
        let out = Emitter {
            sender,
            cancel: cancel.clone(),
        };
        let mut filter = MarkerFilter::new();
        let mut rounds = 0usize;

        out.emit(&mut session, markers::prefix_line(&card)).await;

        let end = loop {
            let (text, calls) = match self
                .run_turn(&mut session, &mut stream, &mut filter, &out, &model_id)
                .await
            {
                TurnEnd::Done => break SessionState::Finished,
                TurnEnd::Failed => break SessionState::Errored,
                TurnEnd::Aborted => break SessionState::Aborted,
                TurnEnd::Tools { text, calls } => (text, calls),
            };

            session.transition(SessionState::ToolCall);
            rounds += 1;
            if !text.is_empty() {
                request.turns.push(Turn::Assistant(text));
            }

            let scope = ToolScope {
                enabled: &tools,
                search: search_plan.as_ref(),
            };
            let mut aborted = false;
            for call in calls {
                let dispatched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = self.tools.dispatch(&call, &scope, &mut session) => Some(result),
                };
                let Some(dispatched) = dispatched else {
                    aborted = true;
                    break;
                };

                let result = match dispatched {
                    Ok(value) => {
                        metrics::record_tool_call(&call.name, "success");
                        value
                    }
                    Err(e) => {
                        tracing::warn!(tool = %call.name, error = %e, "Tool call failed");
                        metrics::record_tool_call(&call.name, "error");
                        json!({ "error": e.to_string() })
                    }
                };

                session.tool_calls.push(ToolCallRecord {
                    tool_name: call.name.clone(),
                    args: call.args.clone(),
                    result: result.clone(),
                });
                request.turns.push(Turn::ToolCall {
                    name: call.name.clone(),
                    args: call.args,
                });
                request.turns.push(Turn::ToolResult {
                    name: call.name,
                    result,
                });
            }
            if aborted {
                break SessionState::Aborted;
            }

            if rounds >= self.config.generation.max_tool_rounds {
                request.tools.clear();
            }
            session.transition(SessionState::Generating);
            stream = match self
                .engine
                .generate_stream(&request, cancel.child_token())
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to resume generation after tool call");
                    break SessionState::Errored;
                }
            };
        };

        let tools_called: Vec<String> = session
            .tool_calls
            .iter()
            .map(|c| c.tool_name.clone())
            .collect();

        if end == SessionState::Aborted {
            session.transition(SessionState::Aborted);
            metrics::record_chat_request("aborted");
            tracing::info!(
                request_id = %session.request_id,
                tools = ?tools_called,
                "Generation aborted by client"
            );
            return;
        }

        let tail = filter.finish();
        out.emit(&mut session, tail).await;
        if filter.withheld() > 0 {
            tracing::debug!(
                request_id = %session.request_id,
                withheld = filter.withheld(),
                "Dropped marker lines produced by the engine"
            );
        }

        let urls = session.known_urls();
        let suffix = markers::suffix_lines(&urls, session.images.as_slice());
        out.emit(&mut session, suffix).await;

        if end == SessionState::Finished {
            session.transition(SessionState::Finished);
            auditor::audit_and_log(&session.request_id, &session.text, &urls);
            metrics::record_chat_request("completed");
        } else {
            session.transition(SessionState::Errored);
            metrics::record_chat_request("errored");
        }

        tracing::info!(
            request_id = %session.request_id,
            state = ?session.state(),
            tools = ?tools_called,
            sources = urls.len(),
            images = session.images.len(),
            "Generation finished"
        );
    }

    /// Consume one engine turn, forwarding visible text as it arrives.
    async fn run_turn(
        &self,
        session: &mut GenerationSession,
        stream: &mut EngineStream,
        filter: &mut MarkerFilter,
        out: &Emitter,
        model_id: &str,
    ) -> TurnEnd {
        let cancel = session.abort.clone();
        let mut text = String::new();
        let mut calls = Vec::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return TurnEnd::Aborted,
                event = stream.next() => event,
            };

            match event {
                Some(Ok(EngineEvent::Text(delta))) => {
                    let visible = filter.push(&delta);
                    text.push_str(&visible);
                    if !out.emit(session, visible).await {
                        return TurnEnd::Aborted;
                    }
                }
                Some(Ok(EngineEvent::ToolCall(call))) => calls.push(call),
                Some(Ok(EngineEvent::Complete {
                    input_tokens,
                    output_tokens,
                    finish_reason,
                })) => {
                    tracing::debug!(?finish_reason, input_tokens, output_tokens, "Turn complete");
                    metrics::record_tokens(
                        model_id,
                        input_tokens.max(0) as u32,
                        output_tokens.max(0) as u32,
                    );
                }
                Some(Err(e)) => {
                    tracing::error!(
                        request_id = %session.request_id,
                        error = %e,
                        "Generation stream failed"
                    );
                    return TurnEnd::Failed;
                }
                None => break,
            }
        }

        if cancel.is_cancelled() {
            TurnEnd::Aborted
        } else if calls.is_empty() {
            TurnEnd::Done
        } else {
            TurnEnd::Tools { text, calls }
        }
    }
}
