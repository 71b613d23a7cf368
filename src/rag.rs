//! Retrieval-augmented chat composer.
//!
//! answer() loads the session once, appends the user message under a version
//! CAS, retrieves context through the hybrid engine scoped to the session's
//! repository, assembles a budgeted prompt, calls the LLM with a hard
//! timeout, and appends the assistant message with the chunk ids that were
//! actually included.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::{AppConfig, MAX_QUERY_LENGTH};
use crate::docstore::{DocumentStore, SearchFilter, derive_session_title};
use crate::error::{AppError, AppResult};
use crate::llm::ChatModel;
use crate::models::{AnalyticsEvent, ChatMessage, ChatSession, HybridItem};
use crate::search::SearchEngine;

const SYSTEM_PREAMBLE: &str = "You are a code assistant answering questions about a specific \
repository. Ground every statement in the code context provided below; when the context does \
not contain the answer, say so instead of guessing. Reference specific files and line ranges.";

const NO_CONTEXT_MARKER: &str = "(no relevant code context was retrieved for this question)";

/// Share of the prompt budget context chunks may occupy.
const CONTEXT_BUDGET_SHARE: f64 = 0.7;

/// CAS append retries before giving up on a busy session.
const APPEND_RETRIES: usize = 3;

pub struct RagComposer {
    store: Arc<dyn DocumentStore>,
    search: Arc<SearchEngine>,
    llm: Arc<dyn ChatModel>,
    max_prompt_length: usize,
    context_chunks: usize,
    vector_weight: f32,
    llm_timeout: std::time::Duration,
}

impl RagComposer {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn DocumentStore>,
        search: Arc<SearchEngine>,
        llm: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            store,
            search,
            llm,
            max_prompt_length: config.max_prompt_length,
            context_chunks: config.chat_context_chunks,
            vector_weight: config.chat_vector_weight,
            llm_timeout: config.llm_request_timeout,
        }
    }

    pub async fn create_session(&self, owner_id: Uuid, repository_id: Uuid) -> AppResult<ChatSession> {
        // Ownership check doubles as existence check.
        self.store
            .get_repository_for_owner(repository_id, owner_id)
            .await?;
        let session = ChatSession::new(owner_id, repository_id);
        self.store.insert_session(&session).await?;
        Ok(session)
    }

    pub async fn answer(
        &self,
        session_id: Uuid,
        owner_id: Uuid,
        user_message: &str,
    ) -> AppResult<ChatMessage> {
        let trimmed = user_message.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("message must not be empty".into()));
        }
        if trimmed.len() > MAX_QUERY_LENGTH {
            return Err(AppError::Validation(format!(
                "message too long ({} chars, max {MAX_QUERY_LENGTH})",
                trimmed.len()
            )));
        }

        let session = self.store.get_session_for_owner(session_id, owner_id).await?;

        let title = session
            .messages
            .is_empty()
            .then(|| derive_session_title(trimmed));
        let user_msg = ChatMessage::user(trimmed.to_string());
        self.append_with_retry(session_id, owner_id, &user_msg, title.as_deref())
            .await?;

        // Retrieval scoped to the session's repository.
        let filter = SearchFilter {
            owner_id,
            repository_ids: Some(vec![session.repository_id]),
            ..Default::default()
        };
        let retrieval = self
            .search
            .hybrid(trimmed, &filter, self.context_chunks, self.vector_weight)
            .await?;

        let (prompt, included) =
            build_prompt(trimmed, &retrieval.items, self.max_prompt_length);

        let completion = tokio::time::timeout(
            self.llm_timeout,
            self.llm.complete(SYSTEM_PREAMBLE, &prompt),
        )
        .await
        .map_err(|_| AppError::UpstreamUnavailable("chat LLM timed out".into()))??;

        let assistant =
            ChatMessage::assistant(completion.content, included, completion.tokens_used);
        self.append_with_retry(session_id, owner_id, &assistant, None)
            .await?;

        let _ = self
            .store
            .record_event(&AnalyticsEvent::new(
                owner_id,
                "chat_answered",
                serde_json::json!({
                    "session_id": session_id,
                    "repository_id": session.repository_id,
                    "retrieved": assistant.retrieved_chunk_refs.len(),
                    "tokens_used": assistant.tokens_used,
                }),
            ))
            .await;

        Ok(assistant)
    }

    /// Appends are serialized per session by the version CAS; on a lost race
    /// the session is reloaded and the append retried.
    async fn append_with_retry(
        &self,
        session_id: Uuid,
        owner_id: Uuid,
        message: &ChatMessage,
        title: Option<&str>,
    ) -> AppResult<()> {
        for _ in 0..APPEND_RETRIES {
            let current = self.store.get_session_for_owner(session_id, owner_id).await?;
            if self
                .store
                .append_message(session_id, current.version, message, title)
                .await?
            {
                return Ok(());
            }
        }
        Err(AppError::Internal(format!(
            "session {session_id} append kept losing the version race"
        )))
    }
}

/// Assemble the prompt body (the system preamble travels separately):
/// context blocks in fused-score order while they fit inside 70% of the
/// budget, then the user question. Total stays within `budget` characters.
fn build_prompt(question: &str, items: &[HybridItem], budget: usize) -> (String, Vec<Uuid>) {
    let context_budget = (budget as f64 * CONTEXT_BUDGET_SHARE) as usize;

    let mut context = String::new();
    let mut included = Vec::new();
    for hit in items {
        let block = format!(
            "--- File: {} (lines {}-{}) ---\n{}\n\n",
            hit.item.file_path, hit.item.start_line, hit.item.end_line, hit.item.content
        );
        if context.len() + block.len() > context_budget {
            break;
        }
        context.push_str(&block);
        included.push(hit.item.chunk_id);
    }

    if included.is_empty() {
        context.push_str(NO_CONTEXT_MARKER);
        context.push('\n');
    }

    let mut prompt = format!(
        "Code context:\n\n{context}\nQuestion: {question}\n\
         Answer with references to the specific files and line ranges above."
    );

    // The question itself can in principle blow the remaining budget; cut on
    // a char boundary as the last resort.
    if prompt.len() > budget {
        let mut end = budget;
        while end > 0 && !prompt.is_char_boundary(end) {
            end -= 1;
        }
        prompt.truncate(end);
    }

    (prompt, included)
}
