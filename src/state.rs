use std::sync::Arc;

use tokio::sync::Notify;

use crate::chunker::Chunker;
use crate::config::AppConfig;
use crate::docstore::{DocumentStore, PostgresStore};
use crate::embedding::{EmbeddingProvider, HttpEmbeddingClient};
use crate::error::AppResult;
use crate::github::GithubClient;
use crate::identity::{HmacIdentity, IdentityProvider};
use crate::importer::Importer;
use crate::llm::HttpChatClient;
use crate::pipeline::{EmbeddingPipeline, PipelineConfig, RepoLocks};
use crate::rag::RagComposer;
use crate::search::SearchEngine;
use crate::vectorstore::{QdrantStore, VectorStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub importer: Arc<Importer>,
    pub pipeline: EmbeddingPipeline,
    pub search: Arc<SearchEngine>,
    pub rag: Arc<RagComposer>,
    pub pipeline_wake: Arc<Notify>,
    pub repo_locks: RepoLocks,
}

impl AppState {
    /// Wire every adapter and core component from the validated config.
    /// Fails fast on unreachable stores or a mis-dimensioned collection.
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let config = Arc::new(config);

        let postgres = PostgresStore::connect(&config).await?;
        postgres.ensure_schema().await?;
        let store: Arc<dyn DocumentStore> = Arc::new(postgres);

        let vectors: Arc<dyn VectorStore> = Arc::new(QdrantStore::new(&config)?);
        vectors.ensure_collection().await?;

        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HttpEmbeddingClient::new(&config)?);
        let llm = Arc::new(HttpChatClient::new(&config)?);
        let forge = Arc::new(GithubClient::new(&config)?);
        let identity: Arc<dyn IdentityProvider> =
            Arc::new(HmacIdentity::new(&config.auth_secret, store.clone()));
        let chunker = Arc::new(Chunker::new(&config));

        let pipeline_wake = Arc::new(Notify::new());
        let importer = Arc::new(Importer::new(
            &config,
            store.clone(),
            forge,
            identity.clone(),
            chunker,
            pipeline_wake.clone(),
        ));
        let repo_locks = RepoLocks::new();
        let pipeline = EmbeddingPipeline::new(
            PipelineConfig::from_app_config(&config),
            store.clone(),
            vectors.clone(),
            embedder.clone(),
            pipeline_wake.clone(),
            repo_locks.clone(),
        );
        let search = Arc::new(SearchEngine::new(
            store.clone(),
            vectors.clone(),
            embedder.clone(),
        ));
        let rag = Arc::new(RagComposer::new(
            &config,
            store.clone(),
            search.clone(),
            llm,
        ));

        Ok(Self {
            config,
            store,
            vectors,
            identity,
            importer,
            pipeline,
            search,
            rag,
            pipeline_wake,
            repo_locks,
        })
    }
}
