//! Search engine: lexical, vector, and hybrid fusion over a caller-owned set
//! of repositories. Owner scoping applies to every path; the hybrid fusion
//! degrades to lexical-only with a warning flag when the vector side is
//! unavailable.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MAX_QUERY_LENGTH;
use crate::docstore::{DocumentStore, LexicalPage, SearchFilter};
use crate::embedding::EmbeddingProvider;
use crate::error::{AppError, AppResult};
use crate::models::{HybridItem, SearchItem};
use crate::vectorstore::VectorStore;

/// Both sides fetch `k * OVERSAMPLE` candidates before fusing.
const OVERSAMPLE: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexicalResponse {
    pub items: Vec<SearchItem>,
    pub total: i64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridResponse {
    pub items: Vec<HybridItem>,
    /// True when the vector side was unavailable and only lexical scores
    /// contributed.
    pub degraded: bool,
}

pub struct SearchEngine {
    store: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SearchEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
        }
    }

    fn validate_query(query: &str) -> AppResult<()> {
        if query.trim().is_empty() {
            return Err(AppError::Validation("query must not be empty".into()));
        }
        if query.len() > MAX_QUERY_LENGTH {
            return Err(AppError::Validation(format!(
                "query too long ({} chars, max {MAX_QUERY_LENGTH})",
                query.len()
            )));
        }
        Ok(())
    }

    /// Resolve the repository ids the caller may search: the requested
    /// subset (ownership-checked) or everything they own.
    async fn allowed_repositories(&self, filter: &SearchFilter) -> AppResult<Vec<Uuid>> {
        let owned = self.store.list_repository_ids_by_owner(filter.owner_id).await?;
        match &filter.repository_ids {
            None => Ok(owned),
            Some(requested) => {
                for id in requested {
                    if !owned.contains(id) {
                        return Err(AppError::Forbidden(format!("repository {id}")));
                    }
                }
                Ok(requested.clone())
            }
        }
    }

    pub async fn lexical(
        &self,
        query: &str,
        filter: &SearchFilter,
        offset: i64,
        limit: i64,
    ) -> AppResult<LexicalResponse> {
        Self::validate_query(query)?;
        let page = self.store.lexical_search(query, filter, offset, limit).await?;
        Ok(lexical_response(page))
    }

    pub async fn vector(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> AppResult<Vec<SearchItem>> {
        Self::validate_query(query)?;
        let allowed = self.allowed_repositories(filter).await?;
        if allowed.is_empty() {
            return Ok(Vec::new());
        }

        let query_input = [query.to_string()];
        let query_vector = self
            .embedder
            .embed(&query_input)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Internal("embedder returned no query vector".into()))?;

        let points = self.vectors.search(&query_vector, &allowed, limit).await?;

        // Hydrate full rows; points without a surviving row are dropped.
        let ids: Vec<Uuid> = points.iter().map(|p| p.id).collect();
        let chunks = self.store.find_chunks_by_ids(&ids).await?;
        let by_id: HashMap<Uuid, _> = chunks.into_iter().map(|c| (c.id, c)).collect();

        Ok(points
            .iter()
            .filter_map(|p| {
                by_id
                    .get(&p.id)
                    .map(|chunk| SearchItem::from_chunk(chunk, p.score, None))
            })
            .collect())
    }

    /// Weighted fusion of the two rankings; see `fuse` for the math.
    pub async fn hybrid(
        &self,
        query: &str,
        filter: &SearchFilter,
        k: usize,
        vector_weight: f32,
    ) -> AppResult<HybridResponse> {
        Self::validate_query(query)?;
        if !(0.0..=1.0).contains(&vector_weight) {
            return Err(AppError::Validation(format!(
                "vector weight must be within [0, 1], got {vector_weight}"
            )));
        }

        let fetch = (k * OVERSAMPLE) as i64;
        let lexical = self.store.lexical_search(query, filter, 0, fetch).await?;

        let (vector_items, degraded) =
            match self.vector(query, filter, k * OVERSAMPLE).await {
                Ok(items) => (items, false),
                Err(e) if e.is_retriable() => {
                    tracing::warn!(error = %e, "vector search unavailable, lexical-only fusion");
                    (Vec::new(), true)
                }
                Err(e) => return Err(e),
            };

        let lexical_scored: Vec<(SearchItem, f32)> = lexical
            .items
            .into_iter()
            .map(|hit| {
                let item = SearchItem::from_chunk(&hit.chunk, hit.score, hit.highlight);
                (item, hit.score)
            })
            .collect();
        let vector_scored: Vec<(SearchItem, f32)> = vector_items
            .into_iter()
            .map(|item| {
                let score = item.score;
                (item, score)
            })
            .collect();

        let items = fuse(lexical_scored, vector_scored, vector_weight, k);
        Ok(HybridResponse { items, degraded })
    }
}

fn lexical_response(page: LexicalPage) -> LexicalResponse {
    LexicalResponse {
        items: page
            .items
            .into_iter()
            .map(|hit| SearchItem::from_chunk(&hit.chunk, hit.score, hit.highlight))
            .collect(),
        total: page.total,
        has_more: page.has_more,
    }
}

/// Min-max normalize a score list to [0, 1]. A list with a single distinct
/// value maps to 1.0 so that its only member counts as a full match within
/// its own ranking.
fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    let Some(max) = scores.iter().copied().reduce(f32::max) else {
        return Vec::new();
    };
    let min = scores.iter().copied().reduce(f32::min).unwrap_or(0.0);
    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

/// fused = W * vector_norm + (1 - W) * lexical_norm, absence counting as 0.
/// Ties break by vector score desc, then chunk id asc (stable).
fn fuse(
    lexical: Vec<(SearchItem, f32)>,
    vector: Vec<(SearchItem, f32)>,
    vector_weight: f32,
    k: usize,
) -> Vec<HybridItem> {
    let lexical_norms =
        min_max_normalize(&lexical.iter().map(|(_, s)| *s).collect::<Vec<_>>());
    let vector_norms = min_max_normalize(&vector.iter().map(|(_, s)| *s).collect::<Vec<_>>());

    struct Entry {
        item: SearchItem,
        lexical_norm: f32,
        vector_norm: f32,
        vector_raw: f32,
    }

    let mut merged: HashMap<Uuid, Entry> = HashMap::new();
    for ((item, _raw), norm) in lexical.into_iter().zip(lexical_norms) {
        merged.insert(
            item.chunk_id,
            Entry {
                item,
                lexical_norm: norm,
                vector_norm: 0.0,
                vector_raw: 0.0,
            },
        );
    }
    for ((item, raw), norm) in vector.into_iter().zip(vector_norms) {
        match merged.get_mut(&item.chunk_id) {
            Some(entry) => {
                entry.vector_norm = norm;
                entry.vector_raw = raw;
                // Keep the lexical item (it carries the highlight).
            }
            None => {
                merged.insert(
                    item.chunk_id,
                    Entry {
                        item,
                        lexical_norm: 0.0,
                        vector_norm: norm,
                        vector_raw: raw,
                    },
                );
            }
        }
    }

    let mut fused: Vec<HybridItem> = merged
        .into_values()
        .map(|entry| {
            let fused_score =
                vector_weight * entry.vector_norm + (1.0 - vector_weight) * entry.lexical_norm;
            let mut item = entry.item;
            item.score = fused_score;
            HybridItem {
                item,
                lexical_score: entry.lexical_norm,
                vector_score: entry.vector_norm,
                fused_score,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.vector_score
                    .partial_cmp(&a.vector_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.item.chunk_id.cmp(&b.item.chunk_id))
    });
    fused.truncate(k);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, CodeChunk, EmbeddingStatus};
    use chrono::Utc;

    fn item(id: Uuid, path: &str) -> SearchItem {
        let chunk = CodeChunk {
            id,
            repository_id: Uuid::new_v4(),
            file_path: path.to_string(),
            file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
            language: "rust".into(),
            start_line: 1,
            end_line: 30,
            content: "fn body() {}".into(),
            content_hash: "h".into(),
            metadata: ChunkMetadata::default(),
            embedding_status: EmbeddingStatus::Completed,
            vector_ref: Some(id),
            attempts: 0,
            failure_reason: None,
            lease_deadline: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        SearchItem::from_chunk(&chunk, 0.0, None)
    }

    #[test]
    fn fusion_matches_reference_scenario() {
        // c1 matches lexically (raw 3.0) with low vector similarity; c2 has
        // high vector similarity and no lexical match. With W=0.7 the vector
        // hit must win: c2 ≈ 0.70, c1 ≈ 0.30.
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let lexical = vec![(item(c1, "auth.rs"), 3.0)];
        let vector = vec![(item(c2, "login.rs"), 0.80), (item(c1, "auth.rs"), 0.40)];

        let fused = fuse(lexical, vector, 0.7, 8);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].item.chunk_id, c2);
        assert_eq!(fused[1].item.chunk_id, c1);
        assert!((fused[0].fused_score - 0.70).abs() < 1e-5);
        assert!((fused[1].fused_score - 0.30).abs() < 1e-5);
    }

    #[test]
    fn fused_scores_stay_in_unit_interval() {
        let ids: Vec<Uuid> = (0..20).map(|_| Uuid::new_v4()).collect();
        let lexical: Vec<(SearchItem, f32)> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (item(*id, "f.rs"), (i as f32) * 1.7))
            .collect();
        let vector: Vec<(SearchItem, f32)> = ids
            .iter()
            .rev()
            .enumerate()
            .map(|(i, id)| (item(*id, "f.rs"), (i as f32) / 19.0))
            .collect();

        for w in [0.0f32, 0.3, 0.7, 1.0] {
            let fused = fuse(lexical.clone(), vector.clone(), w, 50);
            for hit in &fused {
                assert!((0.0..=1.0).contains(&hit.fused_score), "w={w}");
            }
        }
    }

    #[test]
    fn weight_one_is_vector_ranking() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let d = Uuid::new_v4();
        let lexical = vec![(item(c, "x.rs"), 9.0), (item(a, "y.rs"), 1.0)];
        let vector = vec![
            (item(a, "y.rs"), 0.9),
            (item(b, "z.rs"), 0.5),
            (item(d, "w.rs"), 0.1),
        ];

        let fused = fuse(lexical, vector, 1.0, 2);
        let order: Vec<Uuid> = fused.iter().map(|h| h.item.chunk_id).collect();
        assert_eq!(order, vec![a, b]);
    }

    #[test]
    fn weight_zero_is_lexical_ranking() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let lexical = vec![(item(c, "x.rs"), 9.0), (item(a, "y.rs"), 1.0)];
        let vector = vec![(item(a, "y.rs"), 0.9), (item(b, "z.rs"), 0.5)];

        let fused = fuse(lexical, vector, 0.0, 2);
        let order: Vec<Uuid> = fused.iter().map(|h| h.item.chunk_id).collect();
        assert_eq!(order, vec![c, a]);
    }

    #[test]
    fn ties_break_by_vector_then_id() {
        let mut ids = [Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();
        // Same fused score, same vector score: lower id wins.
        let vector = vec![(item(ids[1], "b.rs"), 0.5), (item(ids[0], "a.rs"), 0.5)];
        let fused = fuse(Vec::new(), vector, 1.0, 2);
        assert_eq!(fused[0].item.chunk_id, ids[0]);
    }

    #[test]
    fn empty_inputs_fuse_to_empty() {
        assert!(fuse(Vec::new(), Vec::new(), 0.7, 8).is_empty());
    }

    #[test]
    fn normalize_handles_degenerate_lists() {
        assert!(min_max_normalize(&[]).is_empty());
        assert_eq!(min_max_normalize(&[3.0]), vec![1.0]);
        assert_eq!(min_max_normalize(&[2.0, 2.0]), vec![1.0, 1.0]);
        let norm = min_max_normalize(&[0.4, 0.8]);
        assert!((norm[0] - 0.0).abs() < 1e-6);
        assert!((norm[1] - 1.0).abs() < 1e-6);
    }

    mod engine {
        use super::*;
        use crate::testutil::{
            MemoryStore, MemoryVectorStore, MockEmbedder, repository, seed_pending_chunks,
        };
        use crate::vectorstore::{VectorPayload, VectorPoint};
        use std::sync::Arc;

        struct Fixture {
            engine: SearchEngine,
            store: Arc<MemoryStore>,
            vectors: Arc<MemoryVectorStore>,
            embedder: Arc<MockEmbedder>,
            owner: Uuid,
            repo: Uuid,
        }

        async fn fixture() -> Fixture {
            let store = Arc::new(MemoryStore::new());
            let vectors = Arc::new(MemoryVectorStore::new());
            let embedder = Arc::new(MockEmbedder::new(8));
            let owner = Uuid::new_v4();
            let repo = repository(owner);
            store.insert_repository(&repo).await.unwrap();
            let engine = SearchEngine::new(store.clone(), vectors.clone(), embedder.clone());
            Fixture {
                engine,
                store,
                vectors,
                embedder,
                owner,
                repo: repo.id,
            }
        }

        async fn index_chunks(f: &Fixture, repo: Uuid, count: usize) -> Vec<Uuid> {
            let ids = seed_pending_chunks(&f.store, repo, count).await;
            let chunks = f.store.find_chunks_by_ids(&ids).await.unwrap();
            let points: Vec<VectorPoint> = chunks
                .iter()
                .map(|c| VectorPoint {
                    id: c.id,
                    vector: f.embedder.embedding_for(&c.content),
                    payload: VectorPayload {
                        repository_id: c.repository_id,
                        file_path: c.file_path.clone(),
                        language: c.language.clone(),
                        start_line: c.start_line,
                        end_line: c.end_line,
                    },
                })
                .collect();
            f.vectors.upsert_points(&points).await.unwrap();
            ids
        }

        #[tokio::test]
        async fn vector_search_returns_owned_hydrated_chunks() {
            let f = fixture().await;
            index_chunks(&f, f.repo, 4).await;

            let filter = SearchFilter {
                owner_id: f.owner,
                ..Default::default()
            };
            let items = f.engine.vector("chunk_1", &filter, 3).await.unwrap();
            assert!(!items.is_empty());
            assert!(items.len() <= 3);
            for item in &items {
                assert_eq!(item.repository_id, f.repo);
                assert!((0.0..=1.0).contains(&item.score));
                assert!(!item.content.is_empty());
            }
        }

        #[tokio::test]
        async fn results_never_leak_across_owners() {
            let f = fixture().await;
            index_chunks(&f, f.repo, 3).await;

            // A second user with their own repository and chunks.
            let other_owner = Uuid::new_v4();
            let other_repo = repository(other_owner);
            f.store.insert_repository(&other_repo).await.unwrap();
            index_chunks(&f, other_repo.id, 3).await;

            let filter = SearchFilter {
                owner_id: other_owner,
                ..Default::default()
            };
            let items = f.engine.vector("chunk", &filter, 10).await.unwrap();
            assert!(!items.is_empty());
            assert!(items.iter().all(|i| i.repository_id == other_repo.id));

            let lexical = f.engine.lexical("chunk", &filter, 0, 10).await.unwrap();
            assert!(lexical.items.iter().all(|i| i.repository_id == other_repo.id));

            let hybrid = f.engine.hybrid("chunk", &filter, 8, 0.7).await.unwrap();
            assert!(hybrid
                .items
                .iter()
                .all(|i| i.item.repository_id == other_repo.id));
        }

        #[tokio::test]
        async fn requesting_foreign_repository_is_forbidden() {
            let f = fixture().await;
            let stranger = Uuid::new_v4();
            let filter = SearchFilter {
                owner_id: stranger,
                repository_ids: Some(vec![f.repo]),
                ..Default::default()
            };
            let err = f.engine.vector("query", &filter, 5).await.unwrap_err();
            assert!(matches!(err, AppError::Forbidden(_)));
        }

        #[tokio::test]
        async fn hybrid_degrades_when_vector_side_fails() {
            let f = fixture().await;
            index_chunks(&f, f.repo, 3).await;
            f.embedder
                .fail_always
                .store(true, std::sync::atomic::Ordering::SeqCst);

            let filter = SearchFilter {
                owner_id: f.owner,
                ..Default::default()
            };
            let response = f.engine.hybrid("chunk", &filter, 5, 0.7).await.unwrap();
            assert!(response.degraded);
            assert!(!response.items.is_empty());
            assert!(response.items.iter().all(|i| i.vector_score == 0.0));
        }

        #[tokio::test]
        async fn empty_query_is_rejected() {
            let f = fixture().await;
            let filter = SearchFilter {
                owner_id: f.owner,
                ..Default::default()
            };
            assert!(f.engine.lexical("  ", &filter, 0, 10).await.is_err());
            let long = "x".repeat(MAX_QUERY_LENGTH + 1);
            assert!(f.engine.vector(&long, &filter, 10).await.is_err());
        }

        #[tokio::test]
        async fn empty_results_are_valid() {
            let f = fixture().await;
            let filter = SearchFilter {
                owner_id: f.owner,
                ..Default::default()
            };
            let response = f.engine.hybrid("nomatch", &filter, 8, 0.7).await.unwrap();
            assert!(response.items.is_empty());
            assert!(!response.degraded);
        }
    }
}
