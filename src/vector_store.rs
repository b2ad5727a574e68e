//! # ChunkStore
//!
//! Persisted document chunks plus nearest-neighbor retrieval.
//!
//! The SQLite `document_chunks` table is the system of record; this module
//! pairs it with an in-process [HNSW](https://arxiv.org/abs/1603.09320)
//! approximate nearest-neighbor index (`hora` crate) keyed by chunk row id.
//! The index is a derived structure: it is rebuilt from the table on startup
//! and after deletions, so a process restart loses nothing.
//!
//! ## Responsibilities
//! - **Persistence**: chunk batches land in a single transaction, all or none.
//! - **Indexing**: every stored vector is added to the HNSW index and the index
//!   is rebuilt under the store's one fixed metric.
//! - **Retrieval**: `search` ranks by ascending distance with ties broken by
//!   chunk id, so identical inputs always produce identical rankings.
//!
//! The distance metric is set at construction and never changes; there is no
//! way to index one chunk under cosine and another under L2.

use diesel::prelude::*;
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::config::DistanceMetric;
use crate::error::{RagweedError, Result};
use crate::models::DocumentChunk;
use crate::store;

/// A retrieval hit: the chunk and its distance from the query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    /// The stored chunk row.
    pub chunk: DocumentChunk,
    /// Distance under the store's metric; smaller is closer.
    pub distance: f32,
}

/// Persisted chunk collection with nearest-neighbor lookup.
pub struct ChunkStore {
    /// Dimensionality every stored and queried vector must have.
    dimension: usize,
    /// The one metric this store ever ranks under.
    metric: DistanceMetric,
    /// ANN index over chunk row ids. Derived from the table; rebuildable.
    index: RwLock<HNSWIndex<f32, usize>>,
    /// Number of vectors currently indexed.
    indexed: AtomicUsize,
}

impl ChunkStore {
    /// Create an empty store for vectors of the given dimension.
    ///
    /// # Parameters
    /// - `dimension`: Vector length D; enforced on every store and search.
    /// - `metric`: Ranking metric, fixed for the store's lifetime.
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            index: RwLock::new(HNSWIndex::new(dimension, &HNSWParams::default())),
            indexed: AtomicUsize::new(0),
        }
    }

    /// Number of vectors currently indexed.
    pub fn len(&self) -> usize {
        self.indexed.load(Ordering::Relaxed)
    }

    /// `true` when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hora_metric(&self) -> Metric {
        match self.metric {
            DistanceMetric::Cosine => Metric::CosineSimilarity,
            DistanceMetric::L2 => Metric::Euclidean,
        }
    }

    /// Rebuild the index from every chunk currently in the table.
    ///
    /// Called on startup (cold start rehydration) and after deletions, since
    /// the HNSW structure has no point removal.
    pub fn rebuild_from_store(&self, conn: &mut SqliteConnection) -> Result<usize> {
        let chunks = store::all_chunks(conn)?;
        let mut index = HNSWIndex::new(self.dimension, &HNSWParams::default());
        let mut count = 0;
        for chunk in &chunks {
            let vector = chunk.embedding_vector()?;
            self.check_dimension(&vector)?;
            let id = chunk.id.ok_or_else(|| {
                RagweedError::Persistence("loaded chunk without a row id".into())
            })? as usize;
            index
                .add(&vector, id)
                .map_err(|e| RagweedError::Persistence(format!("index add failed: {e}")))?;
            count += 1;
        }
        if count > 0 {
            index
                .build(self.hora_metric())
                .map_err(|e| RagweedError::Persistence(format!("index build failed: {e}")))?;
        }
        let mut guard = self.index.write().expect("chunk index lock poisoned");
        *guard = index;
        self.indexed.store(count, Ordering::Relaxed);
        info!("chunk index rebuilt with {count} vectors");
        Ok(count)
    }

    /// Persist a chunk batch and add it to the index.
    ///
    /// The database write is a single transaction; on any failure zero chunks
    /// remain visible. An index failure after the commit triggers a rebuild
    /// from the table, so index and table cannot drift apart.
    pub fn store(
        &self,
        conn: &mut SqliteConnection,
        chunks: Vec<DocumentChunk>,
    ) -> Result<Vec<DocumentChunk>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        for chunk in &chunks {
            let vector = chunk.embedding_vector()?;
            self.check_dimension(&vector)?;
        }

        let inserted = store::insert_chunks(conn, &chunks)?;

        let index_result = (|| -> Result<()> {
            let mut guard = self.index.write().expect("chunk index lock poisoned");
            for chunk in &inserted {
                let vector = chunk.embedding_vector()?;
                let id = chunk.id.ok_or_else(|| {
                    RagweedError::Persistence("inserted chunk without a row id".into())
                })? as usize;
                guard
                    .add(&vector, id)
                    .map_err(|e| RagweedError::Persistence(format!("index add failed: {e}")))?;
            }
            guard
                .build(self.hora_metric())
                .map_err(|e| RagweedError::Persistence(format!("index build failed: {e}")))?;
            Ok(())
        })();

        match index_result {
            Ok(()) => {
                self.indexed.fetch_add(inserted.len(), Ordering::Relaxed);
            }
            Err(_) => {
                self.rebuild_from_store(conn)?;
            }
        }

        debug!("stored {} chunks", inserted.len());
        Ok(inserted)
    }

    /// Remove every chunk of a resource, then rebuild the index.
    ///
    /// Returns the number of chunks removed.
    pub fn delete_by_resource(
        &self,
        conn: &mut SqliteConnection,
        resource_id: &str,
    ) -> Result<usize> {
        let removed = store::delete_chunks_by_resource(conn, resource_id)?;
        if removed > 0 {
            self.rebuild_from_store(conn)?;
        }
        Ok(removed)
    }

    /// Query the `k` nearest chunks to `query_vector`.
    ///
    /// # Returns
    /// Up to `k` hits sorted by ascending distance, ties broken by chunk id.
    ///
    /// # Errors
    /// [`RagweedError::Validation`] on a wrong-dimension query vector.
    pub fn search(
        &self,
        conn: &mut SqliteConnection,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        self.check_dimension(query_vector)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        // Over-fetch so equal-distance neighbors beyond position k still take
        // part in the deterministic (distance, id) sort.
        let mut candidates: Vec<(f32, usize)> = {
            let guard = self.index.read().expect("chunk index lock poisoned");
            guard
                .search_nodes(query_vector, k.saturating_mul(2))
                .into_iter()
                .filter_map(|(node, distance)| node.idx().as_ref().map(|id| (distance, *id)))
                .collect()
        };
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        candidates.truncate(k);

        let ids: Vec<i32> = candidates.iter().map(|(_, id)| *id as i32).collect();
        let chunks = store::chunks_by_ids(conn, &ids)?;

        Ok(chunks
            .into_iter()
            .zip(candidates.into_iter().map(|(distance, _)| distance))
            .map(|(chunk, distance)| ScoredChunk { chunk, distance })
            .collect())
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RagweedError::Validation(format!(
                "vector dimension {} does not match store dimension {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }
}
