//! Flat nearest-neighbor index over embedding vectors.
//!
//! The matching stage builds a [`VectorIndex`] from the catalog snapshot's
//! embedded descriptions and queries it once per requirement. Neighbors are
//! returned by ascending squared Euclidean distance, addressed by the
//! position the vector had at build time. Callers resolve positions against
//! the same catalog snapshot the index was built from.
//!
//! An index can be saved to and reloaded from a JSON file between build and
//! search within one run. Any catalog change invalidates a saved file, so
//! the pipeline rebuilds on every run rather than trusting one across runs.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tenderflow_shared::{Result, TenderFlowError};
use tracing::debug;

/// Version tag written into saved index files.
const INDEX_FILE_VERSION: u32 = 1;

/// One retrieved neighbor: the vector's build-time position and its
/// squared Euclidean distance from the query (lower is closer).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub distance: f32,
}

/// On-disk representation of a built index.
#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

/// A flat in-memory vector index with exhaustive search.
///
/// Starts unbuilt; [`VectorIndex::build`] or [`VectorIndex::load`] makes it
/// searchable. An index built from zero vectors is valid and returns zero
/// results, which is distinct from querying an index that was never built
/// (a reportable error).
#[derive(Debug)]
pub struct VectorIndex {
    dimension: usize,
    vectors: Option<Vec<Vec<f32>>>,
}

impl VectorIndex {
    /// Create an unbuilt index expecting vectors of `dimension`.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: None,
        }
    }

    /// The dimension every indexed vector and query must have.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Whether [`VectorIndex::build`] or [`VectorIndex::load`] has run.
    pub fn is_built(&self) -> bool {
        self.vectors.is_some()
    }

    /// Number of indexed vectors (zero when unbuilt).
    pub fn len(&self) -> usize {
        self.vectors.as_ref().map_or(0, Vec::len)
    }

    /// Whether the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the index over `vectors`, keyed by their position in the input.
    ///
    /// An empty input builds an empty, searchable index. Rebuilding replaces
    /// any previous contents.
    pub fn build(&mut self, vectors: Vec<Vec<f32>>) -> Result<()> {
        for (position, vector) in vectors.iter().enumerate() {
            if vector.len() != self.dimension {
                return Err(TenderFlowError::Index(format!(
                    "vector at position {position} has dimension {}, expected {}",
                    vector.len(),
                    self.dimension
                )));
            }
        }
        debug!(count = vectors.len(), dimension = self.dimension, "index built");
        self.vectors = Some(vectors);
        Ok(())
    }

    /// Return up to `k` neighbors of `query`, ascending by distance.
    ///
    /// Fewer than `k` indexed vectors yield as many as exist. Querying an
    /// unbuilt index is an error; querying an empty one is not.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let vectors = self.vectors.as_ref().ok_or_else(|| {
            TenderFlowError::Index("index not built; build or load it first".into())
        })?;

        if query.len() != self.dimension {
            return Err(TenderFlowError::Index(format!(
                "query has dimension {}, expected {}",
                query.len(),
                self.dimension
            )));
        }

        let mut neighbors: Vec<Neighbor> = vectors
            .iter()
            .enumerate()
            .map(|(position, vector)| Neighbor {
                position,
                distance: squared_l2(query, vector),
            })
            .collect();

        neighbors.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        neighbors.truncate(k);
        Ok(neighbors)
    }

    /// Serialize the built index to `path` as JSON, atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let vectors = self.vectors.as_ref().ok_or_else(|| {
            TenderFlowError::Index("cannot save an index that was never built".into())
        })?;

        let file = IndexFile {
            version: INDEX_FILE_VERSION,
            dimension: self.dimension,
            vectors: vectors.clone(),
        };
        let content = serde_json::to_string(&file)
            .map_err(|e| TenderFlowError::Index(format!("serialize index: {e}")))?;

        write_atomic(path, &content)?;
        debug!(path = %path.display(), count = vectors.len(), "index saved");
        Ok(())
    }

    /// Load a previously saved index from `path`.
    ///
    /// Fails if the file is missing or malformed, or if its recorded
    /// dimension differs from `dimension`.
    pub fn load(path: &Path, dimension: usize) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| TenderFlowError::io(path, e))?;
        let file: IndexFile = serde_json::from_str(&content)
            .map_err(|e| TenderFlowError::Index(format!("malformed index file: {e}")))?;

        if file.version != INDEX_FILE_VERSION {
            return Err(TenderFlowError::Index(format!(
                "unsupported index file version {}",
                file.version
            )));
        }
        if file.dimension != dimension {
            return Err(TenderFlowError::Index(format!(
                "index file has dimension {}, expected {dimension}",
                file.dimension
            )));
        }

        let mut index = Self::new(dimension);
        index.build(file.vectors)?;
        Ok(index)
    }
}

/// Squared Euclidean distance between two equal-length vectors.
fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Write `content` to `path` via a hidden temp file and rename.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TenderFlowError::io(parent, e))?;
    }

    let file_name = path.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
        TenderFlowError::validation(format!("invalid index path: {}", path.display()))
    })?;
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    std::fs::write(&tmp_path, content).map_err(|e| TenderFlowError::io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| TenderFlowError::io(path, e))?;
    Ok(())
}
