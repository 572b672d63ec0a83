//! Embedding backend selection.
//!
//! The [`Embedder`] trait and the offline [`HashingEmbedder`] live in
//! `hearth-core`. This module adds the model-backed [`LocalEmbedder`]
//! (fastembed, behind the `local-embeddings-fastembed` feature) and
//! [`create_embedder`], which picks a backend from configuration once at
//! startup.
//!
//! | `embedding.provider` | Backend |
//! |----------------------|---------|
//! | `"hashing"` (default) | [`HashingEmbedder`], no model files |
//! | `"local"` | [`LocalEmbedder`], requires the feature |

use std::sync::Arc;

use anyhow::Result;
#[cfg(not(feature = "local-embeddings-fastembed"))]
use anyhow::bail;

use hearth_core::embedding::{Embedder, HashingEmbedder};

use crate::config::EmbeddingConfig;

/// Build the embedder named by `config.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dims))),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(local::LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!(
            "Local embedding provider requires --features local-embeddings-fastembed"
        ),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalEmbedder;

#[cfg(feature = "local-embeddings-fastembed")]
mod local {
    use std::sync::Mutex;

    use anyhow::{bail, Result};
    use hearth_core::embedding::Embedder;
    use hearth_core::Error;

    use crate::config::EmbeddingConfig;

    /// Runs a sentence-embedding model in-process via fastembed.
    ///
    /// The model is loaded on first use, on whichever worker thread
    /// embeds first, so startup stays fast when nothing is ingested.
    pub struct LocalEmbedder {
        model_name: String,
        model: fastembed::EmbeddingModel,
        dims: usize,
        batch_size: usize,
        runtime: Mutex<Option<fastembed::TextEmbedding>>,
    }

    impl LocalEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
            let (model, dims) = config_to_fastembed_model(&model_name)?;
            if config.dims != dims {
                bail!(
                    "embedding.dims = {} but model '{}' produces {} dimensions",
                    config.dims,
                    model_name,
                    dims
                );
            }
            Ok(Self {
                model_name,
                model,
                dims,
                batch_size: config.batch_size,
                runtime: Mutex::new(None),
            })
        }
    }

    impl Embedder for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        fn embed(&self, texts: &[String]) -> hearth_core::Result<Vec<Vec<f32>>> {
            let mut guard = self
                .runtime
                .lock()
                .map_err(|_| Error::ModelUnavailable("embedding model lock poisoned".into()))?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(self.model.clone())
                        .with_show_download_progress(false),
                )
                .map_err(|e| {
                    Error::ModelUnavailable(format!(
                        "Failed to initialize local embedding model: {e}"
                    ))
                })?;
                tracing::info!(model = %self.model_name, "loaded local embedding model");
                *guard = Some(model);
            }
            let Some(model) = guard.as_mut() else {
                return Err(Error::ModelUnavailable("embedding model not loaded".into()));
            };
            model
                .embed(texts.to_vec(), Some(self.batch_size))
                .map_err(|e| Error::ModelUnavailable(format!("Local embedding failed: {e}")))
        }
    }

    fn config_to_fastembed_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
        match name {
            "all-minilm-l6-v2" => Ok((fastembed::EmbeddingModel::AllMiniLML6V2, 384)),
            "bge-small-en-v1.5" => Ok((fastembed::EmbeddingModel::BGESmallENV15, 384)),
            "bge-base-en-v1.5" => Ok((fastembed::EmbeddingModel::BGEBaseENV15, 768)),
            "bge-large-en-v1.5" => Ok((fastembed::EmbeddingModel::BGELargeENV15, 1024)),
            "nomic-embed-text-v1.5" => Ok((fastembed::EmbeddingModel::NomicEmbedTextV15, 768)),
            "multilingual-e5-small" => Ok((fastembed::EmbeddingModel::MultilingualE5Small, 384)),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported: all-minilm-l6-v2, bge-small-en-v1.5, \
                 bge-base-en-v1.5, bge-large-en-v1.5, nomic-embed-text-v1.5, multilingual-e5-small",
                other
            ),
        }
    }
}
