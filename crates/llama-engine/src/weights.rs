//! Weight loading with cooperative cancellation.
//!
//! Loading is the only phase of a session that honours cancellation. The token
//! is polled before the base model loads, from inside the backend's progress
//! callback, and between LoRA adapters.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::LlamaError;

/// A LoRA adapter to apply on top of the base weights.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoraAdapter {
    pub path: String,
    pub scale: f32,
}

/// Parameters for loading a model.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelParams {
    /// Path to the model weights.
    pub model_path: String,

    /// Adapters applied in order after the base model loads.
    #[serde(default)]
    pub lora_adapters: Vec<LoraAdapter>,

    /// Optional higher-precision base used while applying adapters.
    #[serde(default)]
    pub lora_base: Option<String>,
}

/// Backend hook that actually reads weights.
pub trait WeightLoader: Send + Sync + 'static {
    type Weights: Send + 'static;

    /// Load the base model. `progress` receives a fraction in `[0, 1]` and
    /// returns `false` to request an abort.
    fn load(
        &self,
        path: &str,
        progress: &mut dyn FnMut(f32) -> bool,
    ) -> crate::Result<Self::Weights>;

    /// Apply one adapter to already-loaded weights.
    fn apply_lora(
        &self,
        weights: &mut Self::Weights,
        path: &str,
        scale: f32,
        base: Option<&str>,
    ) -> crate::Result<()>;
}

/// Errors from weight loading. Cancellation is kept apart from failure.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("weight loading cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] LlamaError),
    #[error("loader task failed: {0}")]
    Join(String),
}

/// Load weights on the current thread.
pub fn load_weights<L: WeightLoader>(
    loader: &L,
    params: &ModelParams,
    cancel: &CancellationToken,
) -> Result<L::Weights, LoadError> {
    if cancel.is_cancelled() {
        return Err(LoadError::Cancelled);
    }

    let mut progress = |_fraction: f32| !cancel.is_cancelled();
    let mut weights = match loader.load(&params.model_path, &mut progress) {
        Ok(weights) => weights,
        // A backend aborted by our callback reports a plain failure.
        Err(_) if cancel.is_cancelled() => return Err(LoadError::Cancelled),
        Err(e) => return Err(LoadError::Failed(e)),
    };

    for adapter in &params.lora_adapters {
        if cancel.is_cancelled() {
            tracing::info!(path = %params.model_path, "weight loading cancelled between adapters");
            return Err(LoadError::Cancelled);
        }

        if adapter.path.is_empty() || adapter.scale <= 0.0 {
            tracing::debug!(path = %adapter.path, scale = adapter.scale, "skipping invalid adapter");
            continue;
        }

        loader.apply_lora(
            &mut weights,
            &adapter.path,
            adapter.scale,
            params.lora_base.as_deref(),
        )?;
    }

    Ok(weights)
}

/// Load weights on the blocking pool.
pub async fn load_weights_async<L: WeightLoader>(
    loader: Arc<L>,
    params: ModelParams,
    cancel: CancellationToken,
) -> Result<L::Weights, LoadError> {
    tokio::task::spawn_blocking(move || load_weights(loader.as_ref(), &params, &cancel))
        .await
        .map_err(|e| LoadError::Join(e.to_string()))?
}
