use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::cache::LayoutCache;
use super::errors::{GenerationError, RejectionReason};
use super::generator::{furnish, LayoutGenerator};
use super::models::{GenerationParameters, Layout};
use super::validator::LayoutValidator;
use crate::config::{DifficultyPresets, EngineConfig};

struct GenerationInner {
    cache: LayoutCache,
    generator: LayoutGenerator,
    validator: LayoutValidator,
    presets: DifficultyPresets,
    retry_ceiling: u32,
    workers: Arc<Semaphore>,
    invocations: AtomicU64,
}

/// Produces validated layouts, memoized by the layout cache.
///
/// Generation runs on the blocking pool, gated by a semaphore sized to the
/// configured worker count.
#[derive(Clone)]
pub struct GenerationService {
    inner: Arc<GenerationInner>,
}

impl GenerationService {
    pub fn new(
        cache: LayoutCache,
        generator: LayoutGenerator,
        presets: DifficultyPresets,
        retry_ceiling: u32,
        worker_threads: usize,
    ) -> Self {
        Self {
            inner: Arc::new(GenerationInner {
                cache,
                generator,
                validator: LayoutValidator::new(),
                presets,
                retry_ceiling: retry_ceiling.max(1),
                workers: Arc::new(Semaphore::new(worker_threads.max(1))),
                invocations: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            LayoutCache::new(config.cache.max_entries),
            LayoutGenerator::new(config.layout.placement_attempts_per_room),
            config.difficulties.clone(),
            config.generation.retry_ceiling,
            config.generation.worker_threads,
        )
    }

    #[instrument(skip(self), fields(cache_key = %params.cache_key()))]
    pub async fn request_layout(
        &self,
        params: GenerationParameters,
    ) -> Result<Arc<Layout>, GenerationError> {
        params.check().map_err(|reason| {
            warn!(reason = %reason, "Rejected generation parameters");
            GenerationError::InvalidParameters(reason)
        })?;

        let service = self.clone();
        self.inner
            .cache
            .get_or_compute(params.cache_key(), move || async move {
                service.generate_with_retries(params).await
            })
            .await
    }

    async fn generate_with_retries(
        &self,
        params: GenerationParameters,
    ) -> Result<Layout, GenerationError> {
        let mut last_rejection = RejectionReason::Empty;

        for salt in 0..self.inner.retry_ceiling {
            match self.run_attempt(params, salt).await? {
                Ok(layout) => {
                    info!(
                        layout_id = %layout.id,
                        rooms = layout.room_count(),
                        attempt = salt + 1,
                        "Layout generated"
                    );
                    return Ok(layout);
                }
                Err(reason) => {
                    debug!(attempt = salt + 1, reason = %reason, "Candidate layout rejected");
                    last_rejection = reason;
                }
            }
        }

        warn!(
            attempts = self.inner.retry_ceiling,
            last_rejection = %last_rejection,
            "Layout generation exhausted"
        );
        Err(GenerationError::Exhausted {
            attempts: self.inner.retry_ceiling,
            last_rejection,
        })
    }

    /// One generate + validate + furnish pass on the blocking pool
    async fn run_attempt(
        &self,
        params: GenerationParameters,
        salt: u32,
    ) -> Result<Result<Layout, RejectionReason>, GenerationError> {
        let _permit = Arc::clone(&self.inner.workers)
            .acquire_owned()
            .await
            .map_err(|e| GenerationError::WorkerFailed(e.to_string()))?;

        self.inner.invocations.fetch_add(1, Ordering::SeqCst);

        let generator = self.inner.generator.clone();
        let validator = self.inner.validator.clone();
        let preset = self.inner.presets.preset(params.difficulty).clone();

        tokio::task::spawn_blocking(move || {
            let candidate = generator.generate(&params, &preset, salt);
            validator.validate(candidate).map(|mut layout| {
                furnish(&mut layout, &preset);
                layout
            })
        })
        .await
        .map_err(|e| GenerationError::WorkerFailed(e.to_string()))
    }

    /// Number of generator runs so far, across all retries
    pub fn generator_invocations(&self) -> u64 {
        self.inner.invocations.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &LayoutCache {
        &self.inner.cache
    }

    pub fn presets(&self) -> &DifficultyPresets {
        &self.inner.presets
    }
}
