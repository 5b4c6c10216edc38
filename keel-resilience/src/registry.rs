//! Process-wide pipeline registry
//!
//! The registry hands out one pipeline per dependency name, so every caller
//! guarding the same dependency shares one breaker and one bulkhead.

use log::{debug, info};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::clock::{system_clock, SharedClock};
use crate::error::{ConfigError, ConfigResult, ErrorClassifier, Retryable};
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineConfig, PipelineStats};

/// Named pipelines sharing one error type
pub struct PipelineRegistry<E> {
    pipelines: RwLock<HashMap<String, Pipeline<E>>>,
    clock: SharedClock,
    closed: AtomicBool,
}

impl<E> std::fmt::Debug for PipelineRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("pipelines", &self.names())
            .field("closed", &self.is_shut_down())
            .finish()
    }
}

impl<E> Default for PipelineRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> PipelineRegistry<E> {
    /// Create an empty registry on the system clock
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create an empty registry whose pipelines read time from `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    /// Return the pipeline for `name`, building it with `classifier` on first use
    ///
    /// The configuration is only consulted when the pipeline is created.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: &PipelineConfig,
        classifier: ErrorClassifier<E>,
    ) -> ConfigResult<Pipeline<E>> {
        self.ensure_open()?;

        if let Some(existing) = self.pipelines.read().get(name) {
            return Ok(existing.clone());
        }

        let mut pipelines = self.pipelines.write();
        self.ensure_open()?;
        if let Some(existing) = pipelines.get(name) {
            return Ok(existing.clone());
        }

        let pipeline = PipelineBuilder::with_classifier(name, classifier)
            .config(config.clone())
            .clock(self.clock.clone())
            .build()?;
        pipelines.insert(name.to_string(), pipeline.clone());
        info!("Registered resilience pipeline '{}'", name);

        Ok(pipeline)
    }

    /// Look up an existing pipeline
    pub fn get(&self, name: &str) -> Option<Pipeline<E>> {
        self.pipelines.read().get(name).cloned()
    }

    /// Remove a pipeline; callers still holding clones keep working
    pub fn remove(&self, name: &str) -> Option<Pipeline<E>> {
        let removed = self.pipelines.write().remove(name);
        if removed.is_some() {
            debug!("Removed resilience pipeline '{}'", name);
        }
        removed
    }

    /// Registered pipeline names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stats for every registered pipeline, sorted by name
    pub fn stats(&self) -> Vec<PipelineStats> {
        let mut stats: Vec<PipelineStats> =
            self.pipelines.read().values().map(Pipeline::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Drop every pipeline and refuse further registrations
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let count = {
            let mut pipelines = self.pipelines.write();
            let count = pipelines.len();
            pipelines.clear();
            count
        };
        info!("Pipeline registry shut down, released {} pipelines", count);
    }

    /// Whether [`PipelineRegistry::shutdown`] has run
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> ConfigResult<()> {
        if self.is_shut_down() {
            Err(ConfigError::RegistryClosed)
        } else {
            Ok(())
        }
    }
}

impl<E: Retryable + 'static> PipelineRegistry<E> {
    /// Return the pipeline for `name`, creating it on first use
    pub fn get_or_create(&self, name: &str, config: &PipelineConfig) -> ConfigResult<Pipeline<E>> {
        self.get_or_create_with(name, config, ErrorClassifier::default())
    }
}
