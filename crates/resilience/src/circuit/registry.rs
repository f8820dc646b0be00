//! Lazily populated set of circuit breakers keyed by boundary name.

use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use super::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::errors::ResilienceError;
use crate::runtime::{Clock, SystemClock};

/// One breaker per boundary, sharing a single config.
///
/// Breakers are created on first use and live until [`remove`](Self::remove)
/// is called. Each breaker locks independently; the map itself is sharded.
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ResilienceError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            breakers: DashMap::new(),
        })
    }

    /// Get the breaker for `boundary`, creating it if needed.
    pub fn get_or_create(&self, boundary: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(boundary) {
            return existing.clone();
        }

        self.breakers
            .entry(boundary.to_string())
            .or_insert_with(|| {
                debug!("Circuit registry: creating breaker for '{}'", boundary);
                Arc::new(CircuitBreaker::from_validated(
                    boundary.to_string(),
                    self.config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, boundary: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(boundary).map(|entry| entry.clone())
    }

    /// Drop the breaker for `boundary`. Returns whether one existed.
    pub fn remove(&self, boundary: &str) -> bool {
        let removed = self.breakers.remove(boundary).is_some();
        if removed {
            debug!("Circuit registry: removed breaker for '{}'", boundary);
        }
        removed
    }

    /// Snapshots of every breaker, sorted by boundary name.
    pub fn snapshots(&self) -> Vec<CircuitState> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|entry| entry.value().clone()).collect();
        let mut states: Vec<CircuitState> = breakers.iter().map(|cb| cb.snapshot()).collect();
        states.sort_by(|a, b| a.boundary.cmp(&b.boundary));
        states
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|entry| entry.value().clone()).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
