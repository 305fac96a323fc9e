//! Bounded retry across capture strategies.

use super::{CapturedInput, InputCapture};
use crate::error::{ErrorClass, VoiceError, VoiceResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Tries each strategy in order, wrapping around, for at most `max_attempts` attempts.
pub struct FallbackCapture {
    strategies: Vec<Arc<dyn InputCapture>>,
    max_attempts: usize,
}

impl FallbackCapture {
    /// `strategies[0]` is the primary. `max_attempts` is clamped to 2..=3.
    pub fn new(strategies: Vec<Arc<dyn InputCapture>>, max_attempts: usize) -> Self {
        Self {
            strategies,
            max_attempts: max_attempts.clamp(2, 3),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl InputCapture for FallbackCapture {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn capture(&self) -> VoiceResult<CapturedInput> {
        if self.strategies.is_empty() {
            return Err(VoiceError::Config("no capture strategy configured".to_string()));
        }

        let mut last_error = String::new();
        for attempt in 0..self.max_attempts {
            let strategy = &self.strategies[attempt % self.strategies.len()];
            info!(attempt = attempt + 1, strategy = strategy.name(), "capturing input");
            match strategy.capture().await {
                Ok(input) => return Ok(input),
                Err(e) if e.class() == ErrorClass::Configuration => return Err(e),
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        strategy = strategy.name(),
                        "capture failed: {}",
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(VoiceError::InputCaptureExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }

    fn stop(&self) -> bool {
        // Only one strategy is ever active.
        self.strategies.iter().fold(false, |stopped, s| s.stop() || stopped)
    }
}
