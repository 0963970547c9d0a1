//! Processor configuration builder (spec.md §6).

use std::sync::Arc;
use std::time::Duration;

use crate::error::PsepError;
use crate::error::Result;
use crate::error::psep_error;
use crate::handler::EventHandlerInvoker;
use crate::source::StreamableMessageSource;
use crate::token::store::TokenStore;
use crate::token::tracking_token::TrackingToken;
use crate::transaction::TransactionManager;

/// Predicate deciding whether a handler failure should roll back the
/// in-flight batch (spec.md §6 `rollbackConfiguration`). Default: any
/// error rolls back.
pub type RollbackConfiguration = Arc<dyn Fn(&PsepError) -> bool + Send + Sync>;

/// Processor-level error policy (spec.md §6 `errorHandler`). Default:
/// propagate (return `true`, meaning "let the failure abort the work
/// package").
pub type ErrorHandler = Arc<dyn Fn(&PsepError) -> bool + Send + Sync>;

/// A function computing the initial token from the message source
/// (spec.md §6 `initialToken`, SPEC_FULL.md §6.2). Default: tail.
pub type InitialTokenFn = Arc<
    dyn Fn(
            Arc<dyn StreamableMessageSource>,
        ) -> futures::future::BoxFuture<'static, Result<TrackingToken>>
        + Send
        + Sync,
>;

/// Validated configuration for a [`crate::processor::StreamingEventProcessor`].
///
/// Constructed only via [`ProcessorConfigBuilder::build`], which performs
/// the validation spec.md §6's table requires.
#[derive(Clone)]
pub struct ProcessorConfig {
    pub name: String,
    pub message_source: Arc<dyn StreamableMessageSource>,
    pub token_store: Arc<dyn TokenStore>,
    pub event_handler_invoker: Arc<dyn EventHandlerInvoker>,
    pub transaction_manager: Arc<dyn TransactionManager>,
    pub rollback_configuration: RollbackConfiguration,
    pub error_handler: ErrorHandler,
    pub initial_segment_count: u32,
    pub initial_token: InitialTokenFn,
    pub token_claim_interval: Duration,
    pub claim_extension_threshold: Duration,
    pub batch_size: usize,
    pub max_claimed_segments: u32,
}

/// Builder for [`ProcessorConfig`]; mirrors the `Option<T>`-fields builder
/// pattern used throughout the source ecosystem (e.g. `AgentLoopBuilder`).
#[derive(Default)]
pub struct ProcessorConfigBuilder {
    name: Option<String>,
    message_source: Option<Arc<dyn StreamableMessageSource>>,
    token_store: Option<Arc<dyn TokenStore>>,
    event_handler_invoker: Option<Arc<dyn EventHandlerInvoker>>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    rollback_configuration: Option<RollbackConfiguration>,
    error_handler: Option<ErrorHandler>,
    initial_segment_count: Option<u32>,
    initial_token: Option<InitialTokenFn>,
    token_claim_interval: Option<Duration>,
    claim_extension_threshold: Option<Duration>,
    batch_size: Option<usize>,
    max_claimed_segments: Option<u32>,
}

impl ProcessorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn message_source(mut self, source: Arc<dyn StreamableMessageSource>) -> Self {
        self.message_source = Some(source);
        self
    }

    pub fn token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    pub fn event_handler_invoker(mut self, handler: Arc<dyn EventHandlerInvoker>) -> Self {
        self.event_handler_invoker = Some(handler);
        self
    }

    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = Some(manager);
        self
    }

    pub fn rollback_configuration(mut self, rollback: RollbackConfiguration) -> Self {
        self.rollback_configuration = Some(rollback);
        self
    }

    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn initial_segment_count(mut self, count: u32) -> Self {
        self.initial_segment_count = Some(count);
        self
    }

    pub fn initial_token(mut self, f: InitialTokenFn) -> Self {
        self.initial_token = Some(f);
        self
    }

    pub fn token_claim_interval(mut self, interval: Duration) -> Self {
        self.token_claim_interval = Some(interval);
        self
    }

    pub fn claim_extension_threshold(mut self, threshold: Duration) -> Self {
        self.claim_extension_threshold = Some(threshold);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn max_claimed_segments(mut self, max: u32) -> Self {
        self.max_claimed_segments = Some(max);
        self
    }

    /// Validate and construct the final [`ProcessorConfig`]. Collects every
    /// violation rather than failing on the first, since this is a one-shot
    /// call.
    pub fn build(self) -> Result<ProcessorConfig> {
        let mut problems = Vec::new();

        if self.name.as_deref().map(str::is_empty).unwrap_or(true) {
            problems.push("name is required and must be non-empty".to_string());
        }
        if self.message_source.is_none() {
            problems.push("messageSource is required".to_string());
        }
        if self.token_store.is_none() {
            problems.push("tokenStore is required".to_string());
        }
        if self.event_handler_invoker.is_none() {
            problems.push("eventHandlerInvoker is required".to_string());
        }
        if self.transaction_manager.is_none() {
            problems.push("transactionManager is required".to_string());
        }

        let initial_segment_count = self.initial_segment_count.unwrap_or(16);
        if initial_segment_count == 0 {
            problems.push("initialSegmentCount must be > 0".to_string());
        }

        let token_claim_interval = self.token_claim_interval.unwrap_or(Duration::from_secs(5));
        if token_claim_interval.is_zero() {
            problems.push("tokenClaimInterval must be > 0".to_string());
        }

        let claim_extension_threshold = self
            .claim_extension_threshold
            .unwrap_or(Duration::from_secs(5));
        if claim_extension_threshold.is_zero() {
            problems.push("claimExtensionThreshold must be > 0".to_string());
        }

        let batch_size = self.batch_size.unwrap_or(1);
        if batch_size == 0 {
            problems.push("batchSize must be > 0".to_string());
        }

        let max_claimed_segments = self.max_claimed_segments.unwrap_or(u16::MAX as u32);
        if max_claimed_segments == 0 {
            problems.push("maxClaimedSegments must be > 0".to_string());
        }

        if !problems.is_empty() {
            return psep_error::ConfigurationSnafu {
                message: problems.join("; "),
            }
            .fail();
        }

        Ok(ProcessorConfig {
            name: self.name.unwrap(),
            message_source: self.message_source.unwrap(),
            token_store: self.token_store.unwrap(),
            event_handler_invoker: self.event_handler_invoker.unwrap(),
            transaction_manager: self.transaction_manager.unwrap(),
            rollback_configuration: self
                .rollback_configuration
                .unwrap_or_else(|| Arc::new(|_: &PsepError| true)),
            error_handler: self.error_handler.unwrap_or_else(|| Arc::new(|_| true)),
            initial_segment_count,
            initial_token: self.initial_token.unwrap_or_else(default_initial_token),
            token_claim_interval,
            claim_extension_threshold,
            batch_size,
            max_claimed_segments,
        })
    }
}

fn default_initial_token() -> InitialTokenFn {
    Arc::new(|source: Arc<dyn StreamableMessageSource>| {
        Box::pin(async move { source.create_tail_token().await })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryTokenStore;
    use crate::testing::NoopEventHandlerInvoker;
    use crate::testing::VecMessageSource;

    #[test]
    fn build_fails_with_collected_problems_when_empty() {
        let err = ProcessorConfigBuilder::new().build().unwrap_err();
        assert_eq!(err.kind(), crate::error::PsepErrorKind::Configuration);
        let message = err.to_string();
        assert!(message.contains("name"));
        assert!(message.contains("messageSource"));
    }

    #[test]
    fn build_fails_on_zero_batch_size() {
        let err = ProcessorConfigBuilder::new()
            .name("proc")
            .message_source(Arc::new(VecMessageSource::new(false)))
            .token_store(Arc::new(InMemoryTokenStore::new()))
            .event_handler_invoker(Arc::new(NoopEventHandlerInvoker))
            .transaction_manager(Arc::new(crate::transaction::NoopTransactionManager))
            .batch_size(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("batchSize"));
    }

    #[test]
    fn build_succeeds_with_defaults() {
        let config = ProcessorConfigBuilder::new()
            .name("proc")
            .message_source(Arc::new(VecMessageSource::new(false)))
            .token_store(Arc::new(InMemoryTokenStore::new()))
            .event_handler_invoker(Arc::new(NoopEventHandlerInvoker))
            .transaction_manager(Arc::new(crate::transaction::NoopTransactionManager))
            .build()
            .expect("defaults should satisfy validation");
        assert_eq!(config.initial_segment_count, 16);
        assert_eq!(config.max_claimed_segments, u16::MAX as u32);
    }
}
