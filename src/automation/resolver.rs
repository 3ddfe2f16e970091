//! Element resolution.
//!
//! The executor asks a [`ResolverChain`] for each step's element. The chain
//! tries the deterministic primary resolver first and, only when that finds
//! nothing, the fallback once. Each attempt is bounded by the element timeout
//! and aborted on cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::automation::context::{AutomationContext, ElementHandle};
use crate::error::AutomationError;
use crate::workflows::{ElementSelector, SelectorKind, StepAction};

/// What the executor needs resolved.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub selector: &'a ElementSelector,
    pub action: StepAction,
    pub description: &'a str,
}

/// A located element with the resolver's confidence in the match.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedElement {
    pub handle: ElementHandle,
    pub confidence: f64,
}

/// Finds elements on the current page.
#[async_trait]
pub trait ElementResolver: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when the element is not on the page.
    async fn resolve(
        &self,
        ctx: &mut dyn AutomationContext,
        request: &ResolveRequest<'_>,
    ) -> Result<Option<ResolvedElement>, AutomationError>;
}

/// Looks up the stored selector verbatim.
#[derive(Debug, Default)]
pub struct SelectorResolver;

#[async_trait]
impl ElementResolver for SelectorResolver {
    fn name(&self) -> &str {
        "selector"
    }

    async fn resolve(
        &self,
        ctx: &mut dyn AutomationContext,
        request: &ResolveRequest<'_>,
    ) -> Result<Option<ResolvedElement>, AutomationError> {
        Ok(ctx
            .find_element(request.selector)
            .await?
            .map(|handle| ResolvedElement {
                handle,
                confidence: request.selector.confidence,
            }))
    }
}

/// Fallback that derives alternative selectors from the stored one and the
/// step description: id-like values are retried as test ids and aria labels,
/// quoted words in the description as visible text.
#[derive(Debug, Default)]
pub struct HeuristicResolver;

/// Confidence reported for heuristic matches.
const HEURISTIC_CONFIDENCE: f64 = 0.3;

impl HeuristicResolver {
    fn candidates(request: &ResolveRequest<'_>) -> Vec<ElementSelector> {
        let value = request.selector.value.trim();
        let mut out = Vec::new();

        if request.selector.kind == SelectorKind::Id && !value.is_empty() {
            out.push(ElementSelector::new(SelectorKind::Css, format!("[data-testid=\"{value}\"]")));
            out.push(ElementSelector::new(SelectorKind::Css, format!("[aria-label=\"{value}\"]")));
            out.push(ElementSelector::new(SelectorKind::Css, format!("[name=\"{value}\"]")));
        }

        for quoted in request.description.split(['"', '\'']).skip(1).step_by(2) {
            let quoted = quoted.trim();
            if !quoted.is_empty() {
                out.push(ElementSelector::new(SelectorKind::Text, quoted));
            }
        }

        if request.selector.kind != SelectorKind::Text && !value.is_empty() && !value.contains(['/', '>', '[', '#', '.']) {
            out.push(ElementSelector::new(SelectorKind::Text, value));
        }

        out.retain(|c| c != request.selector);
        out
    }
}

#[async_trait]
impl ElementResolver for HeuristicResolver {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn resolve(
        &self,
        ctx: &mut dyn AutomationContext,
        request: &ResolveRequest<'_>,
    ) -> Result<Option<ResolvedElement>, AutomationError> {
        for candidate in Self::candidates(request) {
            if let Some(handle) = ctx.find_element(&candidate).await? {
                tracing::debug!(
                    kind = ?candidate.kind,
                    value = %candidate.value,
                    "Heuristic resolver matched alternative selector"
                );
                return Ok(Some(ResolvedElement {
                    handle,
                    confidence: HEURISTIC_CONFIDENCE,
                }));
            }
        }
        Ok(None)
    }
}

/// Which resolver produced the element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Primary,
    Fallback,
}

/// A successful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub handle: ElementHandle,
    pub confidence: f64,
    pub source: ResolutionSource,
}

/// Why a [`ResolverChain`] produced no element.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("resolution cancelled")]
    Cancelled,
    #[error("{0}")]
    Unresolved(String),
}

/// Primary resolver plus an optional fallback, each bounded by `timeout`.
#[derive(Clone)]
pub struct ResolverChain {
    primary: Arc<dyn ElementResolver>,
    fallback: Option<Arc<dyn ElementResolver>>,
    timeout: Duration,
}

impl ResolverChain {
    pub fn new(primary: Arc<dyn ElementResolver>, timeout: Duration) -> Self {
        Self {
            primary,
            fallback: None,
            timeout,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ElementResolver>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Resolve an element, trying the fallback once when the primary finds
    /// nothing. Cancellation wins over any attempt still in flight.
    pub async fn resolve(
        &self,
        ctx: &mut dyn AutomationContext,
        request: &ResolveRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Resolution, ResolveError> {
        let primary_err = match self.attempt(self.primary.as_ref(), ctx, request, cancel).await? {
            Ok(Some(found)) => {
                return Ok(Resolution {
                    handle: found.handle,
                    confidence: found.confidence,
                    source: ResolutionSource::Primary,
                });
            }
            Ok(None) => format!("{} resolver found no match", self.primary.name()),
            Err(e) => format!("{} resolver: {e}", self.primary.name()),
        };

        let Some(fallback) = &self.fallback else {
            return Err(ResolveError::Unresolved(primary_err));
        };

        tracing::debug!(
            selector = %request.selector.value,
            fallback = fallback.name(),
            "Primary resolution failed, trying fallback"
        );

        match self.attempt(fallback.as_ref(), ctx, request, cancel).await? {
            Ok(Some(found)) => Ok(Resolution {
                handle: found.handle,
                confidence: found.confidence,
                source: ResolutionSource::Fallback,
            }),
            Ok(None) => Err(ResolveError::Unresolved(format!(
                "{primary_err}; {} resolver found no match",
                fallback.name()
            ))),
            Err(e) => Err(ResolveError::Unresolved(format!(
                "{primary_err}; {} resolver: {e}",
                fallback.name()
            ))),
        }
    }

    /// One bounded attempt. The outer error is reserved for cancellation.
    async fn attempt(
        &self,
        resolver: &dyn ElementResolver,
        ctx: &mut dyn AutomationContext,
        request: &ResolveRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Result<Option<ResolvedElement>, AutomationError>, ResolveError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResolveError::Cancelled),
            res = tokio::time::timeout(self.timeout, resolver.resolve(ctx, request)) => {
                Ok(res.unwrap_or(Err(AutomationError::Timeout(self.timeout))))
            }
        }
    }
}
