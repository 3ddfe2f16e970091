//! Capabilities the core consumes from a browser-automation backend.
//!
//! - `context`: the automation context (one browser page/session) and its launcher
//! - `resolver`: element resolution with a deterministic primary and a heuristic fallback
//! - `content`: content, credentials and placeholder substitution

pub mod content;
pub mod context;
pub mod resolver;

pub use content::{ContentProvider, Credentials, ExecutionContent};
pub use context::{
    AutomationContext, AutomationLauncher, ElementFingerprint, ElementHandle, PageState,
    RawAction, RawActionKind,
};
pub use resolver::{
    ElementResolver, HeuristicResolver, Resolution, ResolutionSource, ResolveError, ResolveRequest,
    ResolvedElement, ResolverChain, SelectorResolver,
};
