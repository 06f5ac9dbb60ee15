//! Incremental monitoring of a growing trace.
//!
//! A monitor wraps a compiled policy with memoization so that repeated
//! `check` calls over a prefix-growing trace report each violation exactly
//! once. Violations are fingerprinted by (rule id, bound event identities,
//! serialized constructor fields); fingerprints are committed only for
//! rules that ran to completion, so cancellation never corrupts monitor
//! state.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use log::debug;
use serde_json::Value;
use thiserror::Error;

use tracewarden_trace::TraceError;

use crate::detectors::DetectorRegistry;
use crate::engine::{merge_warnings, AnalysisResult, AnalyzeOptions, Policy};
use crate::error::{PolicyErrorBag, PolicyViolation};
use crate::eval::EmittedViolation;

/// Handler invoked for violations of a registered kind; such violations
/// land in `handled_errors` and never block.
pub type Handler = Box<dyn Fn(&PolicyViolation) + Send + Sync>;

/// Construction options for [`Monitor`].
#[derive(Default)]
pub struct MonitorOptions {
    /// Free policy inputs, as in [`AnalyzeOptions::parameters`].
    pub parameters: BTreeMap<String, Value>,
    /// When true, `check` fails with [`BlockingViolation`] if an unhandled
    /// violation references a pending event.
    pub raise_unhandled: bool,
    pub strict: bool,
}

/// Raised by [`Monitor::check`] when a pending action would violate the
/// policy and `raise_unhandled` is set.
#[derive(Debug)]
pub struct BlockingViolation {
    /// The unhandled violations attributable to pending events.
    pub violations: Vec<PolicyViolation>,
    /// The full result of the check, for callers that want the context.
    pub result: AnalysisResult,
}

impl fmt::Display for BlockingViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "policy analysis raised {} blocking violation(s):",
            self.violations.len()
        )?;
        for violation in &self.violations {
            writeln!(f, " - {violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BlockingViolation {}

/// Stateful wrapper around a policy for prefix-incremental evaluation.
pub struct Monitor {
    policy: Policy,
    options: MonitorOptions,
    registry: Option<DetectorRegistry>,
    handlers: Vec<(String, Handler)>,
    seen: HashSet<[u8; 32]>,
}

impl Monitor {
    pub fn new(source: &str, options: MonitorOptions) -> Result<Monitor, PolicyErrorBag> {
        Ok(Monitor {
            policy: Policy::from_string(source)?,
            options,
            registry: None,
            handlers: Vec::new(),
            seen: HashSet::new(),
        })
    }

    /// Detector registry used by subsequent `check` calls.
    pub fn with_registry(mut self, registry: DetectorRegistry) -> Monitor {
        self.registry = Some(registry);
        self
    }

    /// Registers a handler for an error kind (e.g. `"PolicyViolation"`).
    pub fn on(&mut self, kind: impl Into<String>, handler: Handler) {
        self.handlers.push((kind.into(), handler));
    }

    /// Clears all incremental state; every violation may be reported again.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    /// Checks the trace `past ++ pending`, reporting only violations not
    /// seen in earlier checks.
    ///
    /// For a sequence of calls in which each `past` extends the previous
    /// trace, the union of reported errors equals what a single batch
    /// analysis of the final trace would report.
    pub fn check(
        &mut self,
        past: &[Value],
        pending: &[Value],
    ) -> Result<AnalysisResult, CheckError> {
        let mut combined = Vec::with_capacity(past.len() + pending.len());
        combined.extend_from_slice(past);
        combined.extend_from_slice(pending);

        let analyze_options = AnalyzeOptions {
            parameters: self.options.parameters.clone(),
            registry: self.registry.as_ref(),
            cancel: None,
            strict: self.options.strict,
        };
        let (outcome, trace_warnings, trace) =
            self.policy.evaluate(&combined, &analyze_options)?;

        let completed: HashSet<usize> = outcome.completed_rules.iter().copied().collect();
        let mut result = AnalysisResult {
            cancelled: outcome.cancelled,
            warnings: trace_warnings,
            ..AnalysisResult::default()
        };
        merge_warnings(&mut result.warnings, outcome.warnings);

        let mut blocking = Vec::new();
        for emitted in outcome.violations {
            let fingerprint = fingerprint(&emitted);
            if self.seen.contains(&fingerprint) {
                continue;
            }
            // only completed rules commit state; an interrupted rule will
            // re-report on the next check
            if completed.contains(&emitted.violation.origin_rule) {
                self.seen.insert(fingerprint);
            }

            let references_pending = emitted
                .bound_events
                .iter()
                .any(|&id| trace.node(id).top_index >= past.len());

            if let Some(handler) = self.handler_for(&emitted.violation.kind) {
                handler(&emitted.violation);
                result.handled_errors.push(emitted.violation);
                continue;
            }

            if references_pending && self.options.raise_unhandled {
                blocking.push(emitted.violation.clone());
            }
            result.errors.push(emitted.violation);
        }

        debug!(
            "monitor check: {} new error(s), {} handled, {} blocking",
            result.errors.len(),
            result.handled_errors.len(),
            blocking.len()
        );

        if !blocking.is_empty() {
            return Err(CheckError::Blocking(BlockingViolation {
                violations: blocking,
                result,
            }));
        }
        Ok(result)
    }

    fn handler_for(&self, kind: &str) -> Option<&Handler> {
        self.handlers
            .iter()
            .find(|(registered, _)| registered == kind)
            .map(|(_, handler)| handler)
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("seen", &self.seen.len())
            .field("handlers", &self.handlers.len())
            .field("raise_unhandled", &self.options.raise_unhandled)
            .finish()
    }
}

/// Failure modes of [`Monitor::check`].
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Blocking(BlockingViolation),
}

/// Stable identity of a violation across checks: rule id, the sorted bound
/// event identities, and the serialized constructor fields.
fn fingerprint(emitted: &EmittedViolation) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&emitted.violation.origin_rule.to_le_bytes());
    for &id in &emitted.bound_events {
        hasher.update(&id.to_le_bytes());
    }
    hasher.update(emitted.violation.kind.as_bytes());
    hasher.update(emitted.violation.message.as_bytes());
    for (key, value) in &emitted.violation.fields {
        hasher.update(key.as_bytes());
        hasher.update(value.to_string().as_bytes());
    }
    *hasher.finalize().as_bytes()
}
