//! Policy compilation and trace analysis.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

use log::debug;
use serde_json::Value;

use tracewarden_trace::{Dataflow, Trace, TraceError};

use crate::compiled::CompiledPolicy;
use crate::compiler::compile;
use crate::detectors::DetectorRegistry;
use crate::error::{PolicyErrorBag, PolicyViolation, Warning, WarningKind};
use crate::eval::{evaluate_policy, EvalOutcome};
use crate::parser::parse_policy;

/// A compiled set of rules, reusable across many analyses.
#[derive(Debug)]
pub struct Policy {
    compiled: CompiledPolicy,
}

/// Per-analysis inputs.
///
/// The detector registry is passed in explicitly; a policy holds no global
/// detector state. With `strict` set, malformed trace input fails the
/// analysis instead of degrading to warnings.
#[derive(Default)]
pub struct AnalyzeOptions<'a> {
    /// Free policy inputs, read in rules as `input.<name>`.
    pub parameters: BTreeMap<String, Value>,
    pub registry: Option<&'a DetectorRegistry>,
    /// Checked between bindings and rules; when set, evaluation stops and
    /// the partial result is returned with `cancelled` set.
    pub cancel: Option<&'a AtomicBool>,
    pub strict: bool,
}

/// Result of applying a policy to a trace.
#[derive(Debug, Default)]
pub struct AnalysisResult {
    pub errors: Vec<PolicyViolation>,
    /// Violations routed through a registered handler (monitors only).
    pub handled_errors: Vec<PolicyViolation>,
    pub warnings: Vec<Warning>,
    /// True when evaluation was interrupted by the cancellation signal; the
    /// result holds whatever was found up to that point.
    pub cancelled: bool,
}

impl Policy {
    /// Compiles a policy source; parse and type errors are collected into
    /// the returned bag.
    pub fn from_string(source: &str) -> Result<Policy, PolicyErrorBag> {
        let (ast, mut errors) = parse_policy(source);
        match compile(&ast) {
            Ok(compiled) if errors.is_empty() => Ok(Policy { compiled }),
            Ok(_) => Err(PolicyErrorBag { errors }),
            Err(compile_errors) => {
                errors.extend(compile_errors);
                Err(PolicyErrorBag { errors })
            }
        }
    }

    /// Analyzes a trace and returns all violations.
    ///
    /// Repeated calls over the same trace return the same result; the
    /// policy keeps no state between analyses.
    pub fn analyze(
        &self,
        trace: &[Value],
        options: &AnalyzeOptions<'_>,
    ) -> Result<AnalysisResult, TraceError> {
        let (outcome, trace_warnings, _) = self.evaluate(trace, options)?;

        let mut result = AnalysisResult {
            cancelled: outcome.cancelled,
            warnings: trace_warnings,
            ..AnalysisResult::default()
        };
        for emitted in outcome.violations {
            result.errors.push(emitted.violation);
        }
        merge_warnings(&mut result.warnings, outcome.warnings);
        Ok(result)
    }

    /// Runs the evaluator, returning the raw outcome, trace-input warnings,
    /// and the parsed trace. Shared with the monitor, which needs event
    /// identities and per-rule completion for its fingerprinting.
    pub(crate) fn evaluate(
        &self,
        trace: &[Value],
        options: &AnalyzeOptions<'_>,
    ) -> Result<(EvalOutcome, Vec<Warning>, Trace), TraceError> {
        let parsed = if options.strict {
            Trace::parse_strict(trace)?
        } else {
            Trace::parse(trace)
        };
        let trace_warnings = parsed
            .warnings()
            .iter()
            .map(|w| {
                Warning::new(
                    WarningKind::TraceInput,
                    format!("{} (at {})", w.message, w.json_path),
                )
            })
            .collect();

        let dataflow = Dataflow::from_trace(&parsed);
        let empty_registry;
        let registry = match options.registry {
            Some(registry) => registry,
            None => {
                empty_registry = DetectorRegistry::new();
                &empty_registry
            }
        };

        debug!(
            "analyzing trace of {} node(s) against {} rule(s)",
            parsed.len(),
            self.compiled.rules.len()
        );
        let outcome = evaluate_policy(
            &self.compiled,
            &parsed,
            &dataflow,
            registry,
            &options.parameters,
            options.cancel,
        );
        Ok((outcome, trace_warnings, parsed))
    }
}

/// Appends warnings, dropping duplicates.
pub(crate) fn merge_warnings(into: &mut Vec<Warning>, from: Vec<Warning>) {
    for warning in from {
        if !into.contains(&warning) {
            into.push(warning);
        }
    }
}

/// One-shot convenience: compile and analyze in a single call.
pub fn analyze_trace(
    policy_source: &str,
    trace: &[Value],
) -> Result<AnalysisResult, PolicyErrorBag> {
    let policy = Policy::from_string(policy_source)?;
    Ok(policy
        .analyze(trace, &AnalyzeOptions::default())
        .expect("non-strict analysis does not fail on trace input"))
}
