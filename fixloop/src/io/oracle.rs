//! Fix oracle interface and its composable implementations.
//!
//! The loop consults a [`FixOracle`] for every error it tries to fix. The
//! rule table lives in [`crate::io::rules`]; [`CommandOracle`] delegates to
//! an external process speaking JSON, which is how a language-model-backed
//! service plugs in without the crate knowing any provider.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::diagnosis::ErrorEntry;
use crate::core::fix::{Fix, FixKind};
use crate::core::types::ProjectContext;
use crate::io::executor::{CommandRunner, RunRequest};

/// Root-cause explanation plus candidate fixes for one error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub root_cause: String,
    #[serde(default)]
    pub fixes: Vec<Fix>,
}

impl Proposal {
    pub fn new(root_cause: impl Into<String>, fixes: Vec<Fix>) -> Self {
        Self {
            root_cause: root_cause.into(),
            fixes,
        }
    }
}

/// Strategy that proposes fixes for a classified error.
pub trait FixOracle {
    fn propose_fix(&self, error: &ErrorEntry, context: &ProjectContext) -> Result<Proposal>;
}

impl<O: FixOracle + ?Sized> FixOracle for &O {
    fn propose_fix(&self, error: &ErrorEntry, context: &ProjectContext) -> Result<Proposal> {
        (**self).propose_fix(error, context)
    }
}

impl<O: FixOracle + ?Sized> FixOracle for Box<O> {
    fn propose_fix(&self, error: &ErrorEntry, context: &ProjectContext) -> Result<Proposal> {
        (**self).propose_fix(error, context)
    }
}

/// Highest confidence an external file edit may carry unless the oracle
/// reports that it validated the edit itself.
pub const UNVALIDATED_EDIT_CAP: f64 = 0.69;

#[derive(Debug, Serialize)]
struct OracleRequest<'a> {
    error: &'a ErrorEntry,
    context: &'a ProjectContext,
}

#[derive(Debug, Deserialize)]
struct OracleResponse {
    #[serde(default)]
    root_cause: String,
    #[serde(default)]
    fixes: Vec<Fix>,
    /// The oracle checked its edits (e.g. compiled the patched file).
    #[serde(default)]
    validated: bool,
}

/// Oracle backed by an external command.
///
/// The command receives `{"error": .., "context": ..}` on stdin and must print
/// a proposal (`root_cause`, `fixes`, optional `validated`) as JSON on stdout.
pub struct CommandOracle<R> {
    runner: R,
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl<R: CommandRunner> CommandOracle<R> {
    pub fn new(runner: R, command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            runner,
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

impl<R: CommandRunner> FixOracle for CommandOracle<R> {
    #[instrument(skip_all, fields(signature = %error.signature))]
    fn propose_fix(&self, error: &ErrorEntry, context: &ProjectContext) -> Result<Proposal> {
        let payload = serde_json::to_vec(&OracleRequest { error, context })
            .context("serialize oracle request")?;
        let request = RunRequest::new(self.command.clone(), &context.root, self.timeout)
            .with_output_limit(self.output_limit_bytes)
            .with_stdin(payload);
        let result = self.runner.run(&request).context("run oracle command")?;
        if result.timed_out {
            return Err(anyhow!("oracle command timed out after {:?}", self.timeout));
        }
        if result.exit_code != 0 {
            return Err(anyhow!(
                "oracle command failed with exit code {}: {}",
                result.exit_code,
                result.stderr.trim()
            ));
        }
        let response: OracleResponse =
            serde_json::from_str(result.stdout.trim()).context("parse oracle response")?;
        debug!(fixes = response.fixes.len(), validated = response.validated, "oracle responded");

        let fixes = response
            .fixes
            .into_iter()
            .map(|mut fix| {
                fix.confidence = fix.confidence.clamp(0.0, 1.0);
                let edits_files = matches!(fix.kind(), FixKind::PatchFile | FixKind::CreateFile);
                if edits_files && !response.validated && fix.confidence > UNVALIDATED_EDIT_CAP {
                    fix.confidence = UNVALIDATED_EDIT_CAP;
                }
                fix
            })
            .collect();
        Ok(Proposal::new(response.root_cause, fixes))
    }
}

/// Consult `primary`, falling back to `fallback` when it fails or proposes nothing.
pub struct FallbackOracle<A, B> {
    primary: A,
    fallback: B,
}

impl<A: FixOracle, B: FixOracle> FallbackOracle<A, B> {
    pub fn new(primary: A, fallback: B) -> Self {
        Self { primary, fallback }
    }
}

impl<A: FixOracle, B: FixOracle> FixOracle for FallbackOracle<A, B> {
    fn propose_fix(&self, error: &ErrorEntry, context: &ProjectContext) -> Result<Proposal> {
        let primary = match self.primary.propose_fix(error, context) {
            Ok(proposal) if !proposal.fixes.is_empty() => return Ok(proposal),
            Ok(proposal) => Some(proposal),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "primary oracle failed, using fallback");
                None
            }
        };
        let fallback = self.fallback.propose_fix(error, context)?;
        match primary {
            // Keep the primary explanation when neither side has a fix.
            Some(primary) if fallback.fixes.is_empty() && !primary.root_cause.is_empty() => {
                Ok(primary)
            }
            _ => Ok(fallback),
        }
    }
}
