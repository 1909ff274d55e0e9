//! `keel check` command implementation.
//!
//! Validates a batch of policy documents the way the engine would before committing them:
//! - every document parses as a policy object
//! - the combined policy passes validation
//! - ACL rules compile
//! - every claim resolves (failures are reported as warnings, they do not block a commit)

use anyhow::{Result, bail};
use keel_core::{KeelConfig, Policy};
use keel_planner::PolicyResolver;
use keel_policy::AclResolver;
use std::path::PathBuf;

use super::{external_data, read_objects};

/// Severity level for check results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// A single check finding.
#[derive(Debug, Clone)]
pub struct CheckFinding {
    pub severity: Severity,
    /// Category of the check that produced this finding.
    pub category: &'static str,
    pub message: String,
}

impl CheckFinding {
    fn error(category: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            message: message.into(),
        }
    }

    fn warning(category: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            category,
            message: message.into(),
        }
    }

    fn info(category: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            category,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CheckResults {
    pub findings: Vec<CheckFinding>,
}

impl CheckResults {
    fn add(&mut self, finding: CheckFinding) {
        self.findings.push(finding);
    }

    pub fn has_errors(&self) -> bool {
        self.count(Severity::Error) > 0
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }

    pub fn print_summary(&self) {
        let mut findings: Vec<&CheckFinding> = self.findings.iter().collect();
        findings.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.category.cmp(b.category)));
        for finding in findings {
            println!(
                "  {:<5} [{}] {}",
                finding.severity, finding.category, finding.message
            );
        }
        println!();
        println!(
            "Summary: {} error(s), {} warning(s)",
            self.count(Severity::Error),
            self.count(Severity::Warning)
        );
    }
}

/// Run every check over the given documents.
pub fn check_files(config: &KeelConfig, files: &[PathBuf]) -> CheckResults {
    let mut results = CheckResults::default();

    let objects = match read_objects(files) {
        Ok(objects) => objects,
        Err(e) => {
            results.add(CheckFinding::error("parse", format!("{:#}", e)));
            return results;
        }
    };
    results.add(CheckFinding::info(
        "parse",
        format!("{} object(s) loaded", objects.len()),
    ));

    let policy = match Policy::from_objects(objects) {
        Ok(policy) => policy,
        Err(e) => {
            results.add(CheckFinding::error("objects", e.to_string()));
            return results;
        }
    };

    if let Err(e) = policy.validate() {
        results.add(CheckFinding::error("validation", e.to_string()));
        return results;
    }

    if let Err(e) = AclResolver::new(&policy) {
        results.add(CheckFinding::error("acl", e.to_string()));
    }

    let external = external_data(config);
    let state = PolicyResolver::new(&policy, &external).resolve_all_dependencies();
    for (claim, error) in state.claim_errors() {
        results.add(CheckFinding::warning(
            "resolution",
            format!("claim '{}': {}", claim, error),
        ));
    }
    results.add(CheckFinding::info(
        "resolution",
        format!("{} component instance(s) resolved", state.len()),
    ));

    results
}

pub fn run(config: &KeelConfig, files: &[PathBuf]) -> Result<()> {
    println!("Checking {} path(s)...", files.len());
    let results = check_files(config, files);
    results.print_summary();

    if results.has_errors() {
        bail!("Policy check failed");
    }
    Ok(())
}
