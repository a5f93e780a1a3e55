//! Work-context admission
//!
//! A unit of work arrives with a set of contexts describing who runs it and
//! under what coordination. The store validates the whole set before
//! accepting any operation from the unit: an unsupported category or a
//! category presented twice rejects the unit up front, never after some of
//! its writes were taken.
//!
//! Duplicate detection is by category: a specialized form of a context
//! counts as a duplicate of its base form, since only one context of a
//! category can govern a unit of work.

use mqstore_core::{Error, Result};
use rustc_hash::FxHashSet;

/// Closed set of context categories a unit of work can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextCategory {
    /// Identity the unit runs under
    Security,
    /// External transaction coordination
    Transaction,
    /// Scheduling hints for the hosting runtime
    Hints,
    /// Marks the unit as long-running
    LongRunning,
}

impl ContextCategory {
    /// Category name for error reporting
    pub fn name(&self) -> &'static str {
        match self {
            ContextCategory::Security => "security",
            ContextCategory::Transaction => "transaction",
            ContextCategory::Hints => "hints",
            ContextCategory::LongRunning => "long-running",
        }
    }
}

/// One context attached to a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkContext {
    category: ContextCategory,
    variant: &'static str,
}

impl WorkContext {
    /// Plain security context
    pub fn security() -> Self {
        WorkContext {
            category: ContextCategory::Security,
            variant: "security",
        }
    }

    /// Run-as security context; same category as [`WorkContext::security`]
    pub fn security_run_as() -> Self {
        WorkContext {
            category: ContextCategory::Security,
            variant: "security/run-as",
        }
    }

    /// Transaction coordination context
    pub fn transaction() -> Self {
        WorkContext {
            category: ContextCategory::Transaction,
            variant: "transaction",
        }
    }

    /// Scheduling hints context
    pub fn hints() -> Self {
        WorkContext {
            category: ContextCategory::Hints,
            variant: "hints",
        }
    }

    /// Long-running work context
    pub fn long_running() -> Self {
        WorkContext {
            category: ContextCategory::LongRunning,
            variant: "long-running",
        }
    }

    /// The category this context belongs to
    pub fn category(&self) -> ContextCategory {
        self.category
    }

    /// Concrete variant name
    pub fn variant(&self) -> &'static str {
        self.variant
    }
}

/// Which context categories this store accepts
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    supported: Vec<ContextCategory>,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        AdmissionPolicy {
            supported: vec![
                ContextCategory::Security,
                ContextCategory::Transaction,
                ContextCategory::Hints,
            ],
        }
    }
}

impl AdmissionPolicy {
    /// Policy supporting exactly `supported`
    pub fn new(supported: Vec<ContextCategory>) -> Self {
        AdmissionPolicy { supported }
    }

    /// True when `category` is accepted
    pub fn supports(&self, category: ContextCategory) -> bool {
        self.supported.contains(&category)
    }

    /// Validate a unit of work's full context set
    ///
    /// Checks run before any operation of the unit is accepted. The first
    /// offending context decides the error.
    pub fn validate(&self, contexts: &[WorkContext]) -> Result<()> {
        let mut seen: FxHashSet<ContextCategory> = FxHashSet::default();
        for context in contexts {
            let category = context.category();
            if !self.supports(category) {
                return Err(Error::UnsupportedContext {
                    category: category.name(),
                });
            }
            if !seen.insert(category) {
                return Err(Error::DuplicateContext {
                    category: category.name(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqstore_core::AdmissionCode;

    #[test]
    fn test_default_policy_accepts_common_set() {
        let policy = AdmissionPolicy::default();
        policy
            .validate(&[
                WorkContext::security(),
                WorkContext::transaction(),
                WorkContext::hints(),
            ])
            .unwrap();
    }

    #[test]
    fn test_unsupported_category_rejected() {
        let policy = AdmissionPolicy::default();
        let err = policy
            .validate(&[WorkContext::security(), WorkContext::long_running()])
            .unwrap_err();
        assert_eq!(err.admission_code(), Some(AdmissionCode::Unsupported));
    }

    #[test]
    fn test_duplicate_category_rejected() {
        let policy = AdmissionPolicy::default();
        let err = policy
            .validate(&[WorkContext::security(), WorkContext::security()])
            .unwrap_err();
        assert_eq!(err.admission_code(), Some(AdmissionCode::Duplicate));
    }

    #[test]
    fn test_specialized_variant_duplicates_its_base() {
        // security/run-as is still a security context
        let policy = AdmissionPolicy::default();
        let err = policy
            .validate(&[WorkContext::security(), WorkContext::security_run_as()])
            .unwrap_err();
        assert_eq!(err.admission_code(), Some(AdmissionCode::Duplicate));
    }

    #[test]
    fn test_empty_context_set_is_valid() {
        AdmissionPolicy::default().validate(&[]).unwrap();
    }
}
