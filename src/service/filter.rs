//! Filter expression interface
//!
//! Expressions are compiled by an external matcher library; the engine only
//! evaluates the compiled predicate against a (transformed) JSON body and
//! asks which document facets the expression references, which decides how
//! much body processing the router must do per mutation.

use crate::Result;
use std::sync::Arc;

/// A compiled filter predicate over a JSON document
pub trait FilterMatcher: Send + Sync {
    /// Evaluate the predicate against a JSON body
    fn matches(&self, body: &[u8]) -> Result<bool>;

    /// Whether the expression references the document key
    fn references_doc_key(&self) -> bool;

    /// Whether the expression references xattrs
    fn references_xattrs(&self) -> bool;

    /// Whether the expression references document body fields
    fn references_body(&self) -> bool {
        true
    }
}

/// Compiles filter expressions
pub trait FilterFactory: Send + Sync {
    /// Compile an expression into a matcher
    fn compile(&self, expression: &str) -> Result<Arc<dyn FilterMatcher>>;
}
