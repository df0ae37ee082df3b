//! SQL validation and post-processing
//!
//! [`SqlValidator`] checks generated SQL against the known schema before
//! it is accepted; [`SqlPostProcessor`] canonicalizes accepted SQL.
//!
//! | Check | Kind | Severity |
//! |-------|------|----------|
//! | non-read statement | `dangerous_query` | error |
//! | empty input, unbalanced parentheses | `syntax_error` | error |
//! | unknown table | `invalid_table` | error |
//! | unknown `table.column` | `invalid_column` | error |
//! | several tables, no JOIN or WHERE | `cartesian_product` | warning |
//! | `SELECT *` without LIMIT or aggregate | `missing_limit` | warning |
//! | comma join | `missing_join` | info |
//!
//! Only errors make a result invalid.

mod postprocess;
mod scan;
mod validator;

pub use postprocess::SqlPostProcessor;
pub use validator::{
    qualified_columns, referenced_tables, similar_name, table_refs, Severity, SqlValidator,
    TableRef, ValidationErrorKind, ValidationIssue, ValidationResult,
};
