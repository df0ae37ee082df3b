//! # sluice-sql
//!
//! The SQL half of the Sluice pipeline: query-plan templates, validation and
//! canonicalization of generated SQL, prompt assembly, the execution feedback
//! loop and the request orchestrator that ties every stage together.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`plan`] | question pattern detection, templated plan cache |
//! | [`validate`] | schema-aware validator, post-processor |
//! | [`prompt`] | prompt builder with cached static parts |
//! | [`feedback`] | error classification and correction loop |
//! | [`collab`] | completion, executor and schema provider traits |
//! | [`orchestrator`] | end-to-end request handling |

pub mod collab;
pub mod feedback;
pub mod orchestrator;
pub mod plan;
pub mod prompt;
pub mod types;
pub mod validate;

pub use collab::{Completion, OpenAiCompletion, SchemaProvider, SqlExecutor, StaticSchemaProvider};
pub use feedback::{ExecutionFeedback, ExecutionFeedbackLoop, FeedbackOutcome, SqlErrorKind};
pub use orchestrator::{Collaborators, ExecutedAnswer, RequestOrchestrator};
pub use plan::{QueryPattern, QueryPatternDetector, QueryPlanCache};
pub use prompt::PromptBuilder;
pub use types::{ChatMessage, QueryResult, Role, SqlQuery};
pub use validate::{SqlPostProcessor, SqlValidator, ValidationResult};
