// pipelite-core/src/lib.rs
// Embedded aggregation pipeline engine over schema-less documents

pub mod error;
pub mod value;
pub mod document;
pub mod expression;
pub mod query;
pub mod aggregation;
pub mod options;
pub mod engine;

// Public exports
pub use error::{PipeliteError, Result};
pub use value::Value;
pub use document::Document;
pub use expression::Expr;
pub use query::Query;
pub use aggregation::{ExecContext, Pipeline, Stage};
pub use options::EngineOptions;
pub use engine::{CollectionSource, Engine, MemoryCatalog};
