//! Query text preparation.

mod binds;

pub use binds::{BindError, NormalizedQuery, ParamStyle, normalize_query};
