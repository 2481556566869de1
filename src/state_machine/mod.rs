//! State machines built with `statig`.

pub mod invocation_sm;
