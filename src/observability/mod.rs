//! Observability - structured logging setup and span macros

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

pub use crate::{connection_span, registry_span, store_span};
