pub mod cache;
pub mod config;
pub mod context;
pub mod degrade;
pub mod executor;
pub mod locator;
pub mod locks;
pub mod manifest;
pub mod metadata;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod publish;
pub mod request;
pub mod sanitize;
pub mod scan;
pub mod storage;
pub mod syntax;
pub mod timeline;
pub mod validation;

pub use config::ServiceConfig;
pub use context::RenderContext;
pub use pipeline::{Backends, Pipeline, RenderResponse};
pub use request::RenderRequest;
