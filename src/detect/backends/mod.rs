pub mod http;
pub mod scripted;

pub use http::{HttpBackend, HttpBackendConfig};
pub use scripted::ScriptedBackend;
