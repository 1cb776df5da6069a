//! Built-in source adapters.

pub mod guard;
pub mod http;

pub use http::{HTTP_JSON_KIND, HttpJsonAdapter};

use reaper_core::{AdapterRegistry, AppError};

/// Registry with every built-in adapter under its kind.
pub fn default_registry() -> Result<AdapterRegistry, AppError> {
    Ok(registry_with(HttpJsonAdapter::new()?))
}

/// Registry using a caller-configured HTTP adapter.
pub fn registry_with(http: HttpJsonAdapter) -> AdapterRegistry {
    AdapterRegistry::new().register(HTTP_JSON_KIND, http)
}
