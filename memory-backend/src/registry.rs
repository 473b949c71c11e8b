//! Process-wide registry mapping a backend name to a zero-argument factory.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use common::error::AppError;
use tracing::warn;

use crate::episodic::EpisodicTemporalBackend;
use crate::hierarchical::HierarchicalClusterBackend;
use crate::null_backend::NullBackend;
use crate::types::MemoryBackend;

type Factory = Box<dyn Fn() -> Result<Box<dyn MemoryBackend>, AppError> + Send + Sync>;

fn registry() -> &'static Mutex<HashMap<String, Factory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Factory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers `factory` under `name`, overwriting any prior registration.
pub fn register_backend(name: &str, factory: Factory) {
    #[allow(clippy::unwrap_used)]
    registry().lock().unwrap().insert(name.to_string(), factory);
}

/// Constructs the backend registered under `name`, if any.
pub fn get_backend(name: &str) -> Option<Result<Box<dyn MemoryBackend>, AppError>> {
    #[allow(clippy::unwrap_used)]
    let guard = registry().lock().unwrap();
    guard.get(name).map(|factory| factory())
}

/// Returns every registered backend name, sorted lexicographically.
#[must_use]
pub fn list_backends() -> Vec<String> {
    #[allow(clippy::unwrap_used)]
    let guard = registry().lock().unwrap();
    let mut names: Vec<String> = guard.keys().cloned().collect();
    names.sort();
    names
}

/// Resolves the backend name to use: `explicit` if given, else
/// `WC_MEMORY_BACKEND`, else `"null"`.
#[must_use]
pub fn resolve_backend_name(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("WC_MEMORY_BACKEND").ok())
        .unwrap_or_else(|| "null".to_string())
}

/// Registers the built-in adapters if not already present. Construction
/// failures (missing external engine path, missing credentials) are
/// warn-and-skip, never fatal to registry setup.
pub fn auto_register_builtin() {
    register_backend("null", Box::new(|| Ok(Box::new(NullBackend::new()) as Box<dyn MemoryBackend>)));

    {
        #[allow(clippy::unwrap_used)]
        let already = registry().lock().unwrap().contains_key("leanrag");
        if !already {
            register_backend(
                "leanrag",
                Box::new(|| {
                    HierarchicalClusterBackend::from_env()
                        .map(|b| Box::new(b) as Box<dyn MemoryBackend>)
                }),
            );
        }
    }

    {
        #[allow(clippy::unwrap_used)]
        let already = registry().lock().unwrap().contains_key("graphiti");
        if !already {
            register_backend(
                "graphiti",
                Box::new(|| {
                    EpisodicTemporalBackend::from_env()
                        .map(|b| Box::new(b) as Box<dyn MemoryBackend>)
                }),
            );
        }
    }
}

/// Constructs and returns the backend named by `resolve_backend_name`,
/// warning and falling back to the null backend if construction fails.
pub fn resolve_backend(explicit: Option<&str>) -> Box<dyn MemoryBackend> {
    let name = resolve_backend_name(explicit);
    match get_backend(&name) {
        Some(Ok(backend)) => backend,
        Some(Err(err)) => {
            warn!(backend = %name, error = %err, "backend construction failed, falling back to null");
            Box::new(NullBackend::new())
        }
        None => {
            warn!(backend = %name, "unknown backend, falling back to null");
            Box::new(NullBackend::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_backend_always_registers() {
        auto_register_builtin();
        assert!(list_backends().contains(&"null".to_string()));
    }

    #[test]
    fn resolve_backend_name_defaults_to_null() {
        assert_eq!(resolve_backend_name(None), "null".to_string());
        assert_eq!(resolve_backend_name(Some("leanrag")), "leanrag".to_string());
    }
}
