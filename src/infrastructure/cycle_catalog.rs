// Test cycle catalog loading
use crate::domain::cycle::CycleCatalog;
use anyhow::Context;
use std::path::Path;

pub fn read_catalog(path: &Path) -> anyhow::Result<CycleCatalog> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading test cycles from '{}'", path.display()))?;
    let catalog: CycleCatalog = serde_json::from_str(&text)
        .with_context(|| format!("parsing test cycles in '{}'", path.display()))?;
    Ok(catalog)
}

/// Load the catalog, or an empty one if it cannot be read.
pub fn load_catalog(path: &Path) -> CycleCatalog {
    match read_catalog(path) {
        Ok(catalog) => {
            tracing::info!(
                cycles = catalog.test_cycles.len(),
                "Loaded test cycles from '{}'",
                path.display()
            );
            catalog
        }
        Err(e) => {
            tracing::warn!("Error loading test cycles: {:#}", e);
            CycleCatalog::default()
        }
    }
}
