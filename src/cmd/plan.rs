//! Plan preview: `docflow plan`.

use anyhow::{Context, Result};
use console::style;
use docflow::catalog::Catalog;
use docflow::config::DocflowConfig;
use docflow::dag::{DependencyGraph, DependencyResolver, ResolveOptions};
use std::path::Path;

/// Load a catalog and resolve `ids` (the whole catalog when empty).
pub fn resolve_catalog(
    config: &DocflowConfig,
    catalog_path: &Path,
    ids: &[String],
) -> Result<(Catalog, DependencyGraph)> {
    let catalog = Catalog::load(catalog_path)
        .with_context(|| format!("Failed to load catalog {}", catalog_path.display()))?;

    let resolver = DependencyResolver::new(&catalog).with_options(ResolveOptions {
        strict_dependencies: config.executor.strict_dependencies,
    });
    let graph = if ids.is_empty() {
        resolver.resolve_all()
    } else {
        resolver.resolve(ids)
    }
    .context("Failed to resolve dependencies")?;

    Ok((catalog, graph))
}

pub fn cmd_plan(config: &DocflowConfig, catalog_path: &Path, ids: &[String]) -> Result<()> {
    let (catalog, graph) = resolve_catalog(config, catalog_path, ids)?;

    println!();
    println!(
        "Plan: {} of {} item(s) from {}",
        style(graph.len()).bold(),
        catalog.len(),
        catalog_path.display()
    );
    println!();

    println!("Order:");
    for (position, id) in graph.order().iter().enumerate() {
        let deps = graph.dependency_ids(id);
        if deps.is_empty() {
            println!("  {:>3}. {}", position + 1, id);
        } else {
            println!(
                "  {:>3}. {} {}",
                position + 1,
                id,
                style(format!("<- {}", deps.join(", "))).dim()
            );
        }
    }
    println!();

    println!("Waves:");
    for (number, wave) in graph.compute_waves().iter().enumerate() {
        println!("  Wave {}: {}", number, wave.join(", "));
    }

    if !graph.skipped_dependencies().is_empty() {
        println!();
        println!("{}", style("Skipped dependencies (not in catalog):").yellow());
        for skipped in graph.skipped_dependencies() {
            println!("  {} -> {}", skipped.item, skipped.dependency);
        }
    }

    Ok(())
}
