//! Datasources command - list configured datasources

use anyhow::Result;
use dsq_core::DataSourceRegistry;

use crate::output::{DataSourceRow, OutputContext};

/// List all datasources known to the server
pub fn datasources(registry: &DataSourceRegistry, ctx: &OutputContext) -> Result<()> {
    let rows: Vec<DataSourceRow> = registry
        .list()
        .into_iter()
        .map(|ds| DataSourceRow {
            id: ds.id,
            uid: ds.uid,
            name: ds.name,
            type_name: ds.type_name,
            is_default: if ds.is_default { "yes" } else { "" }.to_string(),
        })
        .collect();

    ctx.print(&rows);
    Ok(())
}
