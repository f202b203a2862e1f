//! Health command - run a datasource health check

use anyhow::Result;
use dsq_client::DataSourceClient;

use crate::output::{OutputContext, OutputFormat};

/// Check a datasource's health
///
/// A failing check is reported, not returned as an error.
pub async fn health(client: &DataSourceClient, ctx: &OutputContext) -> Result<bool> {
    let ds = client.instance();
    match client.test_datasource().await {
        Ok(status) => {
            if ctx.format == OutputFormat::Table {
                ctx.success(&format!("{} ({}): {}", ds.name, ds.uid, status.message));
            } else {
                ctx.print_kv(&[
                    ("uid", ds.uid.clone()),
                    ("status", "OK".to_string()),
                    ("message", status.message),
                ]);
            }
            Ok(true)
        }
        Err(err) => {
            let details = err
                .details
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_default();
            if ctx.format == OutputFormat::Table {
                ctx.error(&format!("{} ({}): {}", ds.name, ds.uid, err.message));
                if !details.is_empty() {
                    ctx.info(&format!("  details: {}", details));
                }
            } else {
                ctx.print_kv(&[
                    ("uid", ds.uid.clone()),
                    ("status", "ERROR".to_string()),
                    ("message", err.message),
                    ("details", details),
                ]);
            }
            Ok(false)
        }
    }
}
