//! Resource command - call a datasource resource handler

use anyhow::{bail, Context, Result};
use dsq_client::DataSourceClient;
use serde_json::Value;

use crate::output::OutputContext;

/// GET (or POST, when `body` is given) a datasource resource and print the reply
pub async fn resource(
    client: &DataSourceClient,
    path: &str,
    body: Option<&str>,
    ctx: &OutputContext,
) -> Result<()> {
    let response = match body {
        Some(body) => {
            let body: Value = serde_json::from_str(body).context("Request body is not valid JSON")?;
            client.post_resource(path, body).await?
        }
        None => client.get_resource(path).await?,
    };

    let text = match response.json() {
        Ok(json) => serde_json::to_string_pretty(&json)?,
        Err(_) => String::from_utf8_lossy(&response.body).into_owned(),
    };

    if !response.is_success() {
        ctx.error(&text);
        bail!("Resource call failed with status {}", response.status);
    }
    println!("{}", text);
    Ok(())
}
