//! Query command - run queries against a datasource

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use dsq_client::DataSourceClient;
use dsq_core::{Query, QueryRequest, QueryResult};
use futures::StreamExt;
use serde_json::{json, Value};

use crate::output::{OutputContext, OutputFormat};
use crate::time::build_range;

/// Everything needed to build a request, re-evaluated on every refresh
#[derive(Debug, Clone)]
pub struct QueryArgs {
    pub queries: Vec<Query>,
    pub from: Option<String>,
    pub to: String,
    pub max_data_points: Option<u64>,
    pub interval_ms: Option<u64>,
    pub follow: bool,
    pub refresh: Option<Duration>,
}

/// Run the queries and print every result
///
/// Returns whether all results were free of errors. With `follow` the stream
/// is consumed until Ctrl+C; with `refresh` the request is re-sent under the
/// same request id each time the previous stream ends.
pub async fn query(
    client: &DataSourceClient,
    args: &QueryArgs,
    ctx: &OutputContext,
) -> Result<bool> {
    if !args.follow {
        let mut stream = client.query(build_request(args, None)?)?;
        let mut ok = true;
        while let Some(result) = stream.next().await {
            ok &= print_result(&result, ctx);
        }
        return Ok(ok);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    ctx.info("Press Ctrl+C to stop");

    let mut request_id: Option<String> = None;
    let mut ok = true;
    'follow: while running.load(Ordering::SeqCst) {
        let request = build_request(args, request_id.as_deref())?;
        request_id = Some(request.request_id.clone());
        let mut stream = client.query(request)?;

        loop {
            tokio::select! {
                item = stream.next() => {
                    match item {
                        Some(result) => ok &= print_result(&result, ctx),
                        None => break,
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    if !running.load(Ordering::SeqCst) {
                        break 'follow;
                    }
                }
            }
        }

        let Some(every) = args.refresh else {
            ctx.info("Stream ended");
            break;
        };
        let deadline = tokio::time::Instant::now() + every;
        while tokio::time::Instant::now() < deadline {
            if !running.load(Ordering::SeqCst) {
                break 'follow;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    ctx.info("\nStopped");
    Ok(ok)
}

fn build_request(args: &QueryArgs, request_id: Option<&str>) -> Result<QueryRequest> {
    let mut request = QueryRequest::new(args.queries.clone());
    if let Some(id) = request_id {
        request = request.with_request_id(id);
    }
    if let Some(from) = &args.from {
        request = request.with_range(build_range(from, &args.to, Utc::now())?);
    }
    if let Some(n) = args.max_data_points {
        request = request.with_max_data_points(n);
    }
    if let Some(ms) = args.interval_ms {
        request = request.with_interval_ms(ms);
    }
    Ok(request)
}

/// Print a result, returning whether it was free of errors
fn print_result(result: &QueryResult, ctx: &OutputContext) -> bool {
    if let Some(err) = result.error() {
        match &err.ref_id {
            Some(ref_id) => ctx.error(&format!("Query {} failed: {}", ref_id, err.message)),
            None => ctx.error(&format!("Query failed: {}", err.message)),
        }
    }

    if ctx.format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::to_string(result).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        if let Some(key) = &result.key {
            ctx.info(&format!("-- {} ({})", key, result.state()));
        }
        for frame in &result.data {
            ctx.print_frame(frame);
        }
    }

    !result.is_error()
}

/// Default refId for the query at `index`: A..Z, AA..ZZ, AAA, ...
pub fn ref_id_for(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        n -= 1;
        letters.push(char::from(b'A' + (n % 26) as u8));
        n /= 26;
    }
    letters.iter().rev().collect()
}

/// Build queries from `--query` JSON models and `--expr` shortcuts
///
/// Models without a `refId` get the next free default one.
pub fn parse_queries(models: &[String], exprs: &[String]) -> Result<Vec<Query>> {
    let mut values = Vec::with_capacity(models.len() + exprs.len());
    for model in models {
        let value: Value = serde_json::from_str(model)
            .with_context(|| format!("Query is not valid JSON: {}", model))?;
        if !value.is_object() {
            bail!("Query must be a JSON object: {}", model);
        }
        values.push(value);
    }
    values.extend(exprs.iter().map(|e| json!({ "expr": e })));

    let mut taken: Vec<String> = values
        .iter()
        .filter_map(|v| v.get("refId").and_then(Value::as_str).map(str::to_string))
        .collect();
    let mut next = 0;

    values
        .into_iter()
        .map(|mut value| {
            if value.get("refId").and_then(Value::as_str).is_none() {
                while taken.contains(&ref_id_for(next)) {
                    next += 1;
                }
                let ref_id = ref_id_for(next);
                taken.push(ref_id.clone());
                value["refId"] = json!(ref_id);
            }
            serde_json::from_value(value).context("Invalid query")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_ref_ids() {
        assert_eq!(ref_id_for(0), "A");
        assert_eq!(ref_id_for(25), "Z");
        assert_eq!(ref_id_for(26), "AA");
        assert_eq!(ref_id_for(27), "AB");
        assert_eq!(ref_id_for(701), "ZZ");
        assert_eq!(ref_id_for(702), "AAA");
    }

    #[test]
    fn many_unnamed_queries_get_unique_ref_ids() {
        let exprs: Vec<String> = (0..800).map(|i| format!("up{}", i)).collect();
        let queries = parse_queries(&[], &exprs).unwrap();

        let ids: std::collections::HashSet<_> = queries.iter().map(|q| q.ref_id.clone()).collect();
        assert_eq!(ids.len(), 800);
        assert_eq!(queries[702].ref_id, "AAA");
    }

    #[test]
    fn queries_from_models_and_exprs() {
        let queries = parse_queries(
            &[
                r#"{"refId": "A", "rawSql": "select 1"}"#.to_string(),
                r#"{"expr": "rate(x[5m])"}"#.to_string(),
            ],
            &["up".to_string()],
        )
        .unwrap();

        let ids: Vec<_> = queries.iter().map(|q| q.ref_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(queries[0].model["rawSql"], json!("select 1"));
        assert_eq!(queries[2].model["expr"], json!("up"));
    }

    #[test]
    fn explicit_datasource_is_kept() {
        let queries =
            parse_queries(&[r#"{"datasource": {"uid": "loki-1"}}"#.to_string()], &[]).unwrap();
        assert_eq!(queries[0].datasource.as_ref().unwrap().uid.as_deref(), Some("loki-1"));
    }

    #[test]
    fn invalid_models_are_rejected() {
        assert!(parse_queries(&["[1]".to_string()], &[]).is_err());
        assert!(parse_queries(&["{".to_string()], &[]).is_err());
    }

    #[test]
    fn request_carries_limits_and_range() {
        let args = QueryArgs {
            queries: vec![Query::new("A")],
            from: Some("now-15m".into()),
            to: "now".into(),
            max_data_points: Some(200),
            interval_ms: Some(1000),
            follow: false,
            refresh: None,
        };
        let request = build_request(&args, Some("Q1")).unwrap();
        assert_eq!(request.request_id, "Q1");
        assert_eq!(request.max_data_points, Some(200));
        assert_eq!(request.interval_ms, Some(1000));
        let range = request.range.unwrap();
        assert!(range.is_live());
        assert_eq!(range.span_ms(), 15 * 60 * 1000);
    }
}
