//! colbridge CLI: inspect the ownership protocol and exercise the bridge.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema};
use clap::{Parser, Subcommand};
use colbridge::{metrics, BridgeConfig, BridgeError, Expr, JoinType, Plan, ScanSource, SinkOptions};
use colbridge_core::ownership::{OwnershipEdge, ResourceKind, EDGE_TABLE};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "colbridge")]
#[command(about = "colbridge: ownership-safe bridge to a native columnar engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the per-call ownership edge table
    Edges {
        /// Only calls that take this resource kind (plan, frame, column, ...)
        #[arg(long)]
        kind: Option<String>,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration (defaults plus COLBRIDGE_* env vars)
    Config,

    /// Self-join a synthetic replayable scan and drain it through a pull sink
    Demo {
        /// Rows produced per scan pass
        #[arg(long, default_value = "10000")]
        rows: usize,

        /// Rows per produced batch
        #[arg(long, default_value = "1024")]
        batch_rows: usize,

        /// Number of distinct join keys
        #[arg(long, default_value = "100")]
        keys: usize,

        /// Sink queue capacity in batches (overrides config)
        #[arg(long)]
        buffer: Option<usize>,
    },
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Edges { kind, json } => print_edges(kind.as_deref(), json),
        Commands::Config => print_config(),
        Commands::Demo {
            rows,
            batch_rows,
            keys,
            buffer,
        } => run_demo(rows, batch_rows, keys, buffer),
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn parse_kind(s: &str) -> Result<ResourceKind, Box<dyn std::error::Error>> {
    ResourceKind::ALL
        .into_iter()
        .find(|k| k.name().eq_ignore_ascii_case(s) || format!("{k:?}").eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown resource kind '{s}'").into())
}

fn edge_label(edge: OwnershipEdge) -> &'static str {
    match edge {
        OwnershipEdge::Borrow => "borrow",
        OwnershipEdge::Clone => "clone",
        OwnershipEdge::Consume => "consume",
    }
}

fn print_edges(kind: Option<&str>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let kind = kind.map(parse_kind).transpose()?;
    let calls: Vec<_> = EDGE_TABLE
        .iter()
        .filter(|c| kind.map_or(true, |k| c.args.iter().any(|a| a.kind == k)))
        .collect();

    if json {
        let doc: Vec<_> = calls
            .iter()
            .map(|c| {
                serde_json::json!({
                    "call": c.call,
                    "args": c.args.iter().map(|a| serde_json::json!({
                        "arg": a.arg,
                        "kind": a.kind,
                        "edge": a.edge,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    for c in calls {
        let args: Vec<String> = c
            .args
            .iter()
            .map(|a| format!("{} ({}): {}", a.arg, a.kind, edge_label(a.edge)))
            .collect();
        println!("{:<28} {}", c.call, args.join(", "));
    }
    Ok(())
}

fn print_config() -> Result<(), Box<dyn std::error::Error>> {
    let config = BridgeConfig::from_env();
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn run_demo(
    rows: usize,
    batch_rows: usize,
    keys: usize,
    buffer: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (batch_rows, keys) = (batch_rows.max(1), keys.max(1));
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]));

    let batch_schema = schema.clone();
    let source = ScanSource::from_iter_factory(schema, move || {
        let schema = batch_schema.clone();
        (0..rows).step_by(batch_rows).map(move |start| -> colbridge::Result<RecordBatch> {
            let end = (start + batch_rows).min(rows);
            let k = Int64Array::from_iter_values((start..end).map(|i| (i % keys) as i64));
            let v = Int64Array::from_iter_values((start..end).map(|i| i as i64));
            Ok(RecordBatch::try_new(
                schema.clone(),
                vec![Arc::new(k), Arc::new(v)],
            )?)
        })
    });
    let stats = source.stats();

    let config = BridgeConfig::from_env();
    let left = Plan::scan_with(source, &config)?;
    let right = left.try_clone()?;
    let joined = left.join(
        right,
        vec![Expr::col("k")?],
        vec![Expr::col("k")?],
        JoinType::Inner,
    )?;
    println!("{}", joined.explain()?);

    let mut options = SinkOptions::from_config(&config);
    if let Some(n) = buffer {
        options = options.with_buffer_size(n);
    }
    let (batches, out_rows, high_water) = joined.sink_to(options, |cursor| {
        let (mut batches, mut out_rows) = (0usize, 0usize);
        while let Some(batch) = cursor.next() {
            out_rows += batch?.num_rows();
            batches += 1;
        }
        Ok::<_, BridgeError>((batches, out_rows, cursor.high_water_mark()))
    })?;

    let mut counts: HashMap<usize, usize> = HashMap::new();
    for i in 0..rows {
        *counts.entry(i % keys).or_default() += 1;
    }
    let expected: usize = counts.values().map(|c| c * c).sum();

    println!("✓ Demo finished");
    println!("  Output rows: {} (expected {})", out_rows, expected);
    println!("  Output batches: {}", batches);
    println!("  Scan passes: {}", stats.passes());
    println!("  Factory calls: {}", stats.factory_calls());
    println!("  Queue high water: {}", high_water);
    println!(
        "  Metrics: {}",
        serde_json::to_string(&metrics::global().snapshot())?
    );
    if out_rows != expected {
        return Err(format!("row count mismatch: {out_rows} != {expected}").into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind_accepts_names() {
        assert_eq!(parse_kind("plan").unwrap(), ResourceKind::Plan);
        assert_eq!(parse_kind("DataType").unwrap(), ResourceKind::DataType);
        assert!(parse_kind("widget").is_err());
    }

    #[test]
    fn test_demo_small() {
        run_demo(10, 3, 4, Some(2)).unwrap();
    }
}
