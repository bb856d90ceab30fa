use std::sync::Arc;

use arrow::array::{BooleanArray, StringArray};
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use arrow_schema::{DataType, Field, Schema};
use ktable_client::{Client, IntoQuery};
use ktable_common::ClientConfig;
use ktable_expr::parse_oqs_str;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty()
        || args
            .first()
            .map(|a| a == "--help" || a == "-h")
            .unwrap_or(false)
    {
        print_usage();
        return Ok(());
    }

    let opts = parse_opts(&args)?;
    let client = Client::http(opts.url.clone(), opts.token.clone(), ClientConfig::from_env())?;
    let table = client.table(&opts.table)?;
    if !table.exists() {
        return Err(format!("table {} does not exist", opts.table).into());
    }

    match opts.command {
        Command::Schema => {
            let rendered = pretty_format_batches(&[schema_batch(table.schema()?.as_ref())?])?;
            println!("{rendered}");
        }
        Command::Select => {
            let query = match &opts.query {
                Some(q) if q.trim_start().starts_with('{') => Some(parse_oqs_str(q)?),
                Some(q) => q.as_str().into_query()?,
                None => None,
            };
            let cols = opts.cols.iter().map(String::as_str).collect::<Vec<_>>();
            let batches = table.select(query, &cols)?.collect_batches()?;
            if batches.is_empty() {
                println!("OK: 0 rows");
            } else {
                let rendered = pretty_format_batches(&batches)?;
                println!("{rendered}");
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Select,
    Schema,
}

#[derive(Debug, Clone)]
struct Opts {
    command: Command,
    url: String,
    table: String,
    token: Option<String>,
    query: Option<String>,
    cols: Vec<String>,
}

fn parse_opts(args: &[String]) -> Result<Opts, Box<dyn std::error::Error>> {
    let command = match args.first().map(|a| a.as_str()) {
        Some("select") => Command::Select,
        Some("schema") => Command::Schema,
        Some(other) => return Err(format!("unknown command: {other}").into()),
        None => return Err("missing command".into()),
    };

    let mut url = std::env::var("KTABLE_URL").ok();
    let mut token = std::env::var("KTABLE_TOKEN").ok();
    let mut table = None;
    let mut query = None;
    let mut cols = Vec::new();

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--url" => {
                i += 1;
                url = Some(args.get(i).cloned().ok_or("missing value for --url")?);
            }
            "--table" => {
                i += 1;
                table = Some(args.get(i).cloned().ok_or("missing value for --table")?);
            }
            "--token" => {
                i += 1;
                token = Some(args.get(i).cloned().ok_or("missing value for --token")?);
            }
            "--query" if command == Command::Select => {
                i += 1;
                query = Some(args.get(i).cloned().ok_or("missing value for --query")?);
            }
            "--cols" if command == Command::Select => {
                i += 1;
                let raw = args.get(i).ok_or("missing value for --cols")?;
                cols = raw
                    .split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect();
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}").into()),
        }
        i += 1;
    }

    Ok(Opts {
        command,
        url: url.ok_or("missing --url (or KTABLE_URL)")?,
        table: table.ok_or("missing --table")?,
        token,
        query,
        cols,
    })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  ktable select --url URL --table ID [--query Q] [--cols a,b] [--token T]");
    eprintln!("  ktable schema --url URL --table ID [--token T]");
    eprintln!();
    eprintln!("Q is infix text (`n > 1 and loc intersects 'POLYGON(...)'`) or an OQS");
    eprintln!("JSON document (`{{\"#EQUALS\": [\"$n\", 1]}}`).");
    eprintln!("KTABLE_URL, KTABLE_TOKEN and KTABLE_* client settings are read from the environment.");
}

/// One row per column: name, type, nullability and field metadata.
fn schema_batch(schema: &Schema) -> Result<RecordBatch, Box<dyn std::error::Error>> {
    let fields = schema.fields();
    let out = Arc::new(Schema::new(vec![
        Field::new("column", DataType::Utf8, false),
        Field::new("type", DataType::Utf8, false),
        Field::new("nullable", DataType::Boolean, false),
        Field::new("metadata", DataType::Utf8, false),
    ]));
    let metadata = fields.iter().map(|f| {
        let mut pairs = f
            .metadata()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>();
        pairs.sort();
        pairs.join(",")
    });
    let batch = RecordBatch::try_new(
        out,
        vec![
            Arc::new(StringArray::from_iter_values(fields.iter().map(|f| f.name().clone()))),
            Arc::new(StringArray::from_iter_values(
                fields.iter().map(|f| f.data_type().to_string()),
            )),
            Arc::new(BooleanArray::from(
                fields.iter().map(|f| f.is_nullable()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from_iter_values(metadata)),
        ],
    )?;
    Ok(batch)
}
