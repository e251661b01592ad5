use clap::{Parser, Subcommand, ValueEnum};
use mushafdb::{Record, SortDirection, Store, StoreConfig};
use serde_json::Value;
use std::path::PathBuf;
use std::process;

/// MushafDB CLI: read and edit the collections of a GitHub-backed store
#[derive(Parser)]
#[command(name = "mushafdb", version, about)]
struct Cli {
    /// YAML configuration file (default: GITHUB_* / MUSHAFDB_* environment variables)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Branch to read and write, overriding the configuration
    #[arg(long)]
    branch: Option<String>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Get a single record by id or uid
    Get {
        /// Collection name
        collection: String,
        /// Record id or uid
        key: String,
    },

    /// List records in a collection
    List {
        /// Collection name
        collection: String,
        /// Equality filters (e.g. --filter surahId=2)
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
        /// Sort by this field
        #[arg(long)]
        sort: Option<String>,
        /// Sort descending
        #[arg(long)]
        desc: bool,
        /// Keep only these fields
        #[arg(long = "field")]
        fields: Vec<String>,
        /// Return at most this many records
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Insert a new record
    Insert {
        /// Collection name
        collection: String,
        /// Field values (e.g. --field arabicText="بِسْمِ")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Update an existing record
    Update {
        /// Collection name
        collection: String,
        /// Record id or uid
        key: String,
        /// Field values to change (e.g. --field audioUrl=https://...)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete a record
    Delete {
        /// Collection name
        collection: String,
        /// Record id or uid
        key: String,
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Print a collection as a JSON array
    Export {
        /// Collection name
        collection: String,
    },

    /// Load records from a JSON array file
    Import {
        /// Collection name
        collection: String,
        /// JSON file holding an array of records
        file: PathBuf,
        /// Replace the collection instead of appending
        #[arg(long)]
        overwrite: bool,
    },

    /// Create missing collections and apply pending migrations
    Evolve,

    /// Undo migrations of a collection down to a version
    Revert {
        /// Collection name
        collection: String,
        /// Version to return to
        target_version: u32,
    },

    /// Show connection and queue status
    Status,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> mushafdb::Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::from_env()?,
    };
    if let Some(branch) = &cli.branch {
        config.branch = branch.clone();
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::connect(load_config(&cli)?);
    log::debug!("Using {}/{}@{}", store.config().owner, store.config().repo, store.config().branch);

    let output = match cli.command {
        Command::Get { collection, key } => Value::Object(store.get_item(&collection, &key).await?),

        Command::List {
            collection,
            filters,
            sort,
            desc,
            fields,
            limit,
        } => {
            let mut query = store.query(&collection);
            for (field, value) in filters {
                query = query.where_eq(&field, parse_field_value(&value));
            }
            if let Some(field) = sort {
                let direction = if desc { SortDirection::Desc } else { SortDirection::Asc };
                query = query.sort(&field, direction);
            }
            if !fields.is_empty() {
                let names: Vec<&str> = fields.iter().map(String::as_str).collect();
                query = query.project(&names);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            records_to_value(query.exec().await?)
        }

        Command::Insert { collection, fields } => {
            Value::Object(store.insert(&collection, fields_to_record(&fields)).await?)
        }

        Command::Update {
            collection,
            key,
            fields,
        } => Value::Object(store.update(&collection, &key, fields_to_record(&fields)).await?),

        Command::Delete {
            collection,
            key,
            dry_run,
        } => {
            if dry_run {
                let record = store.get_item(&collection, &key).await?;
                serde_json::json!({
                    "dry_run": true,
                    "would_delete": { "collection": collection, "key": key },
                    "record": record,
                })
            } else {
                let removed = store.delete(&collection, &key).await?;
                serde_json::json!({ "ok": true, "deleted": removed.len() })
            }
        }

        Command::Export { collection } => {
            println!("{}", store.export_collection(&collection).await?);
            return Ok(());
        }

        Command::Import {
            collection,
            file,
            overwrite,
        } => {
            let json = std::fs::read_to_string(&file)
                .map_err(|e| format!("Failed to read import file '{}': {e}", file.display()))?;
            let imported = store.import_collection(&collection, &json, overwrite).await?;
            serde_json::json!({ "ok": true, "imported": imported.len() })
        }

        Command::Evolve => {
            store.run_evolution().await?;
            serde_json::to_value(store.status())?
        }

        Command::Revert {
            collection,
            target_version,
        } => {
            let records = store.revert_migrations(&collection, target_version).await?;
            serde_json::json!({ "ok": true, "collection": collection, "records": records.len() })
        }

        Command::Status => {
            let mut status = serde_json::to_value(store.status())?;
            status["version"] = Value::String(store.version().to_string());
            status
        }
    };

    print_output(&output, &cli.format)
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn records_to_value(records: Vec<Record>) -> Value {
    Value::Array(records.into_iter().map(Value::Object).collect())
}

/// JSON literals (numbers, booleans, arrays, objects) are parsed; anything else is a string.
fn parse_field_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn fields_to_record(fields: &[(String, String)]) -> Record {
    fields
        .iter()
        .map(|(key, raw)| (key.clone(), parse_field_value(raw)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("audioUrl=https://cdn/a.mp3?x=1").unwrap(),
            ("audioUrl".to_string(), "https://cdn/a.mp3?x=1".to_string())
        );
        assert!(parse_key_value("no-separator").is_err());
    }

    #[test]
    fn test_fields_to_record_parses_json_literals() {
        let record = fields_to_record(&[
            ("ayahNumber".into(), "255".into()),
            ("verified".into(), "true".into()),
            ("surahId".into(), "\"2\"".into()),
            ("arabicText".into(), "ٱللَّهُ".into()),
        ]);
        assert_eq!(record["ayahNumber"], json!(255));
        assert_eq!(record["verified"], json!(true));
        assert_eq!(record["surahId"], json!("2"));
        assert_eq!(record["arabicText"], json!("ٱللَّهُ"));
    }

    #[test]
    fn test_cli_parses_list_options() {
        let cli = Cli::try_parse_from([
            "mushafdb",
            "--format",
            "json",
            "list",
            "ayahs",
            "--filter",
            "surahId=\"1\"",
            "--sort",
            "ayahNumber",
            "--desc",
            "--limit",
            "3",
        ])
        .unwrap();
        match cli.command {
            Command::List { collection, filters, desc, limit, .. } => {
                assert_eq!(collection, "ayahs");
                assert_eq!(filters, vec![("surahId".to_string(), "\"1\"".to_string())]);
                assert!(desc);
                assert_eq!(limit, Some(3));
            }
            _ => panic!("expected list"),
        }
    }
}
