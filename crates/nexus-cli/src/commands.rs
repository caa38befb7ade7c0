//! Subcommands of the `nexus-blob` tool.
//!
//! Each command opens what it needs from the engine, does one thing and
//! returns an [`Output`] for `main` to print.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use serde::Serialize;

use nexus_blob::{BlobEngine, BlobHandle, Metadata};
use nexus_common::types::RefId;

use crate::formatter::Report;

/// Result of executing a command.
#[derive(Debug)]
pub enum Output {
    /// Tabular data, printed in the selected format.
    Report(Report),
    /// A single line for the user.
    Message(String),
    /// Nothing to print.
    Nothing,
}

/// Administrative commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List databases
    Databases,

    /// Delete a database and every BLOB in it
    DropDatabase {
        /// Database name
        db: String,
    },

    /// List tables of a database
    Tables {
        /// Database name
        db: String,
    },

    /// Create a table
    CreateTable {
        /// Database name
        db: String,
        /// Table name
        name: String,
    },

    /// Rename a table
    RenameTable {
        /// Database name
        db: String,
        /// Current name
        from: String,
        /// New name
        to: String,
    },

    /// Drop a table; its references are released after the grace period
    DropTable {
        /// Database name
        db: String,
        /// Table name
        name: String,
    },

    /// Store a file as a new BLOB and print its handle.
    ///
    /// Without --row the BLOB is unreferenced and is reclaimed once the
    /// grace period passes.
    Put {
        /// Database name
        db: String,
        /// Table the BLOB is created in (created if missing)
        table: String,
        /// File to store, or - for stdin
        file: PathBuf,
        /// Unique alias for the BLOB
        #[arg(long)]
        alias: Option<String>,
        /// Metadata entry, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
        /// Row id to reference the BLOB from
        #[arg(long)]
        row: Option<u64>,
        /// Column of the referencing row
        #[arg(long, default_value_t = 1)]
        column: u16,
    },

    /// Write a BLOB's payload to a file or stdout
    Get {
        /// Database name
        db: String,
        /// BLOB handle
        handle: BlobHandle,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Add a committed reference from a table row
    Ref {
        /// Database name
        db: String,
        /// BLOB handle
        handle: BlobHandle,
        /// Referencing table
        table: String,
        /// Referencing row id
        row: u64,
        /// Referencing column
        #[arg(long, default_value_t = 1)]
        column: u16,
    },

    /// Remove a reference
    Deref {
        /// Database name
        db: String,
        /// BLOB handle
        handle: BlobHandle,
        /// Referencing table
        table: String,
        /// Referencing row id
        row: u64,
    },

    /// Show a BLOB's header state
    Info {
        /// Database name
        db: String,
        /// BLOB handle
        handle: BlobHandle,
    },

    /// List a BLOB's references
    Refs {
        /// Database name
        db: String,
        /// BLOB handle
        handle: BlobHandle,
    },

    /// Show or edit a BLOB's metadata
    Meta {
        /// Database name
        db: String,
        /// BLOB handle
        handle: BlobHandle,
        /// Entry to set, repeatable
        #[arg(long, value_name = "KEY=VALUE", value_parser = parse_key_value)]
        set: Vec<(String, String)>,
        /// Entry to remove, repeatable
        #[arg(long, value_name = "KEY")]
        remove: Vec<String>,
    },

    /// Resolve an alias to a handle
    Alias {
        /// Database name
        db: String,
        /// Alias
        name: String,
    },

    /// Give a BLOB an alias, replacing any previous one
    SetAlias {
        /// Database name
        db: String,
        /// BLOB handle
        handle: BlobHandle,
        /// Alias
        name: String,
    },

    /// Recompute a BLOB's MD5 and compare it with the stored one
    Verify {
        /// Database name
        db: String,
        /// BLOB handle
        handle: BlobHandle,
    },

    /// Show database counters
    Stats {
        /// Database name
        db: String,
    },

    /// List repository files
    Repos {
        /// Database name
        db: String,
    },

    /// Run one compaction pass
    Compact {
        /// Database name
        db: String,
    },

    /// Apply deferred actions whose grace period has passed
    Flush {
        /// Database name
        db: String,
    },

    /// Back a database up into a directory and wait for it to finish
    Backup {
        /// Database name
        db: String,
        /// Destination directory
        destination: PathBuf,
    },

    /// List known backups
    Backups,

    /// Create a database from a backup
    Restore {
        /// Name of the new database
        db: String,
        /// Directory holding the dump
        source: PathBuf,
    },

    /// Print the effective engine configuration
    Config,
}

/// Parses `KEY=VALUE`.
fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

#[derive(Serialize)]
struct TableRow<'a> {
    id: u32,
    name: &'a str,
    dropped: bool,
    created: String,
}

#[derive(Serialize)]
struct MetaRow<'a> {
    key: &'a str,
    value: &'a str,
}

impl Command {
    /// Executes the command against `engine`.
    pub fn execute(self, engine: &BlobEngine) -> Result<Output> {
        match self {
            Command::Databases => Ok(Output::Report(Report::from_items(&engine.list_databases()?)?)),

            Command::DropDatabase { db } => {
                engine.drop_database(&db)?;
                Ok(Output::Message(format!("dropped database {db}")))
            }

            Command::Tables { db } => {
                let tables = engine.database(&db)?.tables();
                let rows: Vec<_> = tables
                    .iter()
                    .map(|t| TableRow {
                        id: t.id.as_u32(),
                        name: &t.name,
                        dropped: t.to_delete,
                        created: t.create_time.to_string(),
                    })
                    .collect();
                Ok(Output::Report(Report::from_items(&rows)?))
            }

            Command::CreateTable { db, name } => {
                let id = engine.database(&db)?.create_table(&name)?;
                Ok(Output::Message(format!("created table {name} ({id})")))
            }

            Command::RenameTable { db, from, to } => {
                engine.database(&db)?.rename_table(&from, &to)?;
                Ok(Output::Message(format!("renamed table {from} to {to}")))
            }

            Command::DropTable { db, name } => {
                engine.database(&db)?.drop_table(&name)?;
                Ok(Output::Message(format!("dropped table {name}")))
            }

            Command::Put {
                db,
                table,
                file,
                alias,
                meta,
                row,
                column,
            } => {
                let db = engine.database(&db)?;
                let table_id = db.table_or_create(&table)?;
                let mut metadata = Metadata::new();
                for (key, value) in meta {
                    metadata.set(key, value)?;
                }
                if let Some(alias) = alias {
                    metadata.set_alias(alias)?;
                }

                let handle = if file.as_os_str() == "-" {
                    let mut payload = Vec::new();
                    io::stdin().lock().read_to_end(&mut payload)?;
                    db.create_blob(table_id, &payload, metadata)?
                } else {
                    let mut input =
                        File::open(&file).with_context(|| format!("opening {}", file.display()))?;
                    let size = input.metadata()?.len();
                    db.create_blob_from_reader(table_id, &mut input, size, metadata)?
                };
                let handle = match row {
                    Some(row) => db.reference_blob(&handle, table_id, column, RefId::new(row))?,
                    None => handle,
                };
                Ok(Output::Message(handle.to_string()))
            }

            Command::Get { db, handle, out } => {
                let db = engine.database(&db)?;
                let mut reader = db.open_blob(&handle)?;
                match out {
                    Some(path) => {
                        let mut file = BufWriter::new(
                            File::create(&path).with_context(|| format!("creating {}", path.display()))?,
                        );
                        let written = io::copy(&mut reader, &mut file)?;
                        file.flush()?;
                        Ok(Output::Message(format!("wrote {written} bytes to {}", path.display())))
                    }
                    None => {
                        let mut stdout = io::stdout().lock();
                        io::copy(&mut reader, &mut stdout)?;
                        stdout.flush()?;
                        Ok(Output::Nothing)
                    }
                }
            }

            Command::Ref {
                db,
                handle,
                table,
                row,
                column,
            } => {
                let db = engine.database(&db)?;
                let table_id = db.table_id(&table)?;
                let handle = db.reference_blob(&handle, table_id, column, RefId::new(row))?;
                Ok(Output::Message(handle.to_string()))
            }

            Command::Deref { db, handle, table, row } => {
                let db = engine.database(&db)?;
                let table_id = db.table_id(&table)?;
                db.dereference_blob(&handle, table_id, RefId::new(row))?;
                Ok(Output::Message(format!("removed reference {row} from {table}")))
            }

            Command::Info { db, handle } => {
                let info = engine.database(&db)?.blob_info(&handle)?;
                Ok(Output::Report(Report::from_fields(&info)?))
            }

            Command::Refs { db, handle } => {
                let refs = engine.database(&db)?.references(&handle)?;
                Ok(Output::Report(Report::from_items(&refs)?))
            }

            Command::Meta {
                db,
                handle,
                set,
                remove,
            } => {
                let db = engine.database(&db)?;
                for (key, value) in &set {
                    db.set_metadata(&handle, key, value)?;
                }
                for key in &remove {
                    if db.remove_metadata(&handle, key)?.is_none() {
                        tracing::warn!(key = %key, "no such metadata entry");
                    }
                }
                let metadata = db.metadata(&handle)?;
                let rows: Vec<_> = metadata.iter().map(|(key, value)| MetaRow { key, value }).collect();
                Ok(Output::Report(Report::from_items(&rows)?))
            }

            Command::Alias { db, name } => {
                let handle = engine.database(&db)?.lookup_alias(&name)?;
                Ok(Output::Message(handle.to_string()))
            }

            Command::SetAlias { db, handle, name } => {
                engine.database(&db)?.set_alias(&handle, &name)?;
                Ok(Output::Message(format!("{name} -> {handle}")))
            }

            Command::Verify { db, handle } => {
                if engine.database(&db)?.verify_checksum(&handle)? {
                    Ok(Output::Message("checksum ok".into()))
                } else {
                    bail!("checksum mismatch for {handle}")
                }
            }

            Command::Stats { db } => {
                let stats = engine.database(&db)?.stats();
                Ok(Output::Report(Report::from_fields(&stats)?))
            }

            Command::Repos { db } => {
                let repos = engine.database(&db)?.repositories();
                Ok(Output::Report(Report::from_items(&repos)?))
            }

            Command::Compact { db } => {
                let report = engine.database(&db)?.compact_now()?;
                Ok(Output::Report(Report::from_fields(&report)?))
            }

            Command::Flush { db } => {
                let db = engine.database(&db)?;
                let before = db.stats().actions_applied;
                db.flush_deferred()?;
                let applied = db.stats().actions_applied - before;
                Ok(Output::Message(format!("applied {applied} deferred actions")))
            }

            Command::Backup { db, destination } => {
                let id = engine.start_backup(&db, &destination)?;
                tracing::info!(backup = %id, "waiting for backup");
                let Some(descriptor) = engine.wait_for_backup(&db)? else {
                    bail!("backup {id} disappeared");
                };
                if let Some(error) = &descriptor.error {
                    bail!("backup {id} failed: {error}");
                }
                Ok(Output::Report(Report::from_fields(&descriptor)?))
            }

            Command::Backups => Ok(Output::Report(Report::from_items(&engine.backups())?)),

            Command::Restore { db, source } => {
                let summary = engine.restore(&db, &source)?;
                Ok(Output::Report(Report::from_fields(&summary)?))
            }

            Command::Config => Ok(Output::Message(engine.config().to_toml()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use nexus_common::config::EngineConfig;
    use tempfile::TempDir;

    #[derive(Parser)]
    struct Cli {
        #[command(subcommand)]
        command: Command,
    }

    fn parse(args: &[&str]) -> Command {
        Cli::try_parse_from(std::iter::once("nexus-blob").chain(args.iter().copied()))
            .unwrap()
            .command
    }

    fn message(output: Output) -> String {
        match output {
            Output::Message(m) => m,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
    }

    #[test]
    fn test_bad_handle_rejected_by_parser() {
        let cli = Cli::try_parse_from(["nexus-blob", "info", "db", "not-a-handle"]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_put_ref_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let engine = BlobEngine::init(EngineConfig::for_testing(dir.path().join("data"))).unwrap();
        let input = dir.path().join("in.bin");
        std::fs::write(&input, b"hello blob").unwrap();

        let handle = message(
            parse(&[
                "put",
                "media",
                "photos",
                input.to_str().unwrap(),
                "--alias",
                "greeting",
                "--meta",
                "type=text",
                "--row",
                "7",
            ])
            .execute(&engine)
            .unwrap(),
        );

        let out = dir.path().join("out.bin");
        parse(&["get", "media", &handle, "--out", out.to_str().unwrap()])
            .execute(&engine)
            .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"hello blob");

        assert_eq!(
            message(parse(&["alias", "media", "greeting"]).execute(&engine).unwrap()),
            handle
        );
        assert_eq!(
            message(parse(&["verify", "media", &handle]).execute(&engine).unwrap()),
            "checksum ok"
        );

        match parse(&["refs", "media", &handle]).execute(&engine).unwrap() {
            Output::Report(report) => assert_eq!(report.rows.len(), 1),
            other => panic!("unexpected output {other:?}"),
        }
        match parse(&["meta", "media", &handle, "--set", "lang=en"])
            .execute(&engine)
            .unwrap()
        {
            Output::Report(report) => assert_eq!(report.rows.len(), 2),
            other => panic!("unexpected output {other:?}"),
        }

        parse(&["deref", "media", &handle, "photos", "7"])
            .execute(&engine)
            .unwrap();
        assert!(parse(&["deref", "media", &handle, "photos", "7"])
            .execute(&engine)
            .is_err());
    }

    #[test]
    fn test_table_commands() {
        let dir = TempDir::new().unwrap();
        let engine = BlobEngine::init(EngineConfig::for_testing(dir.path().join("data"))).unwrap();

        parse(&["create-table", "db", "a"]).execute(&engine).unwrap();
        parse(&["rename-table", "db", "a", "b"]).execute(&engine).unwrap();
        match parse(&["tables", "db"]).execute(&engine).unwrap() {
            Output::Report(report) => {
                assert_eq!(report.rows.len(), 1);
                assert_eq!(report.rows[0][1], "b");
            }
            other => panic!("unexpected output {other:?}"),
        }
        match parse(&["databases"]).execute(&engine).unwrap() {
            Output::Report(report) => assert_eq!(report.rows, vec![vec![serde_json::json!("db")]]),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_backup_and_restore_commands() {
        let dir = TempDir::new().unwrap();
        let engine = BlobEngine::init(EngineConfig::for_testing(dir.path().join("data"))).unwrap();
        let input = dir.path().join("in.bin");
        std::fs::write(&input, vec![7u8; 4096]).unwrap();
        let handle = message(
            parse(&["put", "src", "t", input.to_str().unwrap(), "--row", "1"])
                .execute(&engine)
                .unwrap(),
        );

        let dest = dir.path().join("backup");
        parse(&["backup", "src", dest.to_str().unwrap()])
            .execute(&engine)
            .unwrap();
        parse(&["restore", "dst", dest.to_str().unwrap()])
            .execute(&engine)
            .unwrap();

        let original: BlobHandle = handle.parse().unwrap();
        let copy = engine.database("dst").unwrap();
        let restored = BlobHandle {
            db_id: copy.id(),
            ..original
        };
        assert_eq!(copy.read_blob(&restored, ..).unwrap().len(), 4096);
        assert_eq!(engine.backups().len(), 1);
    }
}
