//! Meta-database commands. These open the sqlite file directly; the
//! provider and the tools share the schema.

use std::path::Path;

use anyhow::{Context, Result};

use strata_services::iov::db::MetaDb;

fn open(db: &str) -> Result<MetaDb> {
    MetaDb::open(Path::new(db)).with_context(|| format!("opening meta-database {db}"))
}

pub fn cmd_add(db: &str, key: &str, value: &str) -> Result<()> {
    open(db)?.set(key, value).context("writing entry")?;
    Ok(())
}

pub fn cmd_print(db: &str) -> Result<()> {
    for (key, value) in open(db)?.entries().context("enumerating entries")? {
        println!("{key} -> {value}");
    }
    Ok(())
}

pub fn cmd_remove(db: &str, key: &str) -> Result<()> {
    match open(db)?.remove(key).context("removing entry")? {
        Some(old) => {
            println!("{old}");
            Ok(())
        }
        None => anyhow::bail!("no entry for key {key:?}"),
    }
}
