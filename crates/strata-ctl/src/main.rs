//! strata-ctl — command-line utilities for strata providers.

use anyhow::Result;

mod cmd;

fn print_usage() {
    println!("Usage: strata-ctl <command>");
    println!();
    println!("IOV backend");
    println!("  collection-delete <provider> <collection-id>   Delete a collection");
    println!("  state <provider>                               Pretty-print provider state");
    println!();
    println!("Meta-database");
    println!("  db add <db> <key> <value>                      Write an entry");
    println!("  db print <db>                                  Enumerate all entries");
    println!("  db remove <db> <key>                           Delete and print the old value");
    println!();
    println!("Examples:");
    println!("  strata-ctl state 127.0.0.1:9430");
    println!("  strata-ctl collection-delete 127.0.0.1:9430 9f86d081-8847-...");
    println!("  strata-ctl db print /var/lib/strata/meta.sqlite");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();

    let outcome = match args_refs.as_slice() {
        ["collection-delete", provider, collection_id] => {
            cmd::iov::cmd_collection_delete(provider, collection_id).await
        }
        ["state", provider] => cmd::iov::cmd_state(provider).await,
        ["db", "add", db, key, value] => cmd::db::cmd_add(db, key, value),
        ["db", "print", db] => cmd::db::cmd_print(db),
        ["db", "remove", db, key] => cmd::db::cmd_remove(db, key),
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    // Thrown-error message to stderr, nonzero exit.
    if let Err(e) = outcome {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}
