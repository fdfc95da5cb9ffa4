//! IOV provider commands: collection deletion and state inspection.

use anyhow::{Context, Result};

use strata_core::endpoint::Endpoint;
use strata_core::id::CollectionId;
use strata_rpc::policy::Exclusive;
use strata_rpc::Client;
use strata_services::iov::command::{CollectionDelete, IovCommands, QueryState};

async fn connect(provider: &str) -> Result<Client<IovCommands, Exclusive>> {
    let endpoint: Endpoint = provider
        .parse()
        .with_context(|| format!("bad provider endpoint {provider:?}"))?;
    Client::connect(endpoint)
        .await
        .with_context(|| format!("connecting to IOV provider at {endpoint}"))
}

pub async fn cmd_collection_delete(provider: &str, collection_id: &str) -> Result<()> {
    let client = connect(provider).await?;
    client
        .call(CollectionDelete {
            collection_id: CollectionId::new(collection_id),
        })
        .await
        .with_context(|| format!("deleting collection {collection_id}"))?;
    println!("deleted {collection_id}");
    Ok(())
}

pub async fn cmd_state(provider: &str) -> Result<()> {
    let client = connect(provider).await?;
    let state = client.call(QueryState).await.context("querying state")?;
    print!("{state}");
    Ok(())
}
