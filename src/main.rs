#![allow(missing_docs)]

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    incident_sync_lib::run().await
}
