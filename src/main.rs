use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    projects_metadata_lib::run()
        .await
        .context("projects-metadata-api failed")
}
