#[tokio::main]
async fn main() -> anyhow::Result<()> {
    h2ogpte_gateway::run().await
}
