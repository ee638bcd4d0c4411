#[tokio::main]
async fn main() -> anyhow::Result<()> {
    repertoire_backend::run().await
}
