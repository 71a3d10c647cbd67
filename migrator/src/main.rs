#[tokio::main]
async fn main() -> anyhow::Result<()> {
    migrator::run_cli().await
}
