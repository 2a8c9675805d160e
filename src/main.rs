#[tokio::main]
async fn main() -> anyhow::Result<()> {
    realtime_voice::run().await
}
