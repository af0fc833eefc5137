use mongo_datasource::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    mongo_datasource::run().await
}
