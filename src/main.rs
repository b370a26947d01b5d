#[tokio::main]
async fn main() -> anyhow::Result<()> {
    livechat_console::app::run().await
}
