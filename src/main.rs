use anyhow::Result;
use logchef::app;

#[tokio::main]
async fn main() -> Result<()> {
	app::start().await
}
