//! Basic CDP example - launch a browser and ask it for its version.

use browser::session::{Session, SessionOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let session = Session::launch(SessionOptions::default()).await?;
    println!("launched, output dir: {}", session.output_dir().display());

    let version = session.send_and_wait("Browser.getVersion", None).await?;
    println!("browser version: {}", version);

    let mut lifecycle = session.subscribe("Page.lifecycleEvent");
    tokio::spawn(async move {
        while let Some(event) = lifecycle.recv().await {
            println!("lifecycle event: {:?}", event.params);
        }
    });

    session
        .send_and_wait(
            "Page.navigate",
            Some(serde_json::json!({ "url": "https://example.com" })),
        )
        .await?;

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    session.close().await?;
    println!("browser closed");

    Ok(())
}
