//! Session management example - a root session spawning two tabs.

use browser::session::{FlagValue, Session, SessionOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let options = SessionOptions {
        flags: vec![("headless".to_string(), FlagValue::Bool(true))],
        ..Default::default()
    };

    let root = Session::launch(options).await?;
    println!("root tab: {}", root.target_id());

    let tab1 = Session::new_child(&root).await?;
    println!("created tab 1: {}", tab1.target_id());
    tab1.send_and_wait(
        "Page.navigate",
        Some(serde_json::json!({ "url": "https://www.rust-lang.org" })),
    )
    .await?;

    let tab2 = Session::new_child(&root).await?;
    println!("created tab 2: {}", tab2.target_id());
    tab2.send_and_wait(
        "Page.navigate",
        Some(serde_json::json!({ "url": "https://github.com" })),
    )
    .await?;

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let result = tab1
        .send_and_wait(
            "Runtime.evaluate",
            Some(serde_json::json!({ "expression": "document.title", "returnByValue": true })),
        )
        .await?;
    println!("tab 1 title via JS: {}", result);

    tab1.close().await?;
    tab2.close().await?;
    root.close().await?;
    println!("session stopped");

    Ok(())
}
