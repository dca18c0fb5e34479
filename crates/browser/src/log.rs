//! `cdp_json.log`: a line-oriented wire log, deliberately outside `tracing`
//! so it survives independent of whatever subscriber the embedding
//! application installs.
//!
//! Each line is `<RFC3339 UTC timestamp> -> <message>` for outgoing traffic
//! or `<timestamp> <- <message>` for incoming traffic.

use chrono::Utc;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

pub struct WireLog {
    file: Mutex<BufWriter<File>>,
}

impl WireLog {
    pub async fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub async fn outgoing(&self, text: &str) {
        self.write_line('>', text).await;
    }

    pub async fn incoming(&self, text: &str) {
        self.write_line('<', text).await;
    }

    async fn write_line(&self, direction: char, text: &str) {
        let marker = if direction == '>' { "->" } else { "<-" };
        let line = format!("{} {marker} {text}\n", Utc::now().to_rfc3339());
        let mut file = self.file.lock().await;
        if let Err(err) = file.write_all(line.as_bytes()).await {
            tracing::warn!(error = %err, "failed to write to wire log");
        }
    }

    pub async fn flush(&self) {
        let mut file = self.file.lock().await;
        let _ = file.flush().await;
    }
}
