//! A small mutex-guarded string slot.
//!
//! Used by the Windows launch path: one task scrapes the websocket debugger
//! address out of the child's stderr while another polls this cell waiting
//! to dial it. Nothing fancier than a `Mutex<Option<String>>` is needed -
//! writes are rare (at most once) and reads just need to not starve behind
//! writers, which `tokio::sync::Mutex` already guarantees via FIFO wakeups.

use tokio::sync::Mutex;

#[derive(Default)]
pub struct SafeCell {
    inner: Mutex<Option<String>>,
}

impl SafeCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub async fn read(&self) -> Option<String> {
        self.inner.lock().await.clone()
    }

    pub async fn write(&self, value: String) {
        *self.inner.lock().await = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_empty() {
        let cell = SafeCell::new();
        assert_eq!(cell.read().await, None);
    }

    #[tokio::test]
    async fn write_then_read() {
        let cell = SafeCell::new();
        cell.write("ws://127.0.0.1:9222/devtools/browser/abc".to_string())
            .await;
        assert_eq!(
            cell.read().await.as_deref(),
            Some("ws://127.0.0.1:9222/devtools/browser/abc")
        );
    }

    #[tokio::test]
    async fn concurrent_reads_do_not_block_forever() {
        let cell = std::sync::Arc::new(SafeCell::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cell = cell.clone();
            handles.push(tokio::spawn(async move { cell.read().await }));
        }
        cell.write("ready".to_string()).await;
        for h in handles {
            let _ = h.await.unwrap();
        }
        assert_eq!(cell.read().await.as_deref(), Some("ready"));
    }
}
