//! Returner that prints results as JSON lines

use crate::error::TransportError;
use crate::event::JobReturn;
use crate::sink::DeliverySink;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

/// Writes each return as one JSON line on stdout
#[derive(Debug, Default, Clone)]
pub struct StdoutSink {
    pretty: bool,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pretty() -> Self {
        Self { pretty: true }
    }

    fn render(&self, ret: &JobReturn) -> Result<String, TransportError> {
        let mut line = if self.pretty {
            serde_json::to_string_pretty(ret)?
        } else {
            serde_json::to_string(ret)?
        };
        line.push('\n');
        Ok(line)
    }
}

#[async_trait]
impl DeliverySink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn deliver(&self, ret: &JobReturn) -> Result<(), TransportError> {
        let line = self.render(ret)?;
        let mut stdout = tokio::io::stdout();
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}
