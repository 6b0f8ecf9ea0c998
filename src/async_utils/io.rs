//! I/O utilities.
//!
//! Right now this is just JSON report output. Reports go to a file if one is
//! named, or to standard output.

use serde::Serialize;
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// Create an [`AsyncWrite`] for a file or stdout.
async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write a value as pretty-printed JSON to either standard output or a file.
pub async fn write_json<T>(path: Option<&Path>, value: &T) -> Result<()>
where
    T: Serialize,
{
    let json =
        serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    let mut writer = BufWriter::new(create_writer(path).await?);
    writer
        .write_all(json.as_bytes())
        .await
        .context("Failed to write JSON to output")?;
    writer
        .write_all(b"\n")
        .await
        .context("Failed to write newline to output")?;
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}
