pub mod name;
pub mod options;
pub mod servers;
pub mod template;

use anyhow::Context;
use berth::engine::ContainerInfo;
use std::path::Path;

/// Read `docker inspect` output from a file, or stdin for `-`.
///
/// Accepts a single object or the array `docker inspect` prints; an array
/// must hold exactly one container.
pub async fn read_container(path: &Path) -> anyhow::Result<ContainerInfo> {
    let content = if path == Path::new("-") {
        tokio::task::spawn_blocking(|| std::io::read_to_string(std::io::stdin()))
            .await?
            .context("reading container JSON from stdin")?
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?
    };

    let value: serde_json::Value =
        serde_json::from_str(&content).context("container JSON is not valid JSON")?;
    let value = match value {
        serde_json::Value::Array(mut items) => {
            if items.len() != 1 {
                anyhow::bail!("expected exactly one container, got {}", items.len());
            }
            items.remove(0)
        }
        other => other,
    };
    let info: ContainerInfo =
        serde_json::from_value(value).context("container JSON is not an inspect document")?;
    tracing::debug!(container_id = %info.id, "Read container");
    Ok(info)
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
