use crate::config::Config;

pub fn print_banner(config: &Config) {
    let ascii_art = format!(
        r#"
                __                __
   ________  / /___ ___  ______/ /
  / ___/ _ \/ / __ `/ / / / __  /
 / /  /  __/ / /_/ / /_/ / /_/ /
/_/   \___/_/\__,_/\__, /\__,_/
                  /____/

relayd v{}
listening on {}:{}, watching {} environment(s)
"#,
        env!("CARGO_PKG_VERSION"),
        config.server.host,
        config.server.port,
        config.initial_environments().len(),
    );

    println!("{}", ascii_art);
}

/// Make sure the audit store's parent directory exists and is writable.
pub async fn check_storage(config: &Config) -> Result<(), String> {
    if !config.audit.enabled {
        return Ok(());
    }
    let Some(parent) = std::path::Path::new(&config.audit.path).parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    if !parent.exists() {
        tracing::info!("Creating storage directory: {}", parent.display());
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
    }
    if !parent.is_dir() {
        return Err(format!("Storage path is not a directory: {}", parent.display()));
    }

    let metadata = tokio::fs::metadata(parent)
        .await
        .map_err(|e| format!("cannot stat {}: {}", parent.display(), e))?;
    if metadata.permissions().readonly() {
        return Err(format!("Storage path is not writable: {}", parent.display()));
    }

    tracing::info!("Storage path ready: {}", parent.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_storage_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/audit.db");
        let mut config = Config::parse(r#"{"server": {"host": "0.0.0.0", "port": 8807}}"#).unwrap();
        config.audit.path = path.to_string_lossy().into_owned();

        check_storage(&config).await.unwrap();
        assert!(dir.path().join("nested").is_dir());
    }
}
