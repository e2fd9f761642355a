use std::path::{Path, PathBuf};
use std::{collections::HashMap, env, fs::File, io::Read};

use anyhow::Result;
use serde::Deserialize;

#[derive(Deserialize, Clone, Default)]
pub struct Config {
    pub database: Option<DatabaseConfig>,
    pub cache: Option<CacheConfig>,
}

#[derive(Deserialize, Clone)]
pub struct DatabaseConfig {
    pub pgconn: String,
}

#[derive(Deserialize, Clone)]
pub struct CacheConfig {
    pub path: String,
}

pub fn parse_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let mut f = File::open(path)?;
    let mut content = String::new();
    content.reserve(1024);
    f.read_to_string(&mut content)?;

    Ok(toml::from_str(&content)?)
}

/// Database connection string: config file, then `SYMBOLDB_PGCONN`,
/// then the ambient `PG*` environment via a bare URL.
pub fn database_conninfo(config: &Config) -> String {
    if let Some(database) = &config.database {
        return database.pgconn.clone();
    }
    env::var("SYMBOLDB_PGCONN").unwrap_or_else(|_| "postgres://".to_string())
}

/// Package cache location: command line, then config file, then
/// `$HOME/.cache/symboldb/rpms/`.
pub fn cache_dir(config: &Config, override_path: Option<&str>) -> PathBuf {
    if let Some(path) = override_path {
        return PathBuf::from(path);
    }
    if let Some(cache) = &config.cache {
        return PathBuf::from(&cache.path);
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".cache/symboldb/rpms")
}

/// Environment snapshot for diagnostics.
pub fn connection_environment() -> HashMap<String, String> {
    env::vars()
        .filter(|(key, _)| key.starts_with("PG") || key == "SYMBOLDB_PGCONN")
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_dir_precedence() {
        let mut config = Config::default();
        assert!(cache_dir(&config, None).ends_with(".cache/symboldb/rpms"));
        config.cache = Some(CacheConfig {
            path: "/var/cache/rpms".into(),
        });
        assert_eq!(cache_dir(&config, None), PathBuf::from("/var/cache/rpms"));
        assert_eq!(
            cache_dir(&config, Some("/tmp/override")),
            PathBuf::from("/tmp/override")
        );
    }

    #[test]
    fn test_parse_config_toml() {
        let parsed: Config = toml::from_str(
            r#"
[database]
pgconn = "postgres://localhost/symboldb"

[cache]
path = "/srv/cache"
"#,
        )
        .unwrap();
        assert_eq!(
            database_conninfo(&parsed),
            "postgres://localhost/symboldb"
        );
        assert_eq!(parsed.cache.unwrap().path, "/srv/cache");
    }
}
