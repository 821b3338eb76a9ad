use anyhow::Context;
use config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Merge config files in order, then overlay environment variables.
///
/// Missing files are skipped. Nested keys in the environment use `__`, so
/// `ARROWRT__BACKOFF__MAX_SLEEP_US=500` sets `backoff.max_sleep_us`.
pub fn load_cfg_merge<T, P>(
    paths: impl IntoIterator<Item = P>,
    env_prefix: Option<&str>,
) -> anyhow::Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let mut builder = Config::builder();

    for p in paths {
        let pb = p.as_ref().to_path_buf();
        if pb.exists() {
            builder = builder.add_source(File::from(pb));
        } else {
            tracing::debug!("[Config] file {} does not exist, skipping", pb.display());
        }
    }

    builder = match env_prefix {
        Some(prefix) => builder.add_source(
            Environment::with_prefix(prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        ),
        None => builder.add_source(Environment::default().separator("__").try_parsing(true)),
    };

    let cfg = builder
        .build()
        .with_context(|| "failed to build configuration from provided sources")?;

    let des: T = cfg
        .try_deserialize()
        .with_context(|| "failed to deserialize merged configuration")?;

    Ok(des)
}
