use std::path::PathBuf;
use std::time::Duration;

use metrix_core::{EnvelopeConfig, Result, ServerConfig, StorageConfig};
use tokio_util::sync::CancellationToken;

pub struct ServerArgs {
    pub address: String,
    pub store_interval: u64,
    pub file_storage_path: String,
    pub restore: bool,
    pub database_dsn: Option<String>,
    pub key: Option<String>,
    pub crypto_key: Option<String>,
}

impl ServerArgs {
    fn into_config(self) -> ServerConfig {
        let path = (!self.file_storage_path.is_empty()).then(|| PathBuf::from(self.file_storage_path));
        ServerConfig {
            addr: self.address,
            storage: StorageConfig::select(self.database_dsn.as_deref(), path, self.restore),
            store_interval: Duration::from_secs(self.store_interval),
            envelope: EnvelopeConfig {
                sign_key: self.key,
                crypto_key: self.crypto_key,
            },
        }
    }
}

pub fn run(args: ServerArgs) -> Result<()> {
    let config = args.into_config();
    log::info!(target: "metrix", "metrix collector v{}", metrix_core::VERSION);

    let rt = super::runtime()?;
    rt.block_on(async move {
        let shutdown = CancellationToken::new();
        super::cancel_on_ctrl_c(shutdown.clone());
        metrix_server::run_server(config, shutdown).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> ServerArgs {
        ServerArgs {
            address: "localhost:8080".into(),
            store_interval: 300,
            file_storage_path: "./metrix.json".into(),
            restore: true,
            database_dsn: None,
            key: None,
            crypto_key: None,
        }
    }

    #[test]
    fn file_path_selects_memory_store() {
        let config = args().into_config();
        assert_eq!(
            config.storage,
            StorageConfig::Memory {
                path: Some(PathBuf::from("./metrix.json")),
                restore: true
            }
        );
        assert_eq!(config.store_interval, Duration::from_secs(300));
    }

    #[test]
    fn empty_path_disables_persistence() {
        let config = ServerArgs {
            file_storage_path: String::new(),
            ..args()
        }
        .into_config();
        assert!(matches!(config.storage, StorageConfig::Memory { path: None, .. }));
    }

    #[test]
    fn dsn_wins_over_file() {
        let config = ServerArgs {
            database_dsn: Some("metrix.db".into()),
            ..args()
        }
        .into_config();
        assert!(matches!(config.storage, StorageConfig::Database { .. }));
    }
}
