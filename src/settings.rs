use std::{error::Error, io, net::SocketAddr};

use error_set::error_set;
use lexopt::prelude::*;
use serde::Deserialize;

use crate::route::cache::DEFAULT_BUCKET_COUNT;

error_set! {
    ConfigError = {
        ArgumentError(Box<dyn Error + Send + Sync + 'static>),

        #[display("Missing argument: {name}")]
        ArgumentMissing { name: &'static str },
        IoError(io::Error),
    };
}

impl From<lexopt::Error> for ConfigError {
    fn from(error: lexopt::Error) -> Self {
        Self::ArgumentError(Box::new(error))
    }
}

/// Connection parameters for the metadata service that answers routing
/// catalog queries.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub metadata: MetadataSettings,
    pub num_workers: usize,
    pub cache_buckets: usize,
    pub metrics_socket: Option<SocketAddr>,
    /// Schema version the resolved tables are pinned to.
    pub schema_version: i64,
    pub cluster_id: i64,
    /// Tables to resolve, as positional `db.table` arguments.
    pub tables: Vec<String>,
}

impl Settings {
    pub fn from_args() -> Result<Settings, ConfigError> {
        let mut metadata_host: Option<String> = None;
        let mut metadata_port: u16 = 5432;
        let mut metadata_user: Option<String> = None;
        let mut metadata_database: Option<String> = None;
        let mut num_workers: usize = 2;
        let mut cache_buckets: usize = DEFAULT_BUCKET_COUNT;
        let mut metrics_socket: Option<SocketAddr> = None;
        let mut schema_version: i64 = 0;
        let mut cluster_id: i64 = 0;
        let mut tables: Vec<String> = Vec::new();

        let mut parser = lexopt::Parser::from_env();
        while let Some(arg) = parser.next()? {
            match arg {
                Long("metadata_host") => metadata_host = Some(parser.value()?.string()?),
                Long("metadata_port") => metadata_port = parser.value()?.parse()?,
                Long("metadata_user") => metadata_user = Some(parser.value()?.string()?),
                Long("metadata_database") => metadata_database = Some(parser.value()?.string()?),
                Long("num_workers") => num_workers = parser.value()?.parse()?,
                Long("cache_buckets") => cache_buckets = parser.value()?.parse()?,
                Long("metrics_socket") => metrics_socket = Some(parser.value()?.parse()?),
                Long("schema_version") => schema_version = parser.value()?.parse()?,
                Long("cluster_id") => cluster_id = parser.value()?.parse()?,
                Value(table) => tables.push(table.string()?),
                Long("help") => {
                    println!(
                        "Usage: {} --metadata_host HOST --metadata_user USER --metadata_database DB \
                         [--metadata_port PORT] [--num_workers N] [--cache_buckets N] \
                         [--metrics_socket ADDR] [--schema_version V] [--cluster_id C] TABLE...",
                        parser.bin_name().unwrap_or_default()
                    );
                    std::process::exit(1);
                }
                _ => return Err(ConfigError::ArgumentError(Box::new(arg.unexpected()))),
            }
        }

        let settings = Settings {
            metadata: MetadataSettings {
                host: metadata_host.ok_or(ConfigError::ArgumentMissing {
                    name: "metadata_host",
                })?,
                port: metadata_port,
                user: metadata_user.ok_or(ConfigError::ArgumentMissing {
                    name: "metadata_user",
                })?,
                database: metadata_database.ok_or(ConfigError::ArgumentMissing {
                    name: "metadata_database",
                })?,
            },
            num_workers,
            cache_buckets,
            metrics_socket,
            schema_version,
            cluster_id,
            tables,
        };

        Ok(settings)
    }
}
