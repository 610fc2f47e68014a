use std::{io, sync::Arc};

use colored::Colorize;
use log::{error, info};
use thiserror::Error;
use tokio::runtime::{self, Runtime};
use together_collab::Collab;
use together_core::{Config, ConfigError};

use crate::logging::LogColor;

mod logging;

pub struct Together {
    collab: Arc<Collab>,
    runtime: Runtime,
}

#[derive(Debug, Error)]
enum TogetherError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Could not prepare the upload directory: {0}")]
    Storage(io::Error),

    #[error("Server stopped: {0}")]
    Server(io::Error),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Together {
    fn new() -> Result<Self, TogetherError> {
        let config = Config::from_env()?;

        info!("Building async runtime...");
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("together-async")
            .build()
            .map_err(|e| TogetherError::Fatal(e.to_string()))?;

        std::fs::create_dir_all(&config.upload_dir).map_err(TogetherError::Storage)?;
        info!("Storing clips in {}", config.upload_dir.display());

        Ok(Self {
            collab: Arc::new(Collab::new(config)),
            runtime,
        })
    }

    fn run(&self) -> Result<(), TogetherError> {
        self.runtime.block_on(async move {
            let _tasks = self.collab.start_background();

            together_server::run_server(self.collab.clone())
                .await
                .map_err(TogetherError::Server)
        })
    }
}

impl TogetherError {
    fn hint(&self) -> String {
        match self {
            TogetherError::Config(ConfigError::Invalid { key, .. }) => {
                format!("Check the value of {} in the environment.", key)
            }
            TogetherError::Storage(_) => "Make sure TOGETHER_UPLOAD_DIR points to a writable location.".to_string(),
            TogetherError::Server(_) => "Make sure TOGETHER_HOST and TOGETHER_PORT name an address that is free to bind.".to_string(),
            TogetherError::Fatal(_) => "This error is fatal, and should not happen.".to_string(),
        }
    }
}

fn report(error: TogetherError) {
    error!("{} Read the error below to troubleshoot the issue. If you think this might be a bug, please report it by making a GitHub issue.", "Together failed to start!".bold().color(LogColor::Red));
    error!("{}", error);
    error!(
        "{}",
        format!("Hint: {}", error.hint())
            .color(LogColor::Dimmed)
            .italic()
    );
}

fn main() {
    logging::init_logger();

    match Together::new() {
        Ok(together) => {
            info!("Initialized successfully.");

            if let Err(error) = together.run() {
                report(error);
            }
        }
        Err(error) => report(error),
    }
}
