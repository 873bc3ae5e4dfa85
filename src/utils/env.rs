// src/utils/env.rs

use log::{debug, info, warn};

/// Loads `.env` from the working directory, falling back to `../.env`.
/// Variables already present in the environment win.
pub fn load_env() {
    match dotenv::dotenv() {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(e) => {
            debug!("No .env in working directory: {}", e);
            match dotenv::from_filename("../.env") {
                Ok(path) => info!("Loaded environment from {}", path.display()),
                Err(_) => warn!("No .env file found; using system environment variables"),
            }
        }
    }
}
