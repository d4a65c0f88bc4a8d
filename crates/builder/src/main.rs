//! image-builder entry point

use std::path::Path;

use builder::{run_build, BuilderEnv, BuilderError, ProcessRunner};
use crds::contract::{PULL_SECRET_FILE, PULL_SECRET_MOUNT_PATH};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), BuilderError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting image-builder");

    let env = BuilderEnv::from_env()?;

    let credential = Path::new(PULL_SECRET_MOUNT_PATH).join(PULL_SECRET_FILE);
    let auth_file = credential
        .exists()
        .then(|| credential.to_string_lossy().into_owned());

    match run_build(&ProcessRunner, &env, auth_file.as_deref()).await {
        Ok(artifacts) => {
            info!(
                archive = %artifacts.archive,
                disk_image = ?artifacts.disk_image,
                "Build completed"
            );
            Ok(())
        }
        Err(e) => {
            error!("Build failed: {}", e);
            Err(e)
        }
    }
}
