use std::error::Error;

use tracing::{error, info};

mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = tablesync_core::run().await {
        error!("{e}");
        return Err(e.into());
    }
    info!("Exiting...");

    Ok(())
}
