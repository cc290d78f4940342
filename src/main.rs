//! # Secret Sync Controller
//!
//! Binary entry point. See the library crate for the controller itself.

use secret_sync_controller::runtime::{self, initialization::initialize};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let init = initialize().await?;
    runtime::run(init).await
}
