//! Opening the authorization URL for the user

use crate::error::Result;
use async_trait::async_trait;
use tracing::{info, warn};

/// Presents an authorization URL to the user
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn open(&self, url: &str) -> Result<()>;
}

/// Prints the URL to stderr and tries the system browser
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

#[async_trait]
impl BrowserLauncher for SystemBrowser {
    async fn open(&self, url: &str) -> Result<()> {
        eprintln!("\nOpening browser for authentication...\n{}", url);
        info!("Opening browser for OAuth authorization");

        let target = url.to_string();
        match tokio::task::spawn_blocking(move || webbrowser::open(&target)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to open browser ({}); visit the URL above manually", e),
            Err(e) => warn!("Browser launcher task failed ({}); visit the URL above manually", e),
        }
        Ok(())
    }
}
