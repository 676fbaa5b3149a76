use crate::{core::ConnectionProvider, providers::Providers};
use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, info};

const READY_POLL: Duration = Duration::from_secs(1);

/// Installs every connection provider and waits until all of them are ready.
pub async fn install_connection_providers(providers: &Providers, timeout: Duration) -> Result<()> {
    for name in providers.connections.names() {
        let provider = providers.connections.build(name, &())?;
        if !provider
            .installed()
            .await
            .with_context(|| format!("failed to check {name} installation"))?
        {
            info!(provider = %name, "Installing connection provider");
            provider
                .install()
                .await
                .with_context(|| format!("failed to install {name}"))?;
        }
        wait_ready(name, &*provider, timeout).await?;
    }
    info!("OperatorReady");
    Ok(())
}

async fn wait_ready(name: &str, provider: &dyn ConnectionProvider, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match provider.ready().await {
            Ok(true) => {
                info!(provider = %name, "Connection provider ready");
                return Ok(());
            }
            Ok(false) => debug!(provider = %name, "Waiting for connection provider"),
            Err(error) if error.is_transient() => {
                debug!(provider = %name, %error, "Waiting for connection provider")
            }
            Err(error) => return Err(error).context(format!("{name} failed")),
        }
        if Instant::now() + READY_POLL > deadline {
            bail!("{name} did not become ready within {}s", timeout.as_secs());
        }
        time::sleep(READY_POLL).await;
    }
}
