//! Writing the configuration document into a running carrier2 and reading
//! it back.

use crate::config::{Config, CONFIG_FILE, ERROR_LOG, PID_FILE};
use gefyra_operator_core::{Error, Result};
use gefyra_operator_k8s_api::{pod, Api, Pod};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMIT_ATTEMPTS: usize = 10;
const COMMIT_TIMEOUT: Duration = Duration::from_secs(30);
const COMMIT_BACKOFF: Duration = Duration::from_secs(1);

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const READY_BACKOFF: Duration = Duration::from_millis(200);

const STARTED: &str = "Daemonizing the server";
const PANICKED: &str = "thread 'main' panicked";

/// The shell script that writes `yaml` and (re)starts the proxy.
///
/// A running proxy is upgraded in place; without one the proxy is started
/// cold.
pub fn script(yaml: &str, debug: bool) -> String {
    let level = if debug { "debug" } else { "info" };
    format!(
        "cat <<'EOF' > {CONFIG_FILE}\n{yaml}EOF\n\
         RUST_LOG={level}; kill -SIGQUIT $(cat {PID_FILE}); \
         if [ $? -eq 0 ]; then RUST_LOG={level} carrier2 -c {CONFIG_FILE} -u -d &> {ERROR_LOG}; \
         else RUST_LOG={level} carrier2 -c {CONFIG_FILE} -d &> {ERROR_LOG}; fi\n\
         cat {ERROR_LOG}"
    )
}

/// Whether the proxy's output shows that it came up.
pub fn committed(output: &str) -> bool {
    output.contains(STARTED) && !output.contains(PANICKED)
}

/// Writes `config` into the proxy of `container` and reloads it.
pub async fn commit(
    api: &Api<Pod>,
    pod: &str,
    container: &str,
    config: &Config,
    debug: bool,
) -> Result<()> {
    wait_ready(api, pod).await?;

    let mut yaml = config.to_yaml()?;
    if !yaml.ends_with('\n') {
        yaml.push('\n');
    }
    let script = script(&yaml, debug);
    let deadline = Instant::now() + COMMIT_TIMEOUT;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let out = pod::exec(api, pod, Some(container), ["busybox", "sh", "-c", script.as_str()])
            .await?;
        let output = out.merged();
        if committed(&output) {
            info!(%pod, %container, attempt, "Committed carrier2 config");
            return Ok(());
        }
        debug!(%pod, %container, attempt, %output, "Carrier2 did not come up");
        if attempt >= COMMIT_ATTEMPTS || Instant::now() + COMMIT_BACKOFF > deadline {
            warn!(%pod, %container, attempt, %output, "Giving up on carrier2 commit");
            return Err(Error::permanent(format!(
                "carrier2 in pod {pod} did not accept its config after {attempt} attempts"
            )));
        }
        tokio::time::sleep(COMMIT_BACKOFF).await;
    }
}

/// Reads the live document of `container`, if it has one.
///
/// Documents that cannot be parsed are treated as missing.
pub async fn read(api: &Api<Pod>, pod: &str, container: &str) -> Result<Option<Config>> {
    let out = pod::exec(api, pod, Some(container), ["cat", CONFIG_FILE]).await?;
    if !out.success || out.stdout.trim().is_empty() {
        return Ok(None);
    }
    match Config::from_yaml(&out.stdout) {
        Ok(config) => Ok(Some(config)),
        Err(error) => {
            warn!(%pod, %container, %error, "Ignoring unreadable carrier2 config");
            Ok(None)
        }
    }
}

/// Waits until every container of the pod reports ready.
async fn wait_ready(api: &Api<Pod>, name: &str) -> Result<()> {
    let deadline = Instant::now() + READY_TIMEOUT;
    loop {
        let pod = api.get(name).await?;
        if pod::all_containers_ready(&pod) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::temporary(format!(
                "containers of pod {name} are not ready"
            )));
        }
        tokio::time::sleep(READY_BACKOFF).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn script_writes_then_reloads() {
        let script = script("version: 1\n", false);
        let lines = script.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "cat <<'EOF' > /tmp/config.yaml");
        assert_eq!(lines[1], "version: 1");
        assert_eq!(lines[2], "EOF");
        assert!(lines[3].starts_with("RUST_LOG=info; kill -SIGQUIT $(cat /tmp/carrier2.pid);"));
        assert!(lines[3].contains("carrier2 -c /tmp/config.yaml -u -d &> /tmp/carrier.log"));
        assert!(lines[3].contains("else RUST_LOG=info carrier2 -c /tmp/config.yaml -d"));
        assert_eq!(lines[4], "cat /tmp/carrier.log");

        assert!(super::script("", true).contains("RUST_LOG=debug carrier2"));
    }

    #[test]
    fn recognizes_started_proxies() {
        assert!(committed("[INFO] Bootstrap done\n[INFO] Daemonizing the server\n"));
        assert!(!committed("[INFO] Bootstrap starting\n"));
        assert!(!committed(
            "Daemonizing the server\nthread 'main' panicked at src/main.rs:10"
        ));
    }
}
