//! Scriptable browser surface
//!
//! The executor and crawler only see [`BrowserSurface`]: navigate, run a
//! script, capture a screenshot. [`PlaywrightSurface`] implements it with a
//! long-lived `node` process hosting Playwright, spoken to over JSON lines.

use crate::config::BrowserConfig;
use crate::scripts::ScriptKind;
use async_trait::async_trait;
use base64::Engine as _;
use lumen_common::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How long the driver may take to launch its browser
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(60);

/// A single-owner page the core drives
#[async_trait]
pub trait BrowserSurface: Send + Sync {
    /// Load `url`; resolves once the page reports it is ready
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Evaluate `script` as an async function body in the page
    async fn run(&self, script: &str) -> Result<Value>;

    /// Full-page PNG screenshot
    async fn capture(&self) -> Result<Vec<u8>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Creates fresh surfaces, used again whenever one becomes unusable
#[async_trait]
pub trait SurfaceFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn BrowserSurface>>;
}

// ============================================================================
// Driver protocol
// ============================================================================

#[derive(Debug, Serialize)]
struct DriverRequest<'a> {
    id: u64,
    op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    script: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct DriverReply {
    id: u64,
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

const DRIVER_SCRIPT: &str = r#"
const readline = require('readline');
const playwright = require('playwright');

const send = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');

(async () => {
  const engine = playwright[process.env.LUMEN_BROWSER || 'chromium'];
  const browser = await engine.launch({ headless: process.env.LUMEN_HEADLESS !== 'false' });
  const context = await browser.newContext({
    viewport: {
      width: Number(process.env.LUMEN_VIEWPORT_WIDTH) || 1280,
      height: Number(process.env.LUMEN_VIEWPORT_HEIGHT) || 720,
    },
  });
  const page = await context.newPage();
  page.setDefaultNavigationTimeout(Number(process.env.LUMEN_NAV_TIMEOUT_MS) || 25000);

  const handle = async (req) => {
    try {
      let value = null;
      if (req.op === 'navigate') {
        await page.goto(req.url, { waitUntil: 'load' });
      } else if (req.op === 'run') {
        value = await page.evaluate(async (source) => {
          const AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;
          return await new AsyncFunction(source)();
        }, req.script);
      } else if (req.op === 'capture') {
        value = (await page.screenshot({ fullPage: true })).toString('base64');
      } else if (req.op === 'close') {
        send({ id: req.id, ok: true, value: null });
        await browser.close();
        process.exit(0);
      } else {
        throw new Error('unknown op ' + req.op);
      }
      send({ id: req.id, ok: true, value: value === undefined ? null : value });
    } catch (e) {
      send({ id: req.id, ok: false, error: String((e && e.message) || e) });
    }
  };

  const rl = readline.createInterface({ input: process.stdin });
  rl.on('line', (line) => {
    let req;
    try {
      req = JSON.parse(line);
    } catch (e) {
      return;
    }
    handle(req);
  });
  rl.on('close', async () => {
    await browser.close();
    process.exit(0);
  });

  send({ id: 0, ok: true, value: 'ready' });
})().catch((e) => {
  process.stderr.write(String((e && e.stack) || e) + '\n');
  process.exit(1);
});
"#;

// ============================================================================
// Playwright surface
// ============================================================================

/// Browser surface backed by a Playwright driver process
pub struct PlaywrightSurface {
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    child: tokio::sync::Mutex<Child>,
    reader: JoinHandle<()>,
    // Keeps the driver script on disk for the life of the process
    _workdir: tempfile::TempDir,
}

impl PlaywrightSurface {
    /// Spawn the driver and wait until its browser is up
    pub async fn launch(config: &BrowserConfig) -> Result<Self> {
        let workdir = tempfile::tempdir()?;
        let script_path = workdir.path().join("driver.js");
        std::fs::write(&script_path, DRIVER_SCRIPT)?;

        let mut cmd = TokioCommand::new(&config.node_binary);
        cmd.arg(&script_path)
            .current_dir(workdir.path())
            .env("LUMEN_BROWSER", &config.browser)
            .env("LUMEN_HEADLESS", config.headless.to_string())
            .env("LUMEN_VIEWPORT_WIDTH", config.viewport_width.to_string())
            .env("LUMEN_VIEWPORT_HEIGHT", config.viewport_height.to_string())
            .env("LUMEN_NAV_TIMEOUT_MS", config.navigation_timeout_ms.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(node_path) = &config.node_path {
            cmd.env("NODE_PATH", node_path);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Browser(format!("Failed to spawn {}: {}", config.node_binary, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Browser("driver stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Browser("driver stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[driver] {}", line);
                }
            });
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, ready_rx) = oneshot::channel();
        pending.lock().insert(0, ready_tx);

        let reader = tokio::spawn(read_replies(BufReader::new(stdout), pending.clone()));

        match tokio::time::timeout(LAUNCH_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => {
                return Err(Error::Browser("driver exited during launch".to_string()));
            }
            Err(_) => {
                return Err(Error::Timeout {
                    seconds: LAUNCH_TIMEOUT.as_secs(),
                });
            }
        }

        info!("Launched {} surface (headless={})", config.browser, config.headless);

        Ok(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            child: tokio::sync::Mutex::new(child),
            reader,
            _workdir: workdir,
        })
    }

    async fn request(&self, op: &'static str, url: Option<&str>, script: Option<&str>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut line = serde_json::to_string(&DriverRequest { id, op, url, script })?;
        line.push('\n');
        {
            let mut stdin = self.stdin.lock().await;
            let written = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                self.pending.lock().remove(&id);
                return Err(Error::Browser(format!("driver write failed: {}", e)));
            }
        }
        trace!("driver <- {} #{}", op, id);

        rx.await
            .map_err(|_| Error::Browser("driver closed before replying".to_string()))?
    }
}

/// Dispatch driver replies to their waiting requests; on EOF fail everything still pending
async fn read_replies<R>(mut reader: BufReader<R>, pending: Pending)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("driver read failed: {}", e);
                break;
            }
        }

        let reply: DriverReply = match serde_json::from_str(line.trim()) {
            Ok(reply) => reply,
            Err(_) => {
                trace!("driver (non-protocol): {}", line.trim());
                continue;
            }
        };

        let Some(tx) = pending.lock().remove(&reply.id) else {
            trace!("driver reply #{} has no waiter", reply.id);
            continue;
        };
        let result = if reply.ok {
            Ok(reply.value)
        } else {
            Err(Error::Browser(
                reply.error.unwrap_or_else(|| "unknown driver error".to_string()),
            ))
        };
        let _ = tx.send(result);
    }

    let waiters: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(Error::Browser("driver exited".to_string())));
    }
}

#[async_trait]
impl BrowserSurface for PlaywrightSurface {
    async fn navigate(&self, url: &str) -> Result<()> {
        debug!("Navigating to {}", url);
        self.request("navigate", Some(url), None).await?;
        Ok(())
    }

    async fn run(&self, script: &str) -> Result<Value> {
        debug!("Running {:?} script", ScriptKind::of(script));
        self.request("run", None, Some(script)).await
    }

    async fn capture(&self) -> Result<Vec<u8>> {
        let value = self.request("capture", None, None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| Error::Browser("capture returned no image".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Browser(format!("invalid screenshot encoding: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.request("close", None, None).await {
            debug!("driver close: {}", e);
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("driver did not exit, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

impl Drop for PlaywrightSurface {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Launches a new Playwright surface per request
#[derive(Debug, Clone)]
pub struct PlaywrightFactory {
    config: BrowserConfig,
}

impl PlaywrightFactory {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SurfaceFactory for PlaywrightFactory {
    async fn create(&self) -> Result<Arc<dyn BrowserSurface>> {
        let surface = PlaywrightSurface::launch(&self.config).await?;
        Ok(Arc::new(surface))
    }
}
