//! Playwright browser backend
//!
//! [`PlaywrightDriver`] keeps one `node` process alive for the whole suite.
//! The process runs an embedded bridge script that owns a Playwright page
//! and answers one JSON request per line on stdin with one JSON reply per
//! line on stdout. Locators cross the boundary as the JavaScript expressions
//! produced by [`Locator::to_js`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::driver::{Action, Driver, ElementInfo, RegionCommand, RegionData, RegionEpochs};
use crate::error::{E2eError, E2eResult};
use crate::locator::Locator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// Configuration for the browser backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaywrightConfig {
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// `node` executable
    pub node_binary: PathBuf,
    /// `node_modules` directory that provides `playwright`
    pub node_modules: Option<PathBuf>,
    pub screenshot_dir: PathBuf,
    pub launch_timeout_ms: u64,
    /// Upper bound for a single bridge round trip
    pub command_timeout_ms: u64,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            node_binary: PathBuf::from("node"),
            node_modules: None,
            screenshot_dir: PathBuf::from("test-results/screenshots"),
            launch_timeout_ms: 60_000,
            command_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    navigated: bool,
}

struct Bridge {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl Bridge {
    /// Next reply line matching `want`; other output is logged and skipped
    async fn read_reply(&mut self, want: impl Fn(&Reply) -> bool) -> E2eResult<Reply> {
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Err(E2eError::Driver("browser bridge exited".to_string()));
            };
            match serde_json::from_str::<Reply>(&line) {
                Ok(reply) if want(&reply) => return Ok(reply),
                _ => debug!("bridge: {}", line),
            }
        }
    }
}

pub struct PlaywrightDriver {
    base_url: String,
    bridge: Mutex<Bridge>,
    epochs: RegionEpochs,
    screenshot_dir: PathBuf,
    command_timeout: Duration,
    _workdir: TempDir,
}

impl PlaywrightDriver {
    /// Start node with the bridge script and wait for the browser to launch
    pub async fn launch(config: &PlaywrightConfig, base_url: &str) -> E2eResult<Self> {
        Self::check_node_installed(config)?;
        std::fs::create_dir_all(&config.screenshot_dir)?;

        let workdir = tempfile::tempdir()?;
        let script_path = workdir.path().join("bridge.js");
        std::fs::write(&script_path, BRIDGE_JS)?;

        let node_modules = match &config.node_modules {
            Some(dir) => Some(dir.clone()),
            None => std::env::current_dir().ok().map(|d| d.join("node_modules")),
        };

        let mut cmd = TokioCommand::new(&config.node_binary);
        cmd.arg(&script_path)
            .env("STUDYQA_BROWSER", config.browser.as_str())
            .env("STUDYQA_HEADLESS", if config.headless { "1" } else { "0" })
            .env("STUDYQA_VIEWPORT_W", config.viewport_width.to_string())
            .env("STUDYQA_VIEWPORT_H", config.viewport_height.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = node_modules {
            cmd.env("NODE_PATH", dir);
        }

        info!("Launching {} via Playwright bridge", config.browser.as_str());
        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| E2eError::Driver("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| E2eError::Driver("bridge stdout unavailable".to_string()))?;

        let mut bridge = Bridge {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
        };

        let launch_timeout = Duration::from_millis(config.launch_timeout_ms);
        tokio::time::timeout(launch_timeout, bridge.read_reply(|r| r.ready))
            .await
            .map_err(|_| E2eError::Timeout {
                what: "browser launch".to_string(),
                waited_ms: config.launch_timeout_ms,
            })??;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bridge: Mutex::new(bridge),
            epochs: RegionEpochs::new(),
            screenshot_dir: config.screenshot_dir.clone(),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            _workdir: workdir,
        })
    }

    fn check_node_installed(config: &PlaywrightConfig) -> E2eResult<()> {
        let status = Command::new(&config.node_binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(E2eError::PlaywrightNotFound),
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    async fn call(&self, cmd: &str, mut args: Value) -> E2eResult<Value> {
        let start = Instant::now();
        let mut bridge = self.bridge.lock().await;
        bridge.next_id += 1;
        let id = bridge.next_id;

        args["id"] = json!(id);
        args["cmd"] = json!(cmd);
        let mut line = serde_json::to_string(&args)?;
        line.push('\n');
        bridge.stdin.write_all(line.as_bytes()).await?;
        bridge.stdin.flush().await?;

        let reply = tokio::time::timeout(self.command_timeout, bridge.read_reply(|r| r.id == Some(id)))
            .await
            .map_err(|_| E2eError::Timeout {
                what: format!("browser bridge '{cmd}'"),
                waited_ms: start.elapsed().as_millis() as u64,
            })??;

        if reply.navigated {
            self.epochs.bump_all();
        }
        if !reply.ok {
            return Err(E2eError::Driver(
                reply.error.unwrap_or_else(|| format!("'{cmd}' failed")),
            ));
        }
        Ok(reply.result)
    }

    /// Full-page screenshot into the configured directory
    pub async fn screenshot(&self, name: &str) -> E2eResult<PathBuf> {
        let path = self.screenshot_dir.join(format!("{name}.png"));
        self.call("screenshot", json!({ "path": path })).await?;
        Ok(path)
    }
}

#[async_trait]
impl Driver for PlaywrightDriver {
    fn name(&self) -> &str {
        "playwright"
    }

    fn epochs(&self) -> &RegionEpochs {
        &self.epochs
    }

    async fn navigate(&self, path: &str) -> E2eResult<()> {
        let url = self.url_for(path);
        self.call("navigate", json!({ "url": url })).await?;
        self.epochs.bump_all();
        Ok(())
    }

    async fn query(&self, locator: &Locator) -> E2eResult<Vec<ElementInfo>> {
        let result = self.call("query", json!({ "js": locator.to_js() })).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn perform(&self, locator: &Locator, action: &Action) -> E2eResult<()> {
        self.call(
            "perform",
            json!({ "js": locator.to_js(), "action": action }),
        )
        .await
        .map(|_| ())
    }

    async fn page_text(&self) -> E2eResult<String> {
        let result = self.call("text", json!({})).await?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }

    async fn read_region(&self, name: &str) -> E2eResult<Option<RegionData>> {
        let result = self.call("region", json!({ "name": name })).await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(result)?))
    }

    async fn region_command(&self, name: &str, command: &RegionCommand) -> E2eResult<()> {
        let mut payload = serde_json::to_value(command)?;
        if let RegionCommand::SetFilter { op, .. } = command {
            payload["suffix"] = json!(op.url_suffix());
        }
        self.call("region_command", json!({ "name": name, "command": payload }))
            .await?;
        if command.is_structural() {
            self.epochs.bump(name);
        }
        Ok(())
    }

    async fn shutdown(&self) -> E2eResult<()> {
        let mut bridge = self.bridge.lock().await;
        let _ = bridge.stdin.write_all(b"{\"cmd\":\"close\"}\n").await;
        let _ = bridge.stdin.flush().await;

        #[cfg(unix)]
        if let Some(pid) = bridge.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if tokio::time::timeout(Duration::from_secs(5), bridge.child.wait())
                .await
                .is_err()
            {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        if tokio::time::timeout(Duration::from_secs(5), bridge.child.wait())
            .await
            .is_err()
        {
            warn!("Browser bridge did not exit; killing it");
            bridge.child.kill().await?;
        }
        info!("Browser closed");
        Ok(())
    }
}

const BRIDGE_JS: &str = r##"
const readline = require('readline');
const pw = require('playwright');

const norm = (s) => (s || '').replace(/\s+/g, ' ').trim();

(async () => {
  const browser = await pw[process.env.STUDYQA_BROWSER || 'chromium'].launch({
    headless: process.env.STUDYQA_HEADLESS !== '0',
  });
  const context = await browser.newContext({
    viewport: {
      width: Number(process.env.STUDYQA_VIEWPORT_W) || 1280,
      height: Number(process.env.STUDYQA_VIEWPORT_H) || 720,
    },
  });
  const page = await context.newPage();
  let navigations = 0;
  page.on('framenavigated', (frame) => {
    if (frame === page.mainFrame()) navigations++;
  });

  const query = (js) => page.evaluate((expr) => {
    const text = (el) => (el.innerText || el.textContent || '').replace(/\s+/g, ' ').trim();
    return (0, eval)(expr).map((el) => ({
      tag: el.tagName.toLowerCase(),
      text: text(el),
      attrs: Object.fromEntries(Array.from(el.attributes).map((a) => [a.name, a.value])),
      value: 'value' in el ? String(el.value) : null,
      checked: !!el.checked,
    }));
  }, js);

  const perform = async (js, action) => {
    const handle = await page.evaluateHandle((expr) => {
      const els = (0, eval)(expr);
      if (els.length !== 1) throw new Error(`expected one element, found ${els.length}`);
      return els[0];
    }, js);
    const el = handle.asElement();
    switch (action.type) {
      case 'click': await el.click(); break;
      case 'fill': await el.fill(action.value); break;
      case 'set_checked': await el.setChecked(action.checked); break;
      case 'select': await el.selectOption(action.value); break;
      case 'upload': await el.setInputFiles(action.path); break;
      default: throw new Error(`unknown action ${action.type}`);
    }
    await page.waitForLoadState('domcontentloaded');
  };

  const region = (name) => page.evaluate((name) => {
    const text = (el) => (el.innerText || el.textContent || '').replace(/\s+/g, ' ').trim();
    const table = document.querySelector(`table[lk-region-name="${name}"]`);
    if (!table) return null;
    const header = table.querySelector('tr.labkey-col-header');
    const headerCells = header ? Array.from(header.children) : [];
    const skip = headerCells.length && !text(headerCells[0]) ? 1 : 0;
    const columns = headerCells.slice(skip).map(text);
    const rowEls = Array.from(table.querySelectorAll('tr.labkey-row, tr.labkey-alternate-row'));
    const rows = rowEls.map((tr) => Array.from(tr.children).slice(skip).map(text));
    const checked = rowEls.map((tr) => {
      const box = tr.querySelector('input[name=".select"]');
      return !!(box && box.checked);
    });
    const totals = table.querySelector('tr.labkey-col-total');
    let summary = null;
    if (totals) {
      summary = {};
      Array.from(totals.children).slice(skip).forEach((td, i) => {
        if (columns[i] && text(td)) summary[columns[i]] = text(td);
      });
    }
    const pager = document.querySelector(`[lk-region-name="${name}"] .labkey-pagination`)
      || document.querySelector('.labkey-pagination');
    return { name, columns, rows, summary, checked, pagination: pager ? text(pager) : null };
  }, name);

  const regionCommand = async (name, cmd) => {
    await page.evaluate(([name, cmd]) => {
      const dr = window.LABKEY && LABKEY.DataRegions[name];
      if (!dr) throw new Error(`no data region ${name}`);
      switch (cmd.type) {
        case 'set_filter':
          dr.replaceFilter(LABKEY.Filter.create(cmd.column, cmd.value,
            LABKEY.Filter.getFilterTypeForURLSuffix(cmd.suffix)));
          break;
        case 'clear_filter': dr.clearFilter(cmd.column); break;
        case 'clear_all_filters': dr.clearAllFilters(); break;
        case 'sort': dr.changeSort(cmd.column, cmd.descending ? '-' : '+'); break;
        case 'set_page_size': dr.setMaxRows(cmd.size); break;
        case 'show_all': dr.showAll(); break;
        case 'next_page': dr.pageNext(); break;
        case 'previous_page': dr.pagePrev(); break;
        case 'set_checked': {
          const boxes = document.querySelectorAll(`table[lk-region-name="${name}"] input[name=".select"]`);
          const box = boxes[cmd.row];
          if (!box) throw new Error(`no row ${cmd.row}`);
          if (box.checked !== cmd.checked) box.click();
          break;
        }
        case 'set_all_checked': dr.selectPage(cmd.checked); break;
        default: throw new Error(`unknown region command ${cmd.type}`);
      }
    }, [name, cmd]);
    await page.waitForLoadState('networkidle');
  };

  process.stdout.write(JSON.stringify({ ready: true }) + '\n');

  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    let req;
    try { req = JSON.parse(line); } catch (e) { continue; }
    if (req.cmd === 'close') break;
    const before = navigations;
    let reply;
    try {
      let result = null;
      switch (req.cmd) {
        case 'navigate': await page.goto(req.url); break;
        case 'query': result = await query(req.js); break;
        case 'perform': await perform(req.js, req.action); break;
        case 'text': result = norm(await page.evaluate(() => document.body.innerText)); break;
        case 'region': result = await region(req.name); break;
        case 'region_command': await regionCommand(req.name, req.command); break;
        case 'screenshot': await page.screenshot({ path: req.path, fullPage: true }); break;
        default: throw new Error(`unknown command ${req.cmd}`);
      }
      reply = { id: req.id, ok: true, result, navigated: navigations !== before };
    } catch (e) {
      reply = { id: req.id, ok: false, error: String((e && e.message) || e), navigated: navigations !== before };
    }
    process.stdout.write(JSON.stringify(reply) + '\n');
  }
  await browser.close();
  process.exit(0);
})().catch((e) => {
  console.error(e);
  process.exit(1);
});
"##;
