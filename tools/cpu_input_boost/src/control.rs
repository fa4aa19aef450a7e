// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: control socket
//
// Line based protocol over a unix socket, one reply line per request:
//
//   boost <ms>          request a max boost          -> ok boosted | ok skipped
//   set <key> <value>   change a runtime tunable     -> ok
//   get                 current tunables as JSON
//   status              current metrics as JSON
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::config::Tunables;
use crate::machine::BoostRequests;
use crate::stats::MetricsSource;

pub const DEFAULT_CONTROL_SOCKET: &str = "/run/cpu_input_boost.sock";

/// What the socket may reach.
#[derive(Clone)]
pub struct ControlContext {
    pub requests: Arc<dyn BoostRequests>,
    pub tunables: Arc<Tunables>,
    pub metrics: MetricsSource,
}

/// Execute one request line and produce the reply, without the newline.
pub fn handle_command(line: &str, ctx: &ControlContext) -> String {
    match run_command(line, ctx) {
        Ok(reply) => reply,
        Err(e) => format!("error: {:#}", e),
    }
}

fn run_command(line: &str, ctx: &ControlContext) -> Result<String> {
    let mut words = line.split_whitespace();
    let cmd = words.next().unwrap_or("");
    let args: Vec<&str> = words.collect();

    match (cmd, args.as_slice()) {
        ("boost", [ms]) => {
            let ms: u32 = ms
                .parse()
                .with_context(|| format!("invalid duration {:?}", ms))?;
            if ctx.requests.request_max_boost(ms) {
                Ok("ok boosted".to_string())
            } else {
                Ok("ok skipped".to_string())
            }
        }
        ("set", [key, value]) => {
            ctx.tunables.set(key, value)?;
            Ok("ok".to_string())
        }
        ("get", []) => Ok(serde_json::to_string(&ctx.tunables.values())?),
        ("status", []) => ctx.metrics.snapshot().to_json(),
        ("", _) => bail!("empty command"),
        _ => bail!("unknown command {:?}", line.trim()),
    }
}

pub struct ControlServer {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind `path` (replacing a stale socket) and serve on a background
    /// thread. Binding happens here so errors reach the caller.
    pub fn start(path: &Path, ctx: ControlContext) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
        }
        let listener = StdUnixListener::bind(path)
            .with_context(|| format!("failed to bind control socket {}", path.display()))?;
        listener.set_nonblocking(true)?;
        info!("control socket listening on {}", path.display());

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("boost-control".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!("failed to create tokio runtime for control socket: {}", e);
                        return;
                    }
                };
                rt.block_on(serve(listener, ctx, thread_shutdown));
            })
            .context("failed to spawn control thread")?;

        Ok(Self {
            path: path.to_path_buf(),
            shutdown,
            thread: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("control thread panicked");
            }
            let _ = std::fs::remove_file(&self.path);
            debug!("control socket closed");
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(listener: StdUnixListener, ctx: ControlContext, shutdown: Arc<AtomicBool>) {
    let listener = match UnixListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            warn!("failed to register control socket: {}", e);
            return;
        }
    };

    while !shutdown.load(Ordering::Relaxed) {
        match tokio::time::timeout(Duration::from_millis(100), listener.accept()).await {
            Ok(Ok((stream, _))) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        debug!("control connection error: {}", e);
                    }
                });
            }
            Ok(Err(e)) => debug!("control accept error: {}", e),
            Err(_) => continue,
        }
    }
}

async fn handle_connection(stream: UnixStream, ctx: ControlContext) -> Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        debug!("control: {}", line.trim());
        let mut reply = handle_command(&line, &ctx);
        reply.push('\n');
        wr.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

/// Client side: send one request and return the reply line.
pub fn send_command(path: &Path, line: &str) -> Result<String> {
    let mut stream = StdUnixStream::connect(path)
        .with_context(|| format!("failed to connect to {}", path.display()))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(format!("{}\n", line.trim()).as_bytes())?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    let reply = reply.trim().to_string();
    if let Some(msg) = reply.strip_prefix("error: ") {
        bail!("{}", msg);
    }
    Ok(reply)
}
