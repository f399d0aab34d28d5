// shell.rs

use std::sync::Arc;

use log::*;
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::watch,
    time::{sleep, Duration},
};

use crate::*;

pub const GREETING: &str = "WELCOME!!!";

const COMMANDS: &[(&str, &str)] = &[
    ("status", "get a status report"),
    ("mqtt_status", "mqtt status report"),
    ("indicator", "last control value received"),
    ("session", "messaging session state"),
    ("help", "list commands"),
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub code: i32,
}

impl CommandOutput {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            code: 0,
        }
    }
}

/// Read-only queries for the interactive console.
pub struct CommandSurface {
    state: Arc<NodeState>,
    session: watch::Receiver<SessionState>,
}

impl CommandSurface {
    pub fn new(state: Arc<NodeState>, session: watch::Receiver<SessionState>) -> Self {
        Self { state, session }
    }

    pub fn status(&self) -> &'static str {
        GREETING
    }

    pub fn mqtt_status(&self) -> String {
        let c = &self.state.config.session;
        format!(
            "MQTT BROKER ADDRESS: {} \nPORT: {} \nTOPIC_IN: {}/{} TOPIC_OUT: {}",
            c.broker_addr, c.broker_port, c.topic_in, c.device_id, c.topic_out
        )
    }

    pub fn indicator(&self) -> String {
        format!("STATUS: {:?}", self.state.status.text())
    }

    pub fn session_state(&self) -> String {
        format!("SESSION: {}", *self.session.borrow())
    }

    fn help(&self) -> String {
        let mut out = String::from("Command              Description\n---------------------------------------");
        for (name, desc) in COMMANDS {
            out.push_str(&format!("\n{name:<20} {desc}"));
        }
        out
    }

    /// Run one input line. Arguments after the command name are ignored.
    pub fn dispatch(&self, line: &str) -> Option<CommandOutput> {
        let cmd = line.split_whitespace().next()?;
        Some(match cmd {
            "status" => CommandOutput::ok(self.status()),
            "mqtt_status" => CommandOutput::ok(self.mqtt_status()),
            "indicator" => CommandOutput::ok(self.indicator()),
            "session" => CommandOutput::ok(self.session_state()),
            "help" => CommandOutput::ok(self.help()),
            other => CommandOutput {
                text: format!("shell: command not found: {other}"),
                code: 1,
            },
        })
    }
}

/// Serve commands from `input` until it closes. Console errors are logged
/// here and never reach the caller. Lines that are not UTF-8 are decoded
/// lossily; any I/O failure ends the session like EOF.
pub async fn serve_console<R, W>(surface: &CommandSurface, mut input: R, mut out: W)
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    let mut code = 0;

    loop {
        let prompt = match code {
            0 => "> ".to_string(),
            c => format!("[{c}]> "),
        };
        if let Err(e) = write_flush(&mut out, prompt.as_bytes()).await {
            error!("Console write failed: {e}");
            return;
        }

        buf.clear();
        match input.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                error!("Console read failed: {e}");
                return;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let Some(res) = surface.dispatch(&line) else {
            continue;
        };
        code = res.code;
        if code != 0 {
            warn!("Console command exited with {code}: {}", line.trim_end());
        }
        let mut text = res.text;
        text.push('\n');
        if let Err(e) = write_flush(&mut out, text.as_bytes()).await {
            error!("Console write failed: {e}");
            return;
        }
    }
}

async fn write_flush<W: AsyncWrite + Unpin>(out: &mut W, data: &[u8]) -> io::Result<()> {
    out.write_all(data).await?;
    out.flush().await
}

/// Serve commands from stdin. When input closes the console goes quiet
/// but the task stays alive, so the node keeps running unattended.
pub async fn run_shell(surface: CommandSurface) -> anyhow::Result<()> {
    serve_console(&surface, BufReader::new(io::stdin()), io::stdout()).await;

    info!("Console input closed.");
    // we cannot return, otherwise the supervisor would stop the node
    loop {
        sleep(Duration::from_secs(3600)).await;
    }
}


// EOF
