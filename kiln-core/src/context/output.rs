//! Structured output sink.
//!
//! Every user-visible event (lifecycle state, structured info, messages,
//! errors, prompts, log dumps) goes through [`Output`]. Rendering depends on
//! the output format selected at construction: `text` is colorized and
//! human-oriented, `json` emits one compact object per line, and
//! `subscription` suppresses console output entirely and instead forwards
//! each state/info message to every registered subscriber channel.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use colored::Colorize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::consts;
use crate::error::KilnError;

/// A single rendered event: flat string key/value pairs.
pub type OutMessage = BTreeMap<String, String>;

/// Console output format, fixed at sink construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Subscription,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
            OutputFormat::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = KilnError;

    /// An unrecognized format value is a fatal configuration error at the
    /// call site; there is no silent fallback rendering.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "subscription" => Ok(OutputFormat::Subscription),
            other => Err(KilnError::UnsupportedOutputFormat { value: other.to_string() }),
        }
    }
}

/// Structured fields attached to an event. Values are stringified at the
/// call site; keys render in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutVars(BTreeMap<String, String>);

impl OutVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Into<String>, V: ToString>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Builds an [`OutVars`] from `key => value` pairs; values are stringified.
#[macro_export]
macro_rules! ovars {
    () => { $crate::context::output::OutVars::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut vars = $crate::context::output::OutVars::new();
        $(vars.insert($key, $value);)+
        vars
    }};
}

/// The event sink.
///
/// Holds the command name, the quiet flag, the output format, and the
/// subscriber channel map. In subscription mode a background forwarder task
/// drains an internal channel and re-broadcasts every message to all
/// subscriber channels; subscriber senders are unbounded so one slow
/// consumer never stalls delivery to the others.
pub struct Output {
    cmd_name: String,
    quiet: bool,
    format: OutputFormat,
    subscribers: HashMap<String, mpsc::UnboundedSender<OutMessage>>,
    internal_tx: Mutex<Option<mpsc::UnboundedSender<OutMessage>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Output {
    /// Create a new sink. In subscription mode this spawns the forwarder
    /// task, so a tokio runtime must be active.
    pub fn new(
        cmd_name: &str,
        quiet: bool,
        format: OutputFormat,
        subscribers: HashMap<String, mpsc::UnboundedSender<OutMessage>>,
    ) -> Self {
        let (internal_tx, forwarder) = if format == OutputFormat::Subscription {
            let (tx, mut rx) = mpsc::unbounded_channel::<OutMessage>();
            let targets = subscribers.clone();
            let handle = tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    debug!(?msg, "forwarding subscription message");
                    for tx in targets.values() {
                        // A closed subscriber just stops receiving.
                        let _ = tx.send(msg.clone());
                    }
                }
            });
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        Self {
            cmd_name: cmd_name.to_string(),
            quiet,
            format,
            subscribers,
            internal_tx: Mutex::new(internal_tx),
            forwarder: Mutex::new(forwarder),
        }
    }

    pub fn cmd_name(&self) -> &str {
        &self.cmd_name
    }

    pub fn quiet(&self) -> bool {
        self.quiet
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Emit a lifecycle state marker.
    ///
    /// The `exit.code` field is special: it renders inline as `code=<n>` and
    /// is excluded from the generic field list. Quiet suppression does not
    /// apply in subscription mode because subscribers still need lifecycle
    /// signals.
    pub fn state<V: Into<Option<OutVars>>>(&self, name: &str, vars: V) {
        if self.quiet && self.format != OutputFormat::Subscription {
            return;
        }

        let vars = vars.into().unwrap_or_default();
        let mut msg = OutMessage::new();
        msg.insert("cmd".to_string(), self.cmd_name.clone());
        msg.insert("state".to_string(), name.to_string());

        let mut exit_info = String::new();
        let mut min_count = 0;
        if let Some(code) = vars.get("exit.code") {
            min_count = 1;
            exit_info = format!(" code={}", code);
            msg.insert("exit.code".to_string(), code.to_string());
        }

        let mut info = String::new();
        if vars.len() > min_count {
            for (k, v) in vars.iter() {
                if k == "exit.code" {
                    continue;
                }
                msg.insert(k.clone(), v.clone());
                let val = if v.contains(char::is_whitespace) && !v.starts_with('"') {
                    format!("\"{}\"", v)
                } else {
                    v.clone()
                };
                info.push_str(k);
                info.push('=');
                info.push_str(&val);
                info.push(' ');
            }
        }

        match self.format {
            OutputFormat::Json => self.emit_json(&msg),
            OutputFormat::Text => {
                let sep = if info.is_empty() { "" } else { " " };
                let line = format!(
                    "cmd={} state={}{}{}{}",
                    self.cmd_name,
                    name,
                    exit_info,
                    sep,
                    info.trim_end()
                );
                if name == consts::STATE_EXITED || name.contains("error") {
                    self.emit(line.red().bold().to_string());
                } else {
                    self.emit(line.cyan().bold().to_string());
                }
            }
            OutputFormat::Subscription => self.forward(msg),
        }
    }

    /// Emit a structured informational event with arbitrary key/value fields.
    pub fn info<V: Into<Option<OutVars>>>(&self, kind: &str, vars: V) {
        if self.quiet && self.format != OutputFormat::Subscription {
            return;
        }

        let vars = vars.into().unwrap_or_default();
        let mut msg = OutMessage::new();
        msg.insert("cmd".to_string(), self.cmd_name.clone());
        msg.insert("info".to_string(), kind.to_string());

        let mut data = String::new();
        for (k, v) in vars.iter() {
            msg.insert(k.clone(), v.clone());
            data.push_str(&format!("{}='{}' ", k.green().bold(), v.blue()));
        }

        match self.format {
            OutputFormat::Json => self.emit_json(&msg),
            OutputFormat::Text => {
                let sep = if data.is_empty() { "" } else { " " };
                let line = format!(
                    "cmd={} info={}{}{}",
                    self.cmd_name,
                    kind.magenta().bold(),
                    sep,
                    data.trim_end()
                );
                self.emit(line);
            }
            OutputFormat::Subscription => self.forward(msg),
        }
    }

    /// Emit a human-facing notice.
    pub fn message(&self, data: &str) {
        if self.quiet || data.is_empty() {
            return;
        }

        match self.format {
            OutputFormat::Json => {
                let mut msg = OutMessage::new();
                msg.insert("cmd".to_string(), self.cmd_name.clone());
                msg.insert("message".to_string(), data.to_string());
                self.emit_json(&msg);
            }
            OutputFormat::Text => {
                self.emit(format!("cmd={} message='{}'", self.cmd_name, data).magenta().to_string());
            }
            OutputFormat::Subscription => {}
        }
    }

    /// Emit a human-facing error notice of the given kind.
    pub fn error(&self, error_type: &str, data: &str) {
        if self.quiet || data.is_empty() {
            return;
        }

        match self.format {
            OutputFormat::Json => {
                let mut msg = OutMessage::new();
                msg.insert("cmd".to_string(), self.cmd_name.clone());
                msg.insert("error".to_string(), error_type.to_string());
                msg.insert("message".to_string(), data.to_string());
                self.emit_json(&msg);
            }
            OutputFormat::Text => {
                self.emit(
                    format!("cmd={} error={} message='{}'", self.cmd_name, error_type, data)
                        .red()
                        .to_string(),
                );
            }
            OutputFormat::Subscription => {}
        }
    }

    /// Emit a prompt line.
    pub fn prompt(&self, data: &str) {
        if self.quiet || data.is_empty() {
            return;
        }

        match self.format {
            OutputFormat::Json => {
                let mut msg = OutMessage::new();
                msg.insert("cmd".to_string(), self.cmd_name.clone());
                msg.insert("prompt".to_string(), data.to_string());
                self.emit_json(&msg);
            }
            OutputFormat::Text => {
                self.emit(format!("cmd={} prompt='{}'", self.cmd_name, data).red().to_string());
            }
            OutputFormat::Subscription => {}
        }
    }

    /// Hand a payload directly to the named subscriber channel. Whether the
    /// channel existed goes to the console log, not the event stream.
    pub fn data(&self, channel_key: &str, payload: OutMessage) {
        match self.subscribers.get(channel_key) {
            Some(tx) => {
                let _ = tx.send(payload);
                debug!(channel = channel_key, "data sent to channel");
            }
            None => {
                warn!(channel = channel_key, "no channel registered for key");
            }
        }
    }

    /// Emit a delimited multi-line block for raw sub-process output, bounded
    /// by matching START/END markers carrying the same field annotations.
    pub fn log_dump<V: Into<Option<OutVars>>>(&self, log_type: &str, data: &str, vars: V) {
        if self.quiet {
            return;
        }

        let vars = vars.into().unwrap_or_default();
        let mut msg = OutMessage::new();
        msg.insert("cmd".to_string(), self.cmd_name.clone());
        msg.insert("log".to_string(), log_type.to_string());
        msg.insert("data".to_string(), data.to_string());

        let mut info = String::new();
        for (k, v) in vars.iter() {
            msg.insert(k.clone(), v.clone());
            info.push_str(&format!("{}='{}' ", k.green().bold(), v.blue()));
        }

        match self.format {
            OutputFormat::Json => self.emit_json(&msg),
            OutputFormat::Text => {
                self.emit(format!(
                    "cmd={} log='{}' event=LOG.START {}====================",
                    self.cmd_name, log_type, info
                ));
                self.emit(data.to_string());
                self.emit(format!(
                    "cmd={} log='{}' event=LOG.END {}====================",
                    self.cmd_name, log_type, info
                ));
            }
            OutputFormat::Subscription => {}
        }
    }

    /// Close the internal channel and wait for the forwarder to drain
    /// queued messages. Safe to call in any format; a no-op outside
    /// subscription mode or when already shut down.
    pub async fn shutdown(&self) {
        let tx = self.internal_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(tx);
        let handle = self.forwarder.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn forward(&self, msg: OutMessage) {
        let guard = self.internal_tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    debug!("subscription forwarder already stopped");
                }
            }
            None => debug!("subscription sink is shut down"),
        }
    }

    fn emit_json(&self, msg: &OutMessage) {
        match serde_json::to_string(msg) {
            Ok(line) => self.emit(line),
            Err(err) => warn!(error = %err, "failed to serialize event"),
        }
    }

    fn emit(&self, line: String) {
        println!("{}", line);
    }
}

/// Disable colorized output globally.
pub fn no_color() {
    colored::control::set_override(false);
}

#[derive(Serialize)]
struct SupportLine {
    app: &'static str,
    message: &'static str,
    info: &'static str,
}

/// Print the community/support info block that trails every termination
/// path on the console formats.
pub fn show_support_info(format: OutputFormat) {
    let lines = [
        SupportLine {
            app: consts::APP_NAME,
            message: "GitHub Discussions",
            info: consts::SUPPORT_DISCUSSIONS,
        },
        SupportLine {
            app: consts::APP_NAME,
            message: "Join the Discord server to ask questions or to share your feedback",
            info: consts::SUPPORT_CHAT,
        },
    ];

    match format {
        OutputFormat::Json => {
            for line in &lines {
                if let Ok(rendered) = serde_json::to_string(line) {
                    println!("{}", rendered);
                }
            }
        }
        _ => {
            for line in &lines {
                println!(
                    "{}",
                    format!("app='{}' message='{}' info='{}'", line.app, line.message, line.info)
                        .magenta()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovars;

    #[test]
    fn test_format_parsing() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("subscription".parse::<OutputFormat>().unwrap(), OutputFormat::Subscription);
        assert!(matches!(
            "yaml".parse::<OutputFormat>(),
            Err(KilnError::UnsupportedOutputFormat { .. })
        ));
    }

    #[test]
    fn test_ovars_macro_stringifies() {
        let vars = ovars! {"count" => 3, "name" => "demo"};
        assert_eq!(vars.get("count"), Some("3"));
        assert_eq!(vars.get("name"), Some("demo"));
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn test_out_message_json_round_trip() {
        let vars = ovars! {"engine" => "docker", "arch" => "amd64"};
        let mut msg = OutMessage::new();
        msg.insert("cmd".to_string(), "build".to_string());
        msg.insert("info".to_string(), "cmd.input.params".to_string());
        for (k, v) in vars.iter() {
            msg.insert(k.clone(), v.clone());
        }

        let rendered = serde_json::to_string(&msg).unwrap();
        assert!(!rendered.contains('\n'));

        let parsed: OutMessage = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.get("cmd").map(String::as_str), Some("build"));
        assert_eq!(parsed.get("info").map(String::as_str), Some("cmd.input.params"));
        assert_eq!(parsed.get("engine").map(String::as_str), Some("docker"));
        assert_eq!(parsed.get("arch").map(String::as_str), Some("amd64"));
    }

    #[tokio::test]
    async fn test_subscription_delivery_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subs = HashMap::new();
        subs.insert("events".to_string(), tx);

        let out = Output::new("build", false, OutputFormat::Subscription, subs);
        out.state("started", None);
        out.info("cmd.input.params", ovars! {"engine" => "simple"});
        out.state("done", None);
        out.shutdown().await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.get("state").map(String::as_str), Some("started"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.get("info").map(String::as_str), Some("cmd.input.params"));
        assert_eq!(second.get("engine").map(String::as_str), Some("simple"));
        let third = rx.recv().await.unwrap();
        assert_eq!(third.get("state").map(String::as_str), Some("done"));
    }

    #[tokio::test]
    async fn test_subscription_quiet_still_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subs = HashMap::new();
        subs.insert("events".to_string(), tx);

        let out = Output::new("build", true, OutputFormat::Subscription, subs);
        out.state("started", None);
        out.shutdown().await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.get("state").map(String::as_str), Some("started"));
    }

    #[tokio::test]
    async fn test_subscription_fan_out_to_all_channels() {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let mut subs = HashMap::new();
        subs.insert("a".to_string(), tx_a);
        subs.insert("b".to_string(), tx_b);

        let out = Output::new("build", false, OutputFormat::Subscription, subs);
        out.state("started", None);
        out.shutdown().await;

        assert_eq!(rx_a.recv().await.unwrap().get("state").map(String::as_str), Some("started"));
        assert_eq!(rx_b.recv().await.unwrap().get("state").map(String::as_str), Some("started"));
        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_data_hands_off_to_named_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subs = HashMap::new();
        subs.insert("progress".to_string(), tx);

        let out = Output::new("build", false, OutputFormat::Text, subs);
        let mut payload = OutMessage::new();
        payload.insert("step".to_string(), "1".to_string());
        out.data("progress", payload);
        out.data("missing", OutMessage::new());

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.get("step").map(String::as_str), Some("1"));
    }
}
