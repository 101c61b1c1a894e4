use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, Form, ValidationError, mask_secret};
use crate::llm::{Completer, CompletionResult, ErrorKind, RequestParameters, Role};

const WELCOME_BANNER: &str = r#"
+-------------------------------------------------------------+
|                                                             |
|   llmchat - chat with any OpenAI-compatible endpoint        |
|                                                             |
+-------------------------------------------------------------+

Type a message and press Enter to send it.
End a line with \ to continue your message on the next line.
Type /help for the list of commands.
"#;

const HELP: &str = "\nCommands:\n\
  /key <api key>     - Set the API key\n\
  /url <base url>    - Set the endpoint base URL\n\
  /model <name>      - Set the model name\n\
  /temp <0.0-2.0>    - Set the sampling temperature\n\
  /max <1-8192>      - Set the maximum reply length\n\
  /config            - Show the current settings\n\
  /save              - Save the settings to the config file\n\
  /history           - Show this session's transcript\n\
  /help              - Show this help\n\
  /quit              - Disconnect\n";

const THINKING: &str = "(thinking...)";

#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Local>,
}

/// Append-only record of the session. The single pending "thinking"
/// entry is the only one ever rewritten.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<ConversationEntry>,
    placeholder: Option<usize>,
}

impl Transcript {
    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.entries.push(ConversationEntry {
            role,
            content: content.into(),
            at: Local::now(),
        });
    }

    fn push_placeholder(&mut self) {
        self.push(Role::Assistant, THINKING);
        self.placeholder = Some(self.entries.len() - 1);
    }

    /// Fills the pending entry with the reply, or appends it if nothing is
    /// pending.
    fn resolve_placeholder(&mut self, content: String) {
        match self.placeholder.take() {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.content = content;
                entry.at = Local::now();
            }
            None => self.push(Role::Assistant, content),
        }
    }

    fn render(&self) -> String {
        self.entries
            .iter()
            .map(|entry| {
                format!(
                    "[{}] {}: {}",
                    entry.at.format("%H:%M:%S"),
                    entry.role.as_str().to_uppercase(),
                    entry.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

enum CommandResult {
    Quit,
    /// The line was a continuation; keep collecting the prompt.
    Continue,
    /// A request went out; the reply will arrive on the channel.
    Thinking,
    Message(String),
}

/// Everything a session shows and edits. Only the session loop touches it.
pub struct App {
    form: Form,
    transcript: Transcript,
    busy: bool,
    /// Served to a network peer: the shared config file is off limits.
    remote: bool,
    /// The API key in the form is the operator's, not the peer's own. The
    /// endpoint stays pinned until the peer sets a key of their own.
    operator_key: bool,
}

impl App {
    pub fn new(form: Form) -> Self {
        Self {
            form,
            transcript: Transcript::default(),
            busy: false,
            remote: false,
            operator_key: false,
        }
    }

    /// Restricts the app for a network peer who shares the operator's
    /// settings.
    fn restrict_to_remote(&mut self) {
        self.remote = true;
        self.operator_key = !self.form.api_key.trim().is_empty();
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// True while a request is in flight; new prompts are refused.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Validates the form against `prompt`. On success the prompt and a
    /// placeholder reply are recorded and the app becomes busy; on
    /// failure nothing changes.
    pub fn submit(&mut self, prompt: &str) -> Result<RequestParameters, ValidationError> {
        let params = self.form.validate(prompt)?;
        self.transcript.push(Role::User, prompt);
        self.transcript.push_placeholder();
        self.busy = true;
        Ok(params)
    }

    /// Records the reply (or its error text) and returns what to show.
    pub fn finish(&mut self, result: &CompletionResult) -> String {
        let text = result.to_string();
        self.transcript.resolve_placeholder(text.clone());
        self.busy = false;
        text
    }

    fn set_field(
        &mut self,
        cmd: &str,
        label: &str,
        arg: Option<&str>,
        field: fn(&mut Form) -> &mut String,
    ) -> CommandResult {
        let Some(value) = arg else {
            return CommandResult::Message(format!("\nUsage: {} <value>\n", cmd));
        };
        *field(&mut self.form) = value.to_string();
        let shown = if cmd == "/key" {
            mask_secret(value)
        } else {
            value.to_string()
        };
        CommandResult::Message(format!("\n{} set to: {}\n", label, shown))
    }

    fn handle_command(&mut self, input: &str, store: &ConfigStore) -> CommandResult {
        let parts: Vec<&str> = input.splitn(2, ' ').collect();
        let cmd = parts[0].to_lowercase();
        let arg = parts.get(1).map(|s| s.trim()).filter(|s| !s.is_empty());

        match cmd.as_str() {
            "/quit" | "/exit" | "/q" => CommandResult::Quit,
            "/key" => {
                let result = self.set_field(&cmd, "API key", arg, |form| &mut form.api_key);
                if arg.is_some() {
                    self.operator_key = false;
                }
                result
            }
            "/url" if self.operator_key => CommandResult::Message(
                "\nThe base URL is fixed while you use the server's API key.\n\
                 Set your own key with /key first.\n"
                    .to_string(),
            ),
            "/url" => self.set_field(&cmd, "Base URL", arg, |form| &mut form.base_url),
            "/model" => self.set_field(&cmd, "Model name", arg, |form| &mut form.model_name),
            "/temp" => self.set_field(&cmd, "Temperature", arg, |form| &mut form.temperature),
            "/max" => self.set_field(&cmd, "Max length", arg, |form| &mut form.max_tokens),
            "/config" => CommandResult::Message(format!(
                "\nAPI key:      {}\nBase URL:     {}\nModel name:   {}\nTemperature:  {}\nMax length:   {}\n",
                mask_secret(&self.form.api_key),
                self.form.base_url,
                self.form.model_name,
                self.form.temperature,
                self.form.max_tokens,
            )),
            "/save" if self.remote => CommandResult::Message(
                "\nSaving is only available in a local terminal session.\n".to_string(),
            ),
            "/save" => match store.save(&self.form.to_stored()) {
                Ok(()) => CommandResult::Message(format!(
                    "\nConfiguration saved to {}.\n\
                     Note: the file is base64-encoded, not encrypted.\n",
                    store.path().display()
                )),
                Err(e) => {
                    warn!("Failed to save configuration: {:#}", e);
                    CommandResult::Message(format!("\nError saving configuration: {:#}\n", e))
                }
            },
            "/history" => {
                if self.transcript.is_empty() {
                    CommandResult::Message("\nNo messages yet.\n".to_string())
                } else {
                    CommandResult::Message(format!("\n{}\n", self.transcript.render()))
                }
            }
            "/help" | "/?" => CommandResult::Message(HELP.to_string()),
            _ => CommandResult::Message(format!("\nUnknown command: {}\n", cmd)),
        }
    }
}

/// One chat conversation over any line-oriented stream: a terminal or a
/// telnet connection.
pub struct Session {
    peer: String,
    app: App,
    completer: Arc<dyn Completer>,
    store: Arc<ConfigStore>,
}

impl Session {
    pub fn new(
        peer: impl Into<String>,
        completer: Arc<dyn Completer>,
        store: Arc<ConfigStore>,
        form: Form,
    ) -> Self {
        Self {
            peer: peer.into(),
            app: App::new(form),
            completer,
            store,
        }
    }

    /// Marks the session as served to a network peer. Such a session
    /// cannot save the shared config file, and cannot redirect the
    /// operator's API key to another endpoint.
    pub fn remote(mut self) -> Self {
        self.app.restrict_to_remote();
        self
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    /// Runs the completion on its own task and posts the result back to
    /// the session loop. A panic in the completer becomes an internal
    /// error instead of a lost reply.
    fn dispatch(&self, params: RequestParameters, tx: mpsc::UnboundedSender<CompletionResult>) {
        let completer = Arc::clone(&self.completer);
        let peer = self.peer.clone();

        tokio::spawn(async move {
            let call = tokio::spawn(async move { completer.complete(&params).await });
            let result = match call.await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Completion task for {} failed: {}", peer, e);
                    CompletionResult::failure(ErrorKind::InternalError, e.to_string())
                }
            };
            if tx.send(result).is_err() {
                debug!("Session {} closed before its reply arrived", peer);
            }
        });
    }

    fn handle_line(
        &mut self,
        line: &str,
        pending: &mut String,
        tx: &mpsc::UnboundedSender<CompletionResult>,
    ) -> CommandResult {
        let line = line.trim_end_matches('\r');

        if let Some(head) = line.strip_suffix('\\') {
            pending.push_str(head);
            pending.push('\n');
            return CommandResult::Continue;
        }

        if pending.is_empty() {
            let input = line.trim();
            if input.is_empty() {
                return CommandResult::Message(String::new());
            }
            if input.starts_with('/') {
                return self.app.handle_command(input, &self.store);
            }
        }

        // Earlier continuation lines stay buffered; only this line is refused.
        if self.app.is_busy() {
            let kept = if pending.is_empty() {
                ""
            } else {
                " Your earlier lines are kept; send the last line again."
            };
            return CommandResult::Message(format!(
                "\nStill waiting for the previous reply, please try again shortly.{}\n",
                kept
            ));
        }

        let mut prompt = std::mem::take(pending);
        prompt.push_str(line);

        match self.app.submit(&prompt) {
            Ok(params) => {
                debug!(
                    "{} submitted a prompt ({} chars) to {}",
                    self.peer,
                    prompt.chars().count(),
                    params.model_name
                );
                self.dispatch(params, tx.clone());
                CommandResult::Thinking
            }
            Err(e) => {
                info!("Rejected prompt from {}: {}", self.peer, e);
                CommandResult::Message(format!("\nError: {}\n", e))
            }
        }
    }

    pub async fn run<R, W>(&mut self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut writer = BufWriter::new(writer);
        let (tx, mut rx) = mpsc::unbounded_channel::<CompletionResult>();
        let mut pending = String::new();

        writer.write_all(WELCOME_BANNER.as_bytes()).await?;
        writer.write_all(b"\nYou: ").await?;
        writer.flush().await?;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read from client")? else {
                        break;
                    };

                    match self.handle_line(&line, &mut pending, &tx) {
                        CommandResult::Quit => {
                            writer.write_all(b"\nGoodbye!\n").await?;
                            writer.flush().await?;
                            return Ok(());
                        }
                        CommandResult::Continue => {
                            writer.write_all(b"...  ").await?;
                        }
                        CommandResult::Thinking => {
                            writer
                                .write_all(format!("\nAI: {}\r", THINKING).as_bytes())
                                .await?;
                        }
                        CommandResult::Message(msg) => {
                            writer.write_all(msg.as_bytes()).await?;
                            writer.write_all(b"\nYou: ").await?;
                        }
                    }
                    writer.flush().await?;
                }
                Some(result) = rx.recv() => {
                    let text = self.app.finish(&result);
                    writer.write_all(format!("AI: {}\n\nYou: ", text).as_bytes()).await?;
                    writer.flush().await?;
                }
            }
        }

        if !pending.is_empty() {
            info!("{} disconnected with an unfinished message", self.peer);
            writer
                .write_all(b"\nUnsent message discarded: input ended after a continuation line.\n")
                .await?;
        }

        // Input ended with a request still out; let it land in the transcript.
        if self.app.is_busy() {
            if let Some(result) = rx.recv().await {
                let text = self.app.finish(&result);
                writer.write_all(format!("AI: {}\n", text).as_bytes()).await?;
            }
        }

        writer.flush().await?;
        Ok(())
    }
}
