use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use openagents_gateway_client::proto::Credentials;
use openagents_gateway_client::{
    GatewayConnection, LifecycleSignal, ProtocolSession, SupervisorPhase, WebSocketConnector,
    normalize_gateway_url,
};
use openagents_mirror_store::{
    CredentialVault, EncryptionService, KeyringSecretStore, MirrorStore, SearchHit, SecretStore,
};
use openagents_mirror_sync::{
    Attachment, ConnectionBanner, SendOptions, SendOutcome, SyncConfig, SyncEngine, SyncNotice,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::{DesktopConfig, SECRET_SERVICE, persist_gateway_url};

const TITLE_CHARS: usize = 48;

pub struct App {
    config: DesktopConfig,
    config_path: PathBuf,
    secrets: Arc<dyn SecretStore>,
}

impl App {
    pub fn new(config: DesktopConfig, config_path: PathBuf) -> Self {
        Self {
            config,
            config_path,
            secrets: Arc::new(KeyringSecretStore),
        }
    }

    fn gateway_host(&self) -> Result<String> {
        let url = normalize_gateway_url(&self.config.gateway_url)
            .with_context(|| format!("invalid gateway url {}", self.config.gateway_url))?;
        Ok(url.host_str().unwrap_or_default().to_string())
    }

    fn vault(&self) -> CredentialVault {
        CredentialVault::new(Arc::clone(&self.secrets), SECRET_SERVICE)
    }

    fn credentials(&self) -> Result<Credentials> {
        if let Some(token) = &self.config.token {
            return Ok(Credentials::token(token.clone()));
        }
        let host = self.gateway_host()?;
        self.vault()
            .token(&host)
            .context("failed to read the gateway token from the keyring")?
            .map(Credentials::token)
            .ok_or_else(|| {
                anyhow!("no token for {host}; pass --token or set GATEWAY_TOKEN, optionally with `connect --save-token`")
            })
    }

    fn open_store(&self) -> Result<MirrorStore> {
        let dir = self.config.data_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;
        let crypto = EncryptionService::new(Arc::clone(&self.secrets), SECRET_SERVICE);
        let path = self.config.database_path();
        MirrorStore::open(&path, Arc::new(crypto))
            .with_context(|| format!("failed to open local mirror {}", path.display()))
    }

    fn engine(&self) -> Result<SyncEngine> {
        let store = self.open_store()?;
        let connection = GatewayConnection::new(
            Arc::new(WebSocketConnector),
            self.config.connection_config()?,
        );
        Ok(SyncEngine::new(connection, store, SyncConfig::default()))
    }

    async fn online_engine(&self) -> Result<SyncEngine> {
        let credentials = self.credentials()?;
        let engine = self.engine()?;
        engine.connect(self.config.gateway_url.clone(), credentials);
        let session = wait_ready(&engine, self.ready_timeout()).await?;
        self.note_scheme_switch(&session);
        Ok(engine)
    }

    fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.config.connect_timeout_ms.saturating_mul(3))
    }

    fn note_scheme_switch(&self, session: &ProtocolSession) {
        let Some(switch) = &session.scheme_fallback else {
            return;
        };
        if !self.config.accept_scheme_fallback {
            warn!(
                target: "openagents.gateway",
                configured = %switch.from,
                working = %switch.to,
                "connected after switching scheme; rerun with --accept-fallback-url to save it"
            );
            return;
        }
        match persist_gateway_url(&self.config_path, switch.to.as_str()) {
            Ok(()) => info!(
                target: "openagents.gateway",
                url = %switch.to,
                path = %self.config_path.display(),
                "saved working gateway url"
            ),
            Err(error) => warn!(target: "openagents.gateway", %error, "failed to save working gateway url"),
        }
    }

    pub async fn connect(&self, save_token: bool) -> Result<()> {
        if save_token {
            let token = self
                .config
                .token
                .as_deref()
                .context("--save-token needs a token from --token or GATEWAY_TOKEN")?;
            let host = self.gateway_host()?;
            self.vault()
                .store_token(&host, token)
                .context("failed to save the gateway token")?;
            info!(target: "openagents.gateway", %host, "saved gateway token to the keyring");
        }

        let credentials = self.credentials()?;
        let engine = self.engine()?;
        let mut notices = engine.notices();
        let mut status = engine.supervisor().watch();
        let mut lifecycle = engine.connection().lifecycle();
        engine.connect(self.config.gateway_url.clone(), credentials);

        let mut last_banner: Option<ConnectionBanner> = None;
        loop {
            tokio::select! {
                signal = lifecycle.recv() => match signal {
                    Ok(LifecycleSignal::Ready(session)) => {
                        write_session(&session)?;
                        self.note_scheme_switch(&session);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let banner = engine.banner();
                    if last_banner.as_ref() != Some(&banner) {
                        write_banner(&banner)?;
                        last_banner = Some(banner);
                    }
                }
                notice = notices.recv() => match notice {
                    Ok(notice) => write_notice(&notice)?,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "openagents.mirror", skipped, "notice stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        engine.disconnect();
        finish(&engine).await
    }

    pub async fn send(
        &self,
        conversation: &str,
        text: &str,
        thinking: Option<String>,
        attachment_paths: &[PathBuf],
    ) -> Result<()> {
        let attachments = attachment_paths
            .iter()
            .map(|path| load_attachment(path))
            .collect::<Result<Vec<_>>>()?;
        let engine = self.online_engine().await?;
        let conversation_id = if conversation == "new" {
            engine
                .create_conversation(&title_from(text))
                .await
                .context("failed to create conversation")?
                .id
        } else {
            conversation.to_string()
        };

        let mut notices = engine.notices();
        let outcome = engine
            .send_chat(
                &conversation_id,
                text,
                SendOptions {
                    thinking,
                    attachments,
                },
            )
            .await
            .context("send failed")?;
        let mut out = io::stdout().lock();
        match &outcome {
            SendOutcome::Sent { message_id, run_id } => {
                info!(target: "openagents.gateway", %conversation_id, %message_id, %run_id, "message sent");
            }
            SendOutcome::Queued {
                message_id,
                position,
            } => {
                writeln!(out, "queued {message_id} at position {position}")?;
            }
        }
        drop(out);

        loop {
            tokio::select! {
                notice = notices.recv() => {
                    let notice = match notice {
                        Ok(notice) => notice,
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    };
                    if !notice_concerns(&notice, &conversation_id, &outcome) {
                        continue;
                    }
                    let mut out = io::stdout().lock();
                    match &notice {
                        SyncNotice::ReplyDelta { text, .. } => {
                            write!(out, "{text}")?;
                            out.flush()?;
                        }
                        SyncNotice::ReplyCommitted { message_id, interrupted, .. } => {
                            writeln!(out)?;
                            match interrupted {
                                Some(reason) => writeln!(out, "[{message_id} saved, {}]", reason.as_str())?,
                                None => writeln!(out, "[{message_id} saved]")?,
                            }
                            break;
                        }
                        SyncNotice::ReplyUnsaved { message_id, error, .. } => {
                            writeln!(out)?;
                            writeln!(out, "[{message_id} not saved: {error}]")?;
                            break;
                        }
                        SyncNotice::ReplyFailed { error, .. } => {
                            writeln!(out, "[reply failed: {}]", error.as_deref().unwrap_or("no content"))?;
                            break;
                        }
                        SyncNotice::QueuedSendDropped { reason, .. } => {
                            writeln!(out, "[queued send dropped: {reason}]")?;
                            break;
                        }
                        SyncNotice::QueuedSendDelivered { .. } => {}
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        engine.disconnect();
        finish(&engine).await
    }

    pub async fn conversations(&self) -> Result<()> {
        let engine = self.engine()?;
        let report = engine.conversations().await?;
        let mut out = io::stdout().lock();
        for entry in &report.conversations {
            let conversation = &entry.conversation;
            writeln!(
                out,
                "{}  {}  {:>4}  {}",
                conversation.id,
                conversation.updated_at.format("%Y-%m-%d %H:%M"),
                entry.messages.len(),
                conversation.title
            )?;
        }
        if !report.skipped.is_empty() {
            writeln!(
                out,
                "{} records could not be decrypted and were skipped",
                report.skipped.len()
            )?;
        }
        if report.legacy_fields > 0 {
            info!(
                target: "openagents.mirror",
                fields = report.legacy_fields,
                "unencrypted fields found; they are sealed on the next write"
            );
        }
        Ok(())
    }

    pub async fn show(&self, conversation: &str) -> Result<()> {
        let engine = self.engine()?;
        let Some(entry) = engine.conversation(conversation).await? else {
            bail!("no conversation {conversation}");
        };
        let mut out = io::stdout().lock();
        writeln!(out, "# {}", entry.conversation.title)?;
        for message in &entry.messages {
            writeln!(
                out,
                "\n[{} {}{}]",
                message.role.as_str(),
                message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                message
                    .interrupted
                    .map(|reason| format!(", {}", reason.as_str()))
                    .unwrap_or_default()
            )?;
            writeln!(out, "{}", message.content)?;
        }
        Ok(())
    }

    pub async fn search(&self, query: &str, conversation: Option<&str>) -> Result<()> {
        let engine = self.engine()?;
        let hits = engine.search(query, conversation).await?;
        let mut out = io::stdout().lock();
        for hit in &hits {
            match hit {
                SearchHit::Conversation {
                    conversation_id,
                    title,
                    ..
                } => writeln!(out, "{conversation_id}  conversation  {title}")?,
                SearchHit::Message {
                    conversation_id,
                    role,
                    content,
                    ..
                } => writeln!(
                    out,
                    "{conversation_id}  {}  {}",
                    role.as_str(),
                    snippet(content, 80)
                )?,
            }
        }
        if hits.is_empty() {
            writeln!(out, "no matches")?;
        }
        Ok(())
    }

    pub async fn delete(&self, conversation: &str) -> Result<()> {
        let engine = self.engine()?;
        if !engine.delete_conversation(conversation).await? {
            bail!("no conversation {conversation}");
        }
        writeln!(io::stdout().lock(), "deleted {conversation}")?;
        Ok(())
    }

    pub async fn models(&self) -> Result<()> {
        let engine = self.online_engine().await?;
        let models = engine.list_models().await.context("models.list failed")?;
        engine.disconnect();
        let mut out = io::stdout().lock();
        for model in &models {
            writeln!(
                out,
                "{}{}  {}  {}{}",
                if model.is_default { "* " } else { "  " },
                model.id,
                model.display_name(),
                model.provider,
                model
                    .context_window
                    .map(|window| format!("  {window} tokens"))
                    .unwrap_or_default()
            )?;
        }
        Ok(())
    }

    /// Local history cannot be read once the key is gone, so the database
    /// goes with it.
    pub fn forget_key(&self, confirmed: bool) -> Result<()> {
        if !confirmed {
            bail!("this deletes all local history; pass --yes-delete-all-local-history");
        }
        EncryptionService::new(Arc::clone(&self.secrets), SECRET_SERVICE)
            .delete_key()
            .context("failed to delete the master key")?;
        let database = self.config.database_path();
        for path in database_files(&database) {
            match fs::remove_file(&path) {
                Ok(()) => info!(target: "openagents.mirror", path = %path.display(), "removed"),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => {
                    return Err(error).with_context(|| format!("failed to remove {}", path.display()));
                }
            }
        }
        writeln!(io::stdout().lock(), "local history deleted")?;
        Ok(())
    }
}

/// Wait for `Ready`, giving up early when reconnection needs the user.
async fn wait_ready(engine: &SyncEngine, limit: Duration) -> Result<Arc<ProtocolSession>> {
    if let Ok(result) = tokio::time::timeout(limit, ready_or_halted(engine)).await {
        return result;
    }
    let banner = engine.banner();
    bail!(
        "timed out waiting for the gateway: {}{}",
        banner.headline,
        banner
            .detail
            .map(|detail| format!(" ({detail})"))
            .unwrap_or_default()
    )
}

async fn ready_or_halted(engine: &SyncEngine) -> Result<Arc<ProtocolSession>> {
    let mut state = engine.connection().watch_state();
    let mut status = engine.supervisor().watch();
    loop {
        let ready = state.borrow_and_update().is_ready();
        if ready {
            if let Some(session) = engine.connection().session() {
                return Ok(session);
            }
        }
        let halted = {
            let current = status.borrow_and_update();
            (current.phase == SupervisorPhase::Halted).then(|| {
                current.last_error.as_ref().map_or_else(
                    || "reconnection stopped".to_string(),
                    |failure| failure.user_message(),
                )
            })
        };
        if let Some(reason) = halted {
            bail!("cannot reach the gateway: {reason}");
        }
        tokio::select! {
            changed = state.changed() => changed.context("connection dropped")?,
            changed = status.changed() => changed.context("supervisor stopped")?,
        }
    }
}

async fn finish(engine: &SyncEngine) -> Result<()> {
    if engine.unsaved_replies().is_empty() {
        return Ok(());
    }
    let saved = engine.retry_unsaved().await.unwrap_or(0);
    let left = engine.unsaved_replies().len();
    if left > 0 {
        bail!("{left} replies could not be saved locally ({saved} saved on retry)");
    }
    Ok(())
}

fn notice_concerns(notice: &SyncNotice, conversation_id: &str, outcome: &SendOutcome) -> bool {
    match (notice, outcome) {
        (SyncNotice::ReplyDelta { run_id, .. }, SendOutcome::Sent { run_id: sent, .. }) => {
            run_id == sent
        }
        (SyncNotice::ReplyFailed { run_id, .. }, SendOutcome::Sent { run_id: sent, .. }) => {
            run_id == sent
        }
        (SyncNotice::ReplyDelta { conversation_id: id, .. }, _)
        | (SyncNotice::ReplyFailed { conversation_id: id, .. }, _)
        | (SyncNotice::ReplyCommitted { conversation_id: id, .. }, _)
        | (SyncNotice::ReplyUnsaved { conversation_id: id, .. }, _) => id == conversation_id,
        (SyncNotice::QueuedSendDelivered { message_id, .. }, SendOutcome::Queued { message_id: queued, .. })
        | (SyncNotice::QueuedSendDropped { message_id, .. }, SendOutcome::Queued { message_id: queued, .. }) => {
            message_id == queued
        }
        _ => false,
    }
}

fn write_session(session: &ProtocolSession) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(
        out,
        "connected to {} (server {}, protocol v{}{})",
        session.transport_url,
        session.server_version,
        session.negotiated_version,
        session
            .connection_id
            .as_deref()
            .map(|id| format!(", connection {id}"))
            .unwrap_or_default()
    )?;
    Ok(())
}

fn write_banner(banner: &ConnectionBanner) -> Result<()> {
    let mut out = io::stdout().lock();
    write!(out, "[{}]", banner.headline)?;
    if let Some(detail) = &banner.detail {
        write!(out, " {detail}")?;
    }
    if let Some(retry_in) = banner.retry_in {
        write!(out, " (retrying in {}s)", retry_in.as_secs())?;
    }
    writeln!(out)?;
    Ok(())
}

fn write_notice(notice: &SyncNotice) -> Result<()> {
    let mut out = io::stdout().lock();
    match notice {
        SyncNotice::ReplyDelta { .. } => {}
        SyncNotice::ReplyCommitted {
            conversation_id,
            message_id,
            interrupted,
        } => writeln!(
            out,
            "reply {message_id} saved in {conversation_id}{}",
            interrupted
                .map(|reason| format!(" ({})", reason.as_str()))
                .unwrap_or_default()
        )?,
        SyncNotice::ReplyUnsaved {
            message_id, error, ..
        } => writeln!(out, "reply {message_id} not saved: {error}")?,
        SyncNotice::ReplyFailed {
            conversation_id,
            error,
            ..
        } => writeln!(
            out,
            "reply in {conversation_id} failed: {}",
            error.as_deref().unwrap_or("no content")
        )?,
        SyncNotice::QueuedSendDelivered { message_id, .. } => {
            writeln!(out, "queued message {message_id} delivered")?;
        }
        SyncNotice::QueuedSendDropped { message_id, reason } => {
            writeln!(out, "queued message {message_id} dropped: {reason}")?;
        }
    }
    Ok(())
}

fn load_attachment(path: &Path) -> Result<Attachment> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Attachment {
        mime_type: mime_for(path),
        file_name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        content: STANDARD.encode(bytes),
    })
}

fn mime_for(path: &Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().essence_str().to_string()
}

fn title_from(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|line| !line.is_empty()).unwrap_or("New chat");
    snippet(line, TITLE_CHARS)
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

fn database_files(database: &Path) -> Vec<PathBuf> {
    let mut files = vec![database.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = database.as_os_str().to_owned();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use openagents_mirror_store::MemorySecretStore;
    use tempfile::TempDir;

    fn app_in(dir: &TempDir, secrets: Arc<dyn SecretStore>) -> App {
        let config = DesktopConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..DesktopConfig::default()
        };
        App {
            config,
            config_path: dir.path().join("gateway-desktop.toml"),
            secrets,
        }
    }

    #[test]
    fn titles_use_the_first_non_empty_line() {
        assert_eq!(title_from("\n  hello   there \nsecond"), "hello there");
        assert_eq!(title_from("   "), "New chat");
        let long = "word ".repeat(40);
        let title = title_from(&long);
        assert_eq!(title.chars().count(), TITLE_CHARS);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn attachments_are_base64_with_a_guessed_type() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("Notes.TXT");
        fs::write(&path, b"hi").expect("write");
        let attachment = load_attachment(&path).expect("attachment");
        assert_eq!(attachment.mime_type, "text/plain");
        assert_eq!(attachment.file_name.as_deref(), Some("Notes.TXT"));
        assert_eq!(attachment.content, "aGk=");
        assert_eq!(mime_for(Path::new("blob")), "application/octet-stream");
        assert_eq!(mime_for(Path::new("diagram.svg")), "image/svg+xml");
        assert_eq!(mime_for(Path::new("clip.mp4")), "video/mp4");
    }

    #[test]
    fn stored_token_is_used_when_none_is_configured() {
        let dir = TempDir::new().expect("tempdir");
        let app = app_in(&dir, Arc::new(MemorySecretStore::new()));
        assert!(app.credentials().is_err());
        app.vault().store_token("localhost", "from-keyring").expect("store");
        assert_eq!(
            app.credentials().expect("credentials"),
            Credentials::token("from-keyring")
        );
    }

    #[test]
    fn forget_key_needs_confirmation_and_removes_history() {
        let dir = TempDir::new().expect("tempdir");
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let app = app_in(&dir, Arc::clone(&secrets));
        drop(app.open_store().expect("store"));
        assert!(app.config.database_path().exists());

        assert!(app.forget_key(false).is_err());
        assert!(app.config.database_path().exists());

        app.forget_key(true).expect("forget");
        assert!(!app.config.database_path().exists());
        assert!(
            database_files(&app.config.database_path())
                .iter()
                .all(|path| !path.exists())
        );
    }

    #[test]
    fn notices_for_other_runs_are_ignored() {
        let sent = SendOutcome::Sent {
            message_id: "m1".to_string(),
            run_id: "run-1".to_string(),
        };
        let delta = |run: &str| SyncNotice::ReplyDelta {
            conversation_id: "c1".to_string(),
            run_id: run.to_string(),
            text: "x".to_string(),
        };
        assert!(notice_concerns(&delta("run-1"), "c1", &sent));
        assert!(!notice_concerns(&delta("run-2"), "c1", &sent));

        let committed = SyncNotice::ReplyCommitted {
            conversation_id: "c2".to_string(),
            message_id: "m9".to_string(),
            interrupted: None,
        };
        assert!(!notice_concerns(&committed, "c1", &sent));
    }
}
