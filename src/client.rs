//! Async handle over a [`FileManager`] running in its own task
//!
//! The task serializes transport events, caller commands, and one deadline
//! timer (request timeouts and chunk send retries). Callers talk to it through
//! a cloneable [`FileClient`].

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::classify::FileError;
use crate::correlator::{Reply, ReplyReceiver};
use crate::error::{OperationError, Result};
use crate::events::CompletedDownload;
use crate::manager::{file_content, search_results, ConnectionState, FileManager};
use crate::message::{parse_entries, FileEntry};
use crate::protocol::timeouts;
use crate::transport::EventReceiver;
use crate::upload::{UploadSource, UploadTask};

type Job = Box<dyn FnOnce(&mut FileManager, Instant) + Send>;

#[derive(Clone)]
pub struct FileClient {
    commands: mpsc::UnboundedSender<Job>,
}

async fn run(mut manager: FileManager, mut jobs: mpsc::UnboundedReceiver<Job>, mut events: EventReceiver) {
    let idle = Duration::from_millis(timeouts::IDLE_TICK_MS);
    let mut events_open = true;
    loop {
        let deadline = manager
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + idle);
        tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job(&mut manager, Instant::now()),
                None => break,
            },
            event = events.recv(), if events_open => match event {
                Some(event) => manager.handle_event(event, Instant::now()),
                None => events_open = false,
            },
            _ = tokio::time::sleep_until(deadline) => manager.on_deadline(Instant::now()),
        }
    }
    tracing::debug!("File client stopped");
    manager.disconnect();
}

async fn reply(rx: ReplyReceiver) -> Result<Reply> {
    rx.await.map_err(|_| OperationError::Closed)?
}

impl FileClient {
    /// Run `manager` on the current runtime, fed by the transport's event channel
    pub fn spawn(manager: FileManager, events: EventReceiver) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(manager, rx, events));
        (Self { commands: tx }, handle)
    }

    /// Run `f` inside the manager task and return its result
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FileManager, Instant) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |manager, now| {
            let _ = tx.send(f(manager, now));
        });
        self.commands.send(job).map_err(|_| OperationError::Closed)?;
        rx.await.map_err(|_| OperationError::Closed)
    }

    async fn listing(&self, rx: Result<ReplyReceiver>) -> Result<Vec<FileEntry>> {
        match reply(rx?).await? {
            Reply::Listing(entries) => Ok(entries),
            Reply::Response(body) => Ok(parse_entries(body.get("dir"))),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.call(|m, _| m.connect()).await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.call(|m, _| m.disconnect()).await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.call(|m, _| m.reconnect()).await?
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        self.call(|m, _| m.state()).await
    }

    /// Resolve once the tunnel is end-to-end, or fail after `timeout`
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state().await? {
                ConnectionState::ConnectedEndToEnd => return Ok(()),
                ConnectionState::Failed => return Err(OperationError::Disconnected),
                _ if Instant::now() >= deadline => return Err(OperationError::TimedOut),
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    }

    pub async fn current_path(&self) -> Result<String> {
        self.call(|m, _| m.current_path().to_string()).await
    }

    pub async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = path.to_string();
        let rx = self.call(move |m, now| m.list_directory(&path, now)).await?;
        self.listing(rx).await
    }

    pub async fn refresh(&self) -> Result<Vec<FileEntry>> {
        let rx = self.call(|m, now| m.refresh(now)).await?;
        self.listing(rx).await
    }

    pub async fn navigate_up(&self) -> Result<Vec<FileEntry>> {
        let rx = self.call(|m, now| m.navigate_up(now)).await?;
        self.listing(rx).await
    }

    pub async fn navigate_into(&self, name: &str) -> Result<Vec<FileEntry>> {
        let name = name.to_string();
        let rx = self.call(move |m, now| m.navigate_into(&name, now)).await?;
        self.listing(rx).await
    }

    pub async fn make_dir(&self, name: &str) -> Result<Vec<FileEntry>> {
        let name = name.to_string();
        let rx = self.call(move |m, now| m.make_dir(&name, now)).await?;
        self.listing(rx).await
    }

    pub async fn rename(&self, old_name: &str, new_name: &str) -> Result<Vec<FileEntry>> {
        let (old_name, new_name) = (old_name.to_string(), new_name.to_string());
        let rx = self
            .call(move |m, now| m.rename(&old_name, &new_name, now))
            .await?;
        self.listing(rx).await
    }

    pub async fn delete(&self, items: Vec<String>, recursive: bool) -> Result<Vec<FileEntry>> {
        let rx = self.call(move |m, now| m.delete(&items, recursive, now)).await?;
        self.listing(rx).await
    }

    pub async fn copy_files(&self, items: Vec<String>, destination: &str) -> Result<Vec<FileEntry>> {
        let destination = destination.to_string();
        let rx = self
            .call(move |m, now| m.copy_files(&items, &destination, now))
            .await?;
        self.listing(rx).await
    }

    pub async fn copy_from(&self, source: &str, items: Vec<String>) -> Result<Vec<FileEntry>> {
        let source = source.to_string();
        let rx = self.call(move |m, now| m.copy_from(&source, &items, now)).await?;
        self.listing(rx).await
    }

    pub async fn move_files(&self, items: Vec<String>, destination: &str) -> Result<Vec<FileEntry>> {
        let destination = destination.to_string();
        let rx = self
            .call(move |m, now| m.move_files(&items, &destination, now))
            .await?;
        self.listing(rx).await
    }

    pub async fn move_from(&self, source: &str, items: Vec<String>) -> Result<Vec<FileEntry>> {
        let source = source.to_string();
        let rx = self.call(move |m, now| m.move_from(&source, &items, now)).await?;
        self.listing(rx).await
    }

    pub async fn zip(&self, files: Vec<String>, zip_name: &str) -> Result<Vec<FileEntry>> {
        let zip_name = zip_name.to_string();
        let rx = self.call(move |m, now| m.zip(&files, &zip_name, now)).await?;
        self.listing(rx).await
    }

    pub async fn unzip(&self, zip_file: &str) -> Result<Vec<FileEntry>> {
        let zip_file = zip_file.to_string();
        let rx = self.call(move |m, now| m.unzip(&zip_file, now)).await?;
        self.listing(rx).await
    }

    pub async fn get_file(&self, name: &str) -> Result<Vec<u8>> {
        let name = name.to_string();
        let rx = self.call(move |m, now| m.get_file(&name, now)).await??;
        file_content(reply(rx).await?)
    }

    pub async fn set_file(&self, name: &str, content: Vec<u8>) -> Result<()> {
        let name = name.to_string();
        let rx = self
            .call(move |m, now| m.set_file(&name, &content, now))
            .await??;
        reply(rx).await.map(|_| ())
    }

    pub async fn search(&self, filter: &str) -> Result<Vec<FileEntry>> {
        let filter = filter.to_string();
        let rx = self.call(move |m, now| m.search(&filter, now)).await??;
        Ok(search_results(reply(rx).await?))
    }

    /// Upload into `remote_path` and wait for the agent to confirm it.
    /// The precheck hash is computed on the blocking pool, never in the
    /// manager task.
    pub async fn upload_to(
        &self,
        source: Box<dyn UploadSource>,
        remote_path: &str,
        check_hash: bool,
    ) -> Result<UploadTask> {
        let remote_path = remote_path.to_string();
        let (id, rx, job) = self
            .call(move |m, _| m.start_upload(source, &remote_path, check_hash))
            .await??;
        if let Some(job) = job {
            match tokio::task::spawn_blocking(move || job.run()).await {
                Ok(hashed) => self.call(move |m, now| m.finish_hash(hashed, now)).await?,
                Err(e) => {
                    let cancel_id = id.clone();
                    self.call(move |m, _| m.cancel_upload(&cancel_id)).await?;
                    return Err(OperationError::Io(format!("Hashing task failed: {}", e)));
                }
            }
        }
        tracing::debug!(id = %id, "Waiting for upload");
        rx.await.map_err(|_| OperationError::Closed)?
    }

    pub async fn upload(&self, source: Box<dyn UploadSource>, check_hash: bool) -> Result<UploadTask> {
        let path = self.current_path().await?;
        self.upload_to(source, &path, check_hash).await
    }

    pub async fn cancel_upload(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.call(move |m, _| m.cancel_upload(&id)).await
    }

    pub async fn retry_upload(&self, id: &str) -> Result<UploadTask> {
        let id = id.to_string();
        let rx = self.call(move |m, _| m.retry_upload(&id)).await??;
        rx.await.map_err(|_| OperationError::Closed)?
    }

    pub async fn uploads(&self) -> Result<Vec<UploadTask>> {
        self.call(|m, _| m.uploads()).await
    }

    pub async fn download(&self, remote_path: &str) -> Result<CompletedDownload> {
        let remote_path = remote_path.to_string();
        let (_, rx) = self
            .call(move |m, _| m.download(&remote_path, None, None))
            .await??;
        rx.await.map_err(|_| OperationError::Closed)?
    }

    pub async fn download_entry(&self, name: &str) -> Result<CompletedDownload> {
        let name = name.to_string();
        let (_, rx) = self.call(move |m, _| m.download_entry(&name)).await??;
        rx.await.map_err(|_| OperationError::Closed)?
    }

    pub async fn cancel_download(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.call(move |m, _| m.cancel_download(&id)).await
    }

    pub async fn active_download(&self) -> Result<Option<String>> {
        self.call(|m, _| m.active_download_id().map(str::to_string)).await
    }

    pub async fn error_history(&self) -> Result<Vec<FileError>> {
        self.call(|m, _| m.error_history()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::events::NoopEvents;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::{event_channel, TransportEvent, TunnelState};
    use crate::upload::{MemorySource, UploadStatus};
    use std::sync::Arc;

    fn spawn_client(config: ManagerConfig) -> (FileClient, MemoryTransport, crate::transport::EventSender) {
        let t = MemoryTransport::new(TunnelState::EndToEnd);
        let (tx, rx) = event_channel();
        let manager = FileManager::new(Box::new(t.clone()), config, Arc::new(NoopEvents));
        let (client, _handle) = FileClient::spawn(manager, rx);
        (client, t, tx)
    }

    async fn wait_for_sent(t: &MemoryTransport, n: usize) {
        for _ in 0..200 {
            if t.json_sent().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} sends, saw {:?}", n, t.json_sent());
    }

    #[tokio::test]
    async fn test_list_round_trip_through_actor() {
        let (client, t, events) = spawn_client(ManagerConfig::default());
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.list("/var").await }
        });
        wait_for_sent(&t, 1).await;
        let reqid = t.json_sent()[0]["reqid"].as_str().unwrap().to_string();
        events
            .send(TransportEvent::Text(format!(
                r#"{{"action":"ls","reqid":"{}","dir":[{{"n":"log","t":2}}]}}"#,
                reqid
            )))
            .unwrap();
        let entries = pending.await.unwrap().unwrap();
        assert_eq!(entries[0].name, "log");
        assert_eq!(client.current_path().await.unwrap(), "/var");
    }

    #[tokio::test]
    async fn test_timeout_fires_from_actor_timer() {
        let config = ManagerConfig {
            operation_timeout_ms: 30,
            ..ManagerConfig::default()
        };
        let (client, _t, _events) = spawn_client(config);
        let err = client.get_file("a.txt").await.unwrap_err();
        assert_eq!(err, OperationError::TimedOut);
    }

    #[tokio::test]
    async fn test_disconnect_fails_waiters() {
        let (client, t, events) = spawn_client(ManagerConfig::default());
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.search("*.txt").await }
        });
        wait_for_sent(&t, 1).await;
        events
            .send(TransportEvent::State(TunnelState::Disconnected))
            .unwrap();
        assert_eq!(pending.await.unwrap().unwrap_err(), OperationError::Disconnected);
        assert_eq!(client.state().await.unwrap(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_hashed_upload_hashes_off_the_manager_task() {
        let (client, t, events) = spawn_client(ManagerConfig::default());
        let pending = tokio::spawn({
            let client = client.clone();
            async move {
                let source = MemorySource::new("same.txt", b"identical".to_vec());
                client.upload_to(Box::new(source), "/docs", true).await
            }
        });
        wait_for_sent(&t, 1).await;
        let hash = t.json_sent()[0].clone();
        assert_eq!(hash["action"], "uploadhash");
        assert_eq!(hash["tag"]["hash"].as_str().unwrap().len(), 96);
        // manager stays responsive while the upload waits on the agent
        assert_eq!(client.uploads().await.unwrap()[0].status, UploadStatus::Hashing);

        events
            .send(TransportEvent::Text(format!(
                r#"{{"action":"uploadhash","reqid":"{}","exists":true}}"#,
                hash["reqid"].as_str().unwrap()
            )))
            .unwrap();
        let task = pending.await.unwrap().unwrap();
        assert_eq!(task.status, UploadStatus::Completed);
        assert!(t.binary_sent().is_empty());
    }
}
