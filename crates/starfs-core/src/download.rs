//! Download state machine (requester side)
//!
//! A transfer moves `Idle -> AwaitingMetadata -> Downloading -> Complete`.
//! Every chunk request carries a freshly mined token sized to the window it
//! asks for, and each window is keyed by its seed so the matching response can
//! be found again. The machine is transport-agnostic: it turns replies into the
//! next request and leaves sending to the caller.

use crate::error::StarfsError;
use crate::pow;
use crate::registry::char_len;
use starfs_types::{
    window_width, Address, DownloadRequest, FileInfo, FileRequest, Chunk, Reply, Request,
    RequestId, Response, Seed,
};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, error, info, warn};

/// Where a transfer for one file hash stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    AwaitingMetadata,
    Downloading,
    Complete,
}

/// One in-flight window and everything received before it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDownload {
    pub hash: String,
    pub address: Address,
    /// Work per character quoted by the server
    pub difficulty: u64,
    pub size: u64,
    /// Inclusive window currently requested
    pub start: u64,
    pub end: u64,
    pub content: String,
}

/// What the caller should do after a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Metadata arrived; send the first chunk request
    Started {
        hash: String,
        size: u64,
        request: Request,
    },
    /// A chunk arrived; send the next chunk request
    Received {
        hash: String,
        received: u64,
        size: u64,
        request: Request,
    },
    Complete {
        hash: String,
        content: String,
    },
    /// The server answered with an error
    Failed(String),
    /// Stale or duplicate response; nothing to do
    Discarded,
}

impl Progress {
    /// Next request to send, if any
    pub fn request(&self) -> Option<&Request> {
        match self {
            Progress::Started { request, .. } | Progress::Received { request, .. } => Some(request),
            _ => None,
        }
    }
}

/// A request the server has not answered yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outstanding {
    File(RequestId),
    Download(Seed),
}

/// Client-side session table for one connection
#[derive(Debug)]
pub struct Downloader {
    step: u64,
    next_id: RequestId,
    pending_files: HashMap<RequestId, String>,
    pending_downloads: HashMap<Seed, PendingDownload>,
    /// Replies arrive in request order; error replies are matched by position
    outstanding: VecDeque<Outstanding>,
    completed: HashSet<String>,
}

impl Downloader {
    pub fn new(step: u64) -> Self {
        Self {
            step: step.max(1),
            next_id: 1,
            pending_files: HashMap::new(),
            pending_downloads: HashMap::new(),
            outstanding: VecDeque::new(),
            completed: HashSet::new(),
        }
    }

    pub fn state(&self, hash: &str) -> TransferState {
        if self.pending_downloads.values().any(|d| d.hash == hash) {
            TransferState::Downloading
        } else if self.pending_files.values().any(|h| h == hash) {
            TransferState::AwaitingMetadata
        } else if self.completed.contains(hash) {
            TransferState::Complete
        } else {
            TransferState::Idle
        }
    }

    /// Window currently in flight for `hash`
    pub fn pending(&self, hash: &str) -> Option<&PendingDownload> {
        self.pending_downloads.values().find(|d| d.hash == hash)
    }

    /// Ask for a file's metadata
    pub fn get_file(&mut self, hash: &str) -> Request {
        let id = self.next_id;
        self.next_id += 1;
        self.pending_files.insert(id, hash.to_string());
        self.outstanding.push_back(Outstanding::File(id));
        debug!("Requesting metadata for {} (request {})", hash, id);
        Request::File(FileRequest {
            id,
            hash: hash.to_string(),
        })
    }

    fn answered(&mut self, request: Outstanding) {
        self.outstanding.retain(|pending| *pending != request);
    }

    fn fresh_seed(&self) -> Seed {
        loop {
            let seed = Seed(rand::random());
            if !self.pending_downloads.contains_key(&seed) {
                return seed;
            }
        }
    }

    /// Mine a token for `[start, end]` and build the chunk request.
    ///
    /// Without `existing` a new window is opened under a fresh seed; with it
    /// the window already registered under that seed is requested.
    #[allow(clippy::too_many_arguments)]
    pub async fn download_file(
        &mut self,
        hash: &str,
        address: &Address,
        difficulty: u64,
        size: u64,
        start: u64,
        end: u64,
        existing: Option<Seed>,
    ) -> Result<Request, StarfsError> {
        let seed = match existing {
            Some(seed) => seed,
            None => {
                let seed = self.fresh_seed();
                self.pending_downloads.insert(
                    seed,
                    PendingDownload {
                        hash: hash.to_string(),
                        address: address.clone(),
                        difficulty,
                        size,
                        start,
                        end,
                        content: String::new(),
                    },
                );
                seed
            }
        };

        let work = difficulty.saturating_mul(window_width(start, end));
        let token = match pow::mint_token(work, address.clone(), seed).await {
            Ok(token) => token,
            Err(e) => {
                self.pending_downloads.remove(&seed);
                return Err(e);
            }
        };
        self.outstanding.push_back(Outstanding::Download(seed));

        Ok(Request::Download(DownloadRequest {
            hash: hash.to_string(),
            start,
            end,
            seed,
            nonce: token.nonce,
            time: token.time,
        }))
    }

    /// Advance the state machine with one server reply
    pub async fn on_response(&mut self, reply: Reply) -> Result<Progress, StarfsError> {
        match reply {
            Reply::Error { error: message } => {
                error!("Server error: {}", message);
                match self.outstanding.pop_front() {
                    Some(Outstanding::File(id)) => {
                        self.pending_files.remove(&id);
                    }
                    Some(Outstanding::Download(seed)) => {
                        self.pending_downloads.remove(&seed);
                    }
                    None => {}
                }
                Ok(Progress::Failed(message))
            }
            Reply::Data {
                data: Response::File(info),
            } => self.on_metadata(info).await,
            Reply::Data {
                data: Response::Download(chunk),
            } => self.on_chunk(chunk).await,
        }
    }

    async fn on_metadata(&mut self, info: FileInfo) -> Result<Progress, StarfsError> {
        self.answered(Outstanding::File(info.id));
        let Some(hash) = self.pending_files.remove(&info.id) else {
            warn!("Unexpected file response for request {}", info.id);
            return Ok(Progress::Discarded);
        };

        info!(
            "File {}: {} chars, {} work/char, served by {}",
            hash,
            info.size,
            info.difficulty,
            info.address.short()
        );

        if info.size == 0 {
            self.completed.insert(hash.clone());
            return Ok(Progress::Complete {
                hash,
                content: String::new(),
            });
        }

        let end = self.step.min(info.size - 1);
        let request = self
            .download_file(&hash, &info.address, info.difficulty, info.size, 0, end, None)
            .await?;
        Ok(Progress::Started {
            hash,
            size: info.size,
            request,
        })
    }

    async fn on_chunk(&mut self, chunk: Chunk) -> Result<Progress, StarfsError> {
        self.answered(Outstanding::Download(chunk.seed));
        let Some(download) = self.pending_downloads.remove(&chunk.seed) else {
            warn!("Dropping chunk for unknown seed {}", chunk.seed);
            return Ok(Progress::Discarded);
        };

        let mut content = download.content;
        content.push_str(&chunk.content);

        let start = download.end + 1;
        if start >= download.size {
            info!("Download of {} complete ({} chars)", download.hash, char_len(&content));
            self.completed.insert(download.hash.clone());
            return Ok(Progress::Complete {
                hash: download.hash,
                content,
            });
        }
        let end = start.saturating_add(self.step).min(download.size - 1);

        let received = char_len(&content);
        let seed = self.fresh_seed();
        let next = PendingDownload {
            start,
            end,
            content,
            ..download
        };
        let (hash, address, difficulty, size) = (
            next.hash.clone(),
            next.address.clone(),
            next.difficulty,
            next.size,
        );
        self.pending_downloads.insert(seed, next);

        debug!("{}: {}/{} chars, next window [{}, {}]", hash, received, size, start, end);
        let request = self
            .download_file(&hash, &address, difficulty, size, start, end, Some(seed))
            .await?;
        Ok(Progress::Received {
            hash,
            received,
            size,
            request,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RequestHandler;
    use crate::ledger::Ledger;
    use crate::registry::{FileRegistry, DEMO_FILE_CONTENT, DEMO_FILE_HASH};
    use crate::signalling::LocalMesh;
    use starfs_types::NodeConfig;
    use std::sync::Arc;

    fn server(difficulty: u64) -> (RequestHandler, Ledger, NodeConfig) {
        let config = NodeConfig {
            address: Address::from("0xserver"),
            difficulty,
            ..NodeConfig::default()
        };
        let ledger = Ledger::new(&config);
        let registry = FileRegistry::with_demo_file();
        registry.register("empty", "");
        registry.register("tiny", "abc");
        registry.register("utf", "café crème brûlée");
        let mesh = LocalMesh::new();
        let handler = RequestHandler::new(
            &config,
            ledger.clone(),
            registry,
            Arc::new(mesh.join(config.address.clone())),
        );
        (handler, ledger, config)
    }

    /// Pass each request through the wire encoding to the handler and back
    async fn exchange(
        downloader: &mut Downloader,
        handler: &RequestHandler,
        request: &Request,
    ) -> Progress {
        let text = serde_json::to_string(request).unwrap();
        let reply = handler.handle_text(&text);
        let reply: Reply = serde_json::from_str(&serde_json::to_string(&reply).unwrap()).unwrap();
        downloader.on_response(reply).await.unwrap()
    }

    async fn fetch(
        downloader: &mut Downloader,
        handler: &RequestHandler,
        hash: &str,
    ) -> (String, Vec<(u64, u64)>) {
        let mut request = downloader.get_file(hash);
        let mut windows = Vec::new();
        loop {
            if let Request::Download(ref r) = request {
                windows.push((r.start, r.end));
            }
            match exchange(downloader, handler, &request).await {
                Progress::Complete { content, .. } => return (content, windows),
                progress => {
                    request = progress
                        .request()
                        .cloned()
                        .unwrap_or_else(|| panic!("transfer stalled: {:?}", progress));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_end_to_end_chunked_transfer() {
        let (handler, ledger, config) = server(3);
        let mut downloader = Downloader::new(8);

        let (content, windows) = fetch(&mut downloader, &handler, DEMO_FILE_HASH).await;

        assert_eq!(content, DEMO_FILE_CONTENT);
        let size = DEMO_FILE_CONTENT.len() as u64;
        assert_eq!(windows.first(), Some(&(0, 8)));
        assert_eq!(windows.get(1), Some(&(9, 17)));
        assert_eq!(windows.last().map(|w| w.1), Some(size - 1));
        for pair in windows.windows(2) {
            assert_eq!(pair[1].0, pair[0].1 + 1, "gap or overlap between windows");
        }
        assert_eq!(downloader.state(DEMO_FILE_HASH), TransferState::Complete);

        // every byte was paid for at the quoted rate
        assert_eq!(ledger.balance(&config.address), Some(3 * size as u128));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (handler, _, _) = server(1);
        let mut downloader = Downloader::new(8);
        assert_eq!(downloader.state(DEMO_FILE_HASH), TransferState::Idle);

        let request = downloader.get_file(DEMO_FILE_HASH);
        assert_eq!(downloader.state(DEMO_FILE_HASH), TransferState::AwaitingMetadata);

        let progress = exchange(&mut downloader, &handler, &request).await;
        assert!(matches!(progress, Progress::Started { size: 40, .. }));
        assert_eq!(downloader.state(DEMO_FILE_HASH), TransferState::Downloading);
        let pending = downloader.pending(DEMO_FILE_HASH).unwrap();
        assert_eq!((pending.start, pending.end), (0, 8));
    }

    #[tokio::test]
    async fn test_small_and_empty_files() {
        let (handler, _, _) = server(1);
        let mut downloader = Downloader::new(8);

        let (content, windows) = fetch(&mut downloader, &handler, "tiny").await;
        assert_eq!(content, "abc");
        assert_eq!(windows, vec![(0, 2)]);

        let (content, windows) = fetch(&mut downloader, &handler, "empty").await;
        assert_eq!(content, "");
        assert!(windows.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_seed_is_discarded() {
        let mut downloader = Downloader::new(8);
        let progress = downloader
            .on_response(Reply::data(Response::Download(Chunk {
                seed: Seed(99),
                content: "zz".to_string(),
            })))
            .await
            .unwrap();
        assert_eq!(progress, Progress::Discarded);
    }

    #[tokio::test]
    async fn test_unexpected_metadata_is_discarded() {
        let mut downloader = Downloader::new(8);
        let progress = downloader
            .on_response(Reply::data(Response::File(FileInfo {
                id: 42,
                difficulty: 1,
                address: Address::from("0xserver"),
                size: 10,
            })))
            .await
            .unwrap();
        assert_eq!(progress, Progress::Discarded);
    }

    #[tokio::test]
    async fn test_server_error_surfaces() {
        let (handler, _, _) = server(1);
        let mut downloader = Downloader::new(8);
        let request = downloader.get_file("missing");
        let progress = exchange(&mut downloader, &handler, &request).await;
        assert_eq!(progress, Progress::Failed("file not found".to_string()));
    }

    #[test]
    fn test_request_ids_are_monotonic() {
        let mut downloader = Downloader::new(8);
        let ids: Vec<RequestId> = (0..3)
            .map(|_| match downloader.get_file("x") {
                Request::File(r) => r.id,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_multibyte_file_transfers_by_character() {
        let (handler, ledger, config) = server(1);
        let mut downloader = Downloader::new(8);

        let (content, windows) = fetch(&mut downloader, &handler, "utf").await;

        assert_eq!(content, "café crème brûlée");
        assert_eq!(windows, vec![(0, 8), (9, 16)]);
        assert_eq!(ledger.balance(&config.address), Some(17));
    }

    #[tokio::test]
    async fn test_error_reply_clears_pending_window() {
        let (handler, _, _) = server(1);
        let mut downloader = Downloader::new(8);
        let request = downloader.get_file(DEMO_FILE_HASH);
        exchange(&mut downloader, &handler, &request).await;
        assert_eq!(downloader.state(DEMO_FILE_HASH), TransferState::Downloading);

        let progress = downloader
            .on_response(Reply::error("out of range"))
            .await
            .unwrap();
        assert_eq!(progress, Progress::Failed("out of range".to_string()));
        assert!(downloader.pending(DEMO_FILE_HASH).is_none());
        assert_eq!(downloader.state(DEMO_FILE_HASH), TransferState::Idle);
    }

    #[tokio::test]
    async fn test_failed_metadata_request_is_forgotten() {
        let (handler, _, _) = server(1);
        let mut downloader = Downloader::new(8);
        let request = downloader.get_file("missing");
        exchange(&mut downloader, &handler, &request).await;
        assert_eq!(downloader.state("missing"), TransferState::Idle);
    }

    #[tokio::test]
    async fn test_huge_step_clamps_window() {
        let (handler, _, _) = server(1);
        let mut downloader = Downloader::new(u64::MAX);

        let (content, windows) = fetch(&mut downloader, &handler, DEMO_FILE_HASH).await;
        assert_eq!(content, DEMO_FILE_CONTENT);
        assert_eq!(windows, vec![(0, DEMO_FILE_CONTENT.len() as u64 - 1)]);
    }

    #[tokio::test]
    async fn test_step_overflow_on_advance() {
        let (handler, _, _) = server(1);
        let mut downloader = Downloader::new(u64::MAX);
        // the second window starts at 1, so start + step would wrap
        let size = 3;
        let request = tokio_test::assert_ok!(
            downloader
                .download_file("tiny", &Address::from("0xserver"), 1, size, 0, 0, None)
                .await
        );
        let reply = handler.handle_text(&serde_json::to_string(&request).unwrap());
        let progress = tokio_test::assert_ok!(downloader.on_response(reply).await);
        match progress {
            Progress::Received { request: Request::Download(next), .. } => {
                assert_eq!((next.start, next.end), (1, 2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
