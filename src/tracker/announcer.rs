//! Periodic announces of a single torrent.

use futures::future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::{Announce, Tracker, TrackerRequest};
use crate::error::Result;
use crate::util::until_cancelled;

/// The outcome of one announce.
#[derive(Debug)]
pub struct AnnounceResult {
    pub url: String,
    pub result: Result<Announce>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    uploaded: u64,
    downloaded: u64,
    left: u64,
}

/// Announces a torrent to each of its trackers, and again whenever the
/// interval a tracker asked for has passed.
#[derive(Debug)]
pub struct Announcer {
    progress: watch::Sender<Progress>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Announcer {
    /// Wait after a failed announce or a tracker without an interval.
    pub const RETRY_INTERVAL: Duration = Duration::from_secs(30 * 60);

    /// One task per tracker. The event of `request` is only sent until a
    /// tracker accepted it.
    pub fn spawn(
        trackers: Vec<Tracker>,
        request: TrackerRequest,
        results: mpsc::Sender<AnnounceResult>,
    ) -> Self {
        Self::spawn_with_retry(trackers, request, results, Self::RETRY_INTERVAL)
    }

    pub fn spawn_with_retry(
        trackers: Vec<Tracker>,
        request: TrackerRequest,
        results: mpsc::Sender<AnnounceResult>,
        retry: Duration,
    ) -> Self {
        let (progress, watcher) = watch::channel(Progress {
            uploaded: request.uploaded,
            downloaded: request.downloaded,
            left: request.left,
        });
        let shutdown = CancellationToken::new();
        let tasks = trackers
            .into_iter()
            .map(|tracker| {
                tokio::spawn(announce_loop(
                    tracker,
                    request.clone(),
                    watcher.clone(),
                    results.clone(),
                    shutdown.clone(),
                    retry,
                ))
            })
            .collect();
        Self {
            progress,
            shutdown,
            tasks,
        }
    }

    /// Totals reported by the following announces.
    pub fn set_progress(&self, uploaded: u64, downloaded: u64, left: u64) {
        let _ = self.progress.send(Progress {
            uploaded,
            downloaded,
            left,
        });
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for result in future::join_all(self.tasks).await {
            if let Err(err) = result {
                error!("Announce task failed: {}", err);
            }
        }
    }
}

async fn announce_loop(
    tracker: Tracker,
    mut request: TrackerRequest,
    progress: watch::Receiver<Progress>,
    results: mpsc::Sender<AnnounceResult>,
    shutdown: CancellationToken,
    retry: Duration,
) {
    loop {
        let Progress {
            uploaded,
            downloaded,
            left,
        } = *progress.borrow();
        request = request.with_progress(uploaded, downloaded, left);

        let result = match until_cancelled(&shutdown, tracker.announce(&request)).await {
            Some(result) => result,
            None => break,
        };
        let wait = match &result {
            Ok(announce) => {
                request.event = None;
                if announce.interval.is_zero() {
                    retry
                } else {
                    announce.interval
                }
            }
            Err(err) => {
                warn!("Announce to {} failed: {}", tracker.url(), err);
                retry
            }
        };
        let result = AnnounceResult {
            url: tracker.url().to_string(),
            result,
        };
        if !matches!(until_cancelled(&shutdown, results.send(result)).await, Some(Ok(()))) {
            break;
        }
        trace!("Next announce to {} in {:?}", tracker.url(), wait);
        if until_cancelled(&shutdown, time::sleep(wait)).await.is_none() {
            break;
        }
    }
    debug!("Stopped announcing to {}", tracker.url());
}
