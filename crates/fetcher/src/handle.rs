use crate::error::{FetchError, Result};
use crate::peer::{PeerLink, PeerRegistry};
use crate::stream::ReadStream;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type BlockOutcome = Result<Bytes>;

/// Completion marker of an in-flight fetch. Holds `None` until the fetch ends.
type Marker = watch::Receiver<Option<BlockOutcome>>;

enum BlockSlot {
    Absent,
    InFlight(Marker),
    Present(Bytes),
    Failed(FetchError),
}

impl BlockSlot {
    /// Whether a reader needing this block has to start a fetch for it.
    fn needs_fetch(&self) -> bool {
        match self {
            BlockSlot::Absent | BlockSlot::Failed(_) => true,
            // The fetch task went away without reporting back.
            BlockSlot::InFlight(marker) => marker.has_changed().is_err(),
            BlockSlot::Present(_) => false,
        }
    }
}

enum Pending {
    Ready(Bytes),
    Waiting(Marker),
}

#[derive(Debug, Default)]
struct HandleStats {
    fetches_started: AtomicU64,
    fetches_failed: AtomicU64,
    prefetches_started: AtomicU64,
    blocks_evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStatsSnapshot {
    pub fetches_started: u64,
    pub fetches_failed: u64,
    pub prefetches_started: u64,
    pub blocks_evicted: u64,
}

pub(crate) struct HandleOptions {
    pub block_size: usize,
    pub prefetch_blocks: usize,
    pub rank_peers_by_latency: bool,
    pub fetch_permits: Option<Arc<Semaphore>>,
    pub shutdown: CancellationToken,
}

struct HandleInner {
    hash: String,
    size: u64,
    peers: Vec<String>,
    registry: Arc<PeerRegistry>,
    options: HandleOptions,
    slots: Mutex<Vec<BlockSlot>>,
    stats: HandleStats,
}

/// One piece of remote content and its in-memory block cache.
///
/// Cloning is cheap and every clone shares the same cache.
#[derive(Clone)]
pub struct ContentHandle {
    inner: Arc<HandleInner>,
}

impl ContentHandle {
    pub(crate) fn new(
        hash: String,
        size: u64,
        peers: Vec<String>,
        registry: Arc<PeerRegistry>,
        options: HandleOptions,
    ) -> Self {
        // One slot more than strictly needed when size is a block multiple.
        let blocks = (size / options.block_size as u64) as usize + 1;
        let slots = (0..blocks).map(|_| BlockSlot::Absent).collect();
        Self {
            inner: Arc::new(HandleInner {
                hash,
                size,
                peers,
                registry,
                options,
                slots: Mutex::new(slots),
                stats: HandleStats::default(),
            }),
        }
    }

    pub fn hash(&self) -> &str {
        &self.inner.hash
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn block_size(&self) -> usize {
        self.inner.options.block_size
    }

    pub fn peers(&self) -> &[String] {
        &self.inner.peers
    }

    pub fn block_count(&self) -> usize {
        self.inner.slots().len()
    }

    pub fn is_cached(&self, block: usize) -> bool {
        matches!(self.inner.slots().get(block), Some(BlockSlot::Present(_)))
    }

    pub fn is_fetching(&self, block: usize) -> bool {
        matches!(
            self.inner.slots().get(block),
            Some(slot @ BlockSlot::InFlight(_)) if !slot.needs_fetch()
        )
    }

    /// Error from the last failed fetch of `block`, until a read retries it.
    pub fn block_error(&self, block: usize) -> Option<FetchError> {
        match self.inner.slots().get(block) {
            Some(BlockSlot::Failed(err)) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn stats(&self) -> HandleStatsSnapshot {
        let stats = &self.inner.stats;
        HandleStatsSnapshot {
            fetches_started: stats.fetches_started.load(Ordering::Relaxed),
            fetches_failed: stats.fetches_failed.load(Ordering::Relaxed),
            prefetches_started: stats.prefetches_started.load(Ordering::Relaxed),
            blocks_evicted: stats.blocks_evicted.load(Ordering::Relaxed),
        }
    }

    /// Reads `[offset, offset + size)`, clipped to the content size.
    ///
    /// The result may be shorter than `size` at end of content. Fetches started
    /// here keep running if `cancel` fires; later reads reuse their blocks.
    pub async fn read(&self, cancel: &CancellationToken, offset: u64, size: usize) -> Result<Bytes> {
        let inner = &self.inner;
        if offset >= inner.size || size == 0 {
            return Ok(Bytes::new());
        }
        let bs = inner.options.block_size as u64;
        let end = offset.saturating_add(size as u64).min(inner.size);
        let first = offset / bs;
        let last = (end - 1) / bs;
        debug!(hash = %inner.hash, first, last, "Read covers blocks");

        let pending = {
            let mut slots = inner.slots();
            let mut pending = Vec::with_capacity((last - first + 1) as usize);
            for block in first..=last {
                let index = block as usize;
                let ready = match &slots[index] {
                    BlockSlot::Present(data) => Some(Pending::Ready(data.clone())),
                    slot @ BlockSlot::InFlight(marker) if !slot.needs_fetch() => {
                        Some(Pending::Waiting(marker.clone()))
                    }
                    _ => None,
                };
                pending.push(match ready {
                    Some(entry) => entry,
                    None => Pending::Waiting(inner.fetch_block(&mut slots, index)),
                });
            }

            // Drop the block behind the read window; sequential readers never return to it.
            if first > 0 {
                let behind = (first - 1) as usize;
                if matches!(slots[behind], BlockSlot::Present(_)) {
                    slots[behind] = BlockSlot::Absent;
                    inner.stats.blocks_evicted.fetch_add(1, Ordering::Relaxed);
                    debug!(hash = %inner.hash, block = behind, "Evicted block behind read window");
                }
            }

            for ahead in 1..=inner.options.prefetch_blocks as u64 {
                let block = last + ahead;
                if block * bs >= inner.size {
                    break;
                }
                let index = block as usize;
                if slots[index].needs_fetch() {
                    inner.stats.prefetches_started.fetch_add(1, Ordering::Relaxed);
                    inner.fetch_block(&mut slots, index);
                }
            }
            pending
        };

        let waiting = pending
            .iter()
            .filter(|p| matches!(p, Pending::Waiting(_)))
            .count();
        debug!(hash = %inner.hash, missing = waiting, "Waiting for blocks");

        let mut bufs = Vec::with_capacity(pending.len());
        for entry in pending {
            match entry {
                Pending::Ready(data) => bufs.push(data),
                Pending::Waiting(marker) => {
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Interrupted),
                        _ = inner.options.shutdown.cancelled() => return Err(FetchError::Interrupted),
                        outcome = wait_for_block(marker) => outcome,
                    };
                    bufs.push(outcome?);
                }
            }
        }

        Ok(assemble(bufs, offset - first * bs, end - first * bs, bs))
    }

    /// Sequential reader starting at `offset`, with its own cancellation scope.
    pub fn stream(&self, offset: u64) -> ReadStream {
        let cancel = self.inner.options.shutdown.child_token();
        ReadStream::new(self.clone(), offset, cancel)
    }

    /// Releases this reference. Blocks stay cached while other clones live.
    pub fn close(self) {}
}

impl std::fmt::Debug for ContentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentHandle")
            .field("hash", &self.inner.hash)
            .field("size", &self.inner.size)
            .field("peers", &self.inner.peers)
            .finish()
    }
}

impl ContentHandle {
    pub(crate) fn downgrade(&self) -> WeakContentHandle {
        WeakContentHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

#[derive(Clone)]
pub(crate) struct WeakContentHandle {
    inner: std::sync::Weak<HandleInner>,
}

impl WeakContentHandle {
    pub(crate) fn upgrade(&self) -> Option<ContentHandle> {
        self.inner.upgrade().map(|inner| ContentHandle { inner })
    }

    pub(crate) fn is_live(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl HandleInner {
    fn slots(&self) -> MutexGuard<'_, Vec<BlockSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the single fetch for `index`. Caller holds the slot lock and has
    /// checked that no live fetch exists.
    fn fetch_block(self: &Arc<Self>, slots: &mut [BlockSlot], index: usize) -> Marker {
        let (done, marker) = watch::channel(None);
        slots[index] = BlockSlot::InFlight(marker.clone());
        self.stats.fetches_started.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = inner.fetch_from_peers(index).await;
            {
                let mut slots = inner.slots();
                slots[index] = match &outcome {
                    Ok(data) => BlockSlot::Present(data.clone()),
                    Err(err) => {
                        inner.stats.fetches_failed.fetch_add(1, Ordering::Relaxed);
                        BlockSlot::Failed(err.clone())
                    }
                };
            }
            done.send_replace(Some(outcome));
            debug!(hash = %inner.hash, block = index, "Processed block");
        });
        marker
    }

    async fn fetch_from_peers(&self, index: usize) -> BlockOutcome {
        let _permit = match &self.options.fetch_permits {
            Some(permits) => Some(
                Arc::clone(permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| self.fetch_error(index, "fetcher shut down"))?,
            ),
            None => None,
        };

        let offset = index as u64 * self.options.block_size as u64;
        let links = self.candidate_links();
        if links.is_empty() {
            return Err(self.fetch_error(index, "no connected peer holds this content"));
        }

        let mut last_err = None;
        for link in links {
            match link.read_block(&self.hash, offset, self.options.block_size).await {
                Ok(data) => {
                    debug!(hash = %self.hash, block = index, peer = %link.ident(), len = data.len(), "Fetched block");
                    return Ok(data);
                }
                Err(err) => {
                    warn!(hash = %self.hash, block = index, peer = %link.ident(), error = %err, "Block read failed, trying next peer");
                    last_err = Some(err);
                }
            }
        }
        let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
        Err(self.fetch_error(index, reason))
    }

    /// Registered links for the candidate peers, in fetch order.
    fn candidate_links(&self) -> Vec<Arc<PeerLink>> {
        let mut links: Vec<Arc<PeerLink>> = self
            .peers
            .iter()
            .filter_map(|ident| self.registry.lookup(ident))
            .collect();
        if self.options.rank_peers_by_latency {
            // Stable, so equal or unmeasured peers keep list order; unmeasured go last.
            links.sort_by_key(|link| (link.latency().is_none(), link.latency()));
        }
        links
    }

    fn fetch_error(&self, index: usize, reason: impl Into<String>) -> FetchError {
        FetchError::Fetch {
            hash: self.hash.clone(),
            block: index as u64,
            reason: reason.into(),
        }
    }
}

async fn wait_for_block(mut marker: Marker) -> BlockOutcome {
    let abandoned = || FetchError::Protocol("block fetch abandoned before completing".to_string());
    match marker.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).clone().unwrap_or_else(|| Err(abandoned())),
        Err(_) => Err(abandoned()),
    }
}

/// Joins block buffers and trims them to the requested window.
///
/// `head` is the offset of the first wanted byte inside the first block and
/// `tail` the end of the window relative to the first block's start. The tail
/// is cut only when it falls strictly inside a block.
fn assemble(mut bufs: Vec<Bytes>, head: u64, tail: u64, bs: u64) -> Bytes {
    let cut = (tail % bs) as usize;
    if cut > 0 {
        if let Some(last) = bufs.last_mut() {
            if last.len() > cut {
                last.truncate(cut);
            }
        }
    }
    if head > 0 {
        if let Some(first) = bufs.first_mut() {
            let head = (head as usize).min(first.len());
            *first = first.slice(head..);
        }
    }

    if bufs.len() == 1 {
        return bufs.pop().unwrap_or_default();
    }
    let total = bufs.iter().map(Bytes::len).sum();
    let mut out = BytesMut::with_capacity(total);
    for buf in &bufs {
        out.extend_from_slice(buf);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(data: &[u8], bs: usize) -> Vec<Bytes> {
        data.chunks(bs).map(Bytes::copy_from_slice).collect()
    }

    #[test]
    fn assemble_single_block_is_a_slice() {
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let bufs = blocks(&data[..4096], 4096);
        let out = assemble(bufs, 0, 10, 4096);
        assert_eq!(&out[..], &data[..10]);
    }

    #[test]
    fn assemble_spans_block_boundary() {
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let bufs = blocks(&data, 4096);
        let out = assemble(bufs, 4090, 4110, 4096);
        assert_eq!(&out[..], &data[4090..4110]);
    }

    #[test]
    fn assemble_leaves_aligned_tail_untrimmed() {
        let data = vec![7u8; 8192];
        let mut bufs = blocks(&data, 4096);
        // An over-long final block on an aligned end is passed through.
        let mut long = bufs[1].to_vec();
        long.extend_from_slice(&[1, 2, 3]);
        bufs[1] = Bytes::from(long);
        let out = assemble(bufs, 0, 8192, 4096);
        assert_eq!(out.len(), 8192 + 3);
    }

    #[test]
    fn assemble_tolerates_short_first_block() {
        let out = assemble(vec![Bytes::from_static(b"abc")], 10, 12, 4096);
        assert!(out.is_empty());
    }
}
