//! The paging store of one address.
//!
//! ## State machine
//!
//! ```text
//!   not-paging ──(usage over max_size, Page policy)──▶ paging
//!       ▲                                                 │
//!       └──(every paged message depaged and usage below ──┘
//!           max_size - hysteresis)
//! ```
//!
//! While paging, every send is written to the current page file, even
//! when memory has freed up in the meantime, so messages depage in exactly
//! the order they were sent.
//!
//! ## Locking
//!
//! - `flow`: the send path (usage accounting, paging transitions, page
//!   writes); blocked producers wait on its condition variable
//! - `writer`: the current page and page id sequence
//! - `reader`: the depage cursor
//! - `pages`: the page set, held only to look up, insert or remove a page
//!
//! Locks are taken in the order `flow`, `writer`, `reader`, `pages`, and a
//! page's own state lock last. Depage never takes `flow` while it holds
//! `reader`.

use crate::error::{PagingError, PagingResult};
use crate::page::{
    encode_frame, page_file_name, parse_page_file_name, scan_page, FrameError, PageFile,
    PageState, FRAME_OVERHEAD, PAGE_EXTENSION,
};
use crate::settings::{decide, AddressFullPolicy, AddressSettings, FlowDecision};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use sluice_storage::{FileFactory, StorageBackend};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Where a paged message lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PagePosition {
    /// Page file id.
    pub page_id: u64,
    /// Index of the message within the page.
    pub index: u64,
    /// Byte offset of the message within the page.
    pub offset: u64,
}

/// A message read back from a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepagedMessage {
    /// Where the message was stored; pass it to [`PagingStore::ack`] once
    /// delivered.
    pub position: PagePosition,
    /// The message bytes.
    pub payload: Bytes,
}

/// What [`PagingStore::route`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Accepted in memory; its size was added to the address usage.
    InMemory,
    /// Written to a page file.
    Paged(PagePosition),
    /// Discarded under the `Drop` policy.
    Dropped,
}

/// Paging status of one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressStatus {
    /// The address.
    pub address: String,
    /// Whether new sends go to page files.
    pub paging: bool,
    /// Messages paged and not depaged yet.
    pub paged_messages: u64,
    /// Payload bytes paged and not depaged yet.
    pub paged_bytes: u64,
    /// Page files on disk.
    pub page_count: usize,
    /// In-memory usage reported by the broker.
    pub memory_bytes: u64,
}

struct Flow {
    usage: u64,
}

struct WriteCursor {
    current: Option<Arc<PageFile>>,
    next_page_id: u64,
}

struct ReadCursor {
    page_id: u64,
    index: u64,
    offset: u64,
}

/// Spills the messages of one address to page files while the address is
/// over its memory ceiling.
pub struct PagingStore {
    address: String,
    factory: Arc<dyn FileFactory>,
    settings: RwLock<AddressSettings>,
    sync_on_write: bool,
    paging: AtomicBool,
    flow: Mutex<Flow>,
    changed: Condvar,
    writer: Mutex<WriteCursor>,
    reader: Mutex<ReadCursor>,
    pages: Mutex<BTreeMap<u64, Arc<PageFile>>>,
    paged_messages: AtomicU64,
    paged_bytes: AtomicU64,
    failure: Mutex<Option<String>>,
}

impl PagingStore {
    /// Opens the store of `address` over the files of `factory`.
    ///
    /// Existing pages are scanned in id order. A torn final message in the
    /// last page is cut off; damage anywhere else is
    /// [`PagingError::CorruptPage`]. A store with pages on disk opens in
    /// paging mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid, a page is corrupt or
    /// a file operation fails.
    pub fn open(
        address: impl Into<String>,
        factory: Arc<dyn FileFactory>,
        settings: AddressSettings,
    ) -> PagingResult<Self> {
        settings.validate()?;
        let address = address.into();

        let mut images = Vec::new();
        for name in factory.list(PAGE_EXTENSION)? {
            let Some(id) = parse_page_file_name(&name) else {
                continue;
            };
            let backend = factory.open(&name)?;
            if backend.is_empty()? {
                drop(backend);
                factory.delete(&name)?;
                continue;
            }
            let page = PageFile::new(id, backend, PageState::default());
            let data = page.read_all()?;
            images.push((page, data));
        }

        let mut pages = BTreeMap::new();
        let mut paged_messages = 0;
        let mut paged_bytes = 0;
        let count = images.len();
        for (position, (page, data)) in images.into_iter().enumerate() {
            let is_last = position + 1 == count;
            let scan = scan_page(&data);
            if let Some((offset, damage)) = scan.damage {
                let at_end = match damage {
                    FrameError::Truncated => true,
                    FrameError::Checksum { frame_len } => {
                        offset as usize + frame_len == data.len()
                    }
                };
                if !(is_last && at_end) {
                    return Err(PagingError::corrupt_page(page.id, offset, damage.reason()));
                }
                page.truncate(offset)?;
                warn!(address = %address, page_id = page.id, offset, "dropped torn message at page tail");
            }

            {
                let mut state = page.state.lock();
                state.size = scan.valid_len;
                state.written = scan.messages;
                state.sealed = !is_last;
            }
            paged_messages += scan.messages;
            paged_bytes += scan.valid_len - scan.messages * FRAME_OVERHEAD as u64;
            pages.insert(page.id, Arc::new(page));
        }

        let first = pages.keys().next().copied().unwrap_or(1);
        let current = pages.values().next_back().cloned();
        let next_page_id = current.as_ref().map_or(1, |page| page.id + 1);
        let paging = !pages.is_empty();
        if paging {
            info!(
                address = %address,
                pages = pages.len(),
                messages = paged_messages,
                "paging store reopened in paging mode"
            );
        }

        Ok(Self {
            address,
            factory,
            settings: RwLock::new(settings),
            sync_on_write: true,
            paging: AtomicBool::new(paging),
            flow: Mutex::new(Flow { usage: 0 }),
            changed: Condvar::new(),
            writer: Mutex::new(WriteCursor {
                current,
                next_page_id,
            }),
            reader: Mutex::new(ReadCursor {
                page_id: first,
                index: 0,
                offset: 0,
            }),
            pages: Mutex::new(pages),
            paged_messages: AtomicU64::new(paged_messages),
            paged_bytes: AtomicU64::new(paged_bytes),
            failure: Mutex::new(None),
        })
    }

    /// Sets whether each page write is synced to disk.
    #[must_use]
    pub fn sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Returns the address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns a copy of the current settings.
    #[must_use]
    pub fn settings(&self) -> AddressSettings {
        self.settings.read().clone()
    }

    /// Replaces the settings.
    ///
    /// # Errors
    ///
    /// Returns [`PagingError::InvalidArgument`] if the settings are invalid.
    pub fn set_settings(&self, settings: AddressSettings) -> PagingResult<()> {
        settings.validate()?;
        *self.settings.write() = settings;
        self.changed.notify_all();
        self.maybe_exit_paging();
        Ok(())
    }

    /// Returns whether new sends go to page files.
    #[must_use]
    pub fn is_paging(&self) -> bool {
        self.paging.load(Ordering::Acquire)
    }

    /// Returns whether a page write failure has stopped the store.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Returns the in-memory usage reported by the broker.
    #[must_use]
    pub fn usage(&self) -> u64 {
        self.flow.lock().usage
    }

    /// Returns the number of messages paged and not depaged yet.
    #[must_use]
    pub fn paged_messages(&self) -> u64 {
        self.paged_messages.load(Ordering::Acquire)
    }

    /// Returns the number of page files.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Returns the status of this address.
    #[must_use]
    pub fn status(&self) -> AddressStatus {
        AddressStatus {
            address: self.address.clone(),
            paging: self.is_paging(),
            paged_messages: self.paged_messages(),
            paged_bytes: self.paged_bytes.load(Ordering::Acquire),
            page_count: self.page_count(),
            memory_bytes: self.usage(),
        }
    }

    /// Routes one send according to the address policy.
    ///
    /// # Errors
    ///
    /// - [`PagingError::AddressFull`] under the `Fail` policy
    /// - [`PagingError::Timeout`] when a `Block` wait runs out; the message
    ///   is not retried
    /// - [`PagingError::IoFailure`] if the page write failed or an earlier
    ///   one did
    pub fn route(&self, message: &[u8]) -> PagingResult<RouteOutcome> {
        let size = message.len() as u64;
        let settings = self.settings();
        let started = Instant::now();
        let deadline = started + settings.block_timeout;

        let mut flow = self.flow.lock();
        loop {
            if self.is_paging() {
                return self.write_page(message).map(RouteOutcome::Paged);
            }
            match decide(flow.usage, size, &settings) {
                FlowDecision::Accept => {
                    flow.usage += size;
                    return Ok(RouteOutcome::InMemory);
                }
                FlowDecision::Page => {
                    self.enter_paging(flow.usage);
                    return self.write_page(message).map(RouteOutcome::Paged);
                }
                FlowDecision::Drop => {
                    debug!(address = %self.address, size, "message dropped, address full");
                    return Ok(RouteOutcome::Dropped);
                }
                FlowDecision::Reject => {
                    return Err(PagingError::AddressFull {
                        address: self.address.clone(),
                    });
                }
                FlowDecision::Block => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(address = %self.address, "blocked send timed out");
                        return Err(PagingError::Timeout {
                            address: self.address.clone(),
                            waited: now - started,
                        });
                    }
                    debug!(address = %self.address, usage = flow.usage, "producer blocked");
                    self.changed.wait_for(&mut flow, deadline - now);
                }
            }
        }
    }

    /// Writes a message to the current page, entering paging mode.
    ///
    /// # Errors
    ///
    /// Returns [`PagingError::IoFailure`] if the write failed or an
    /// earlier one did.
    pub fn page(&self, message: &[u8]) -> PagingResult<PagePosition> {
        let flow = self.flow.lock();
        if !self.is_paging() {
            self.enter_paging(flow.usage);
        }
        self.write_page(message)
    }

    /// Returns the next paged message in send order.
    ///
    /// Returns `None` when every paged message has been handed out.
    ///
    /// # Errors
    ///
    /// Returns [`PagingError::CorruptPage`] if the message cannot be read
    /// back.
    pub fn depage(&self) -> PagingResult<Option<DepagedMessage>> {
        self.check_failed()?;
        let message = {
            let mut reader = self.reader.lock();
            self.next_message(&mut reader)?
        };
        if message.is_none() || self.paged_messages() == 0 {
            self.maybe_exit_paging();
        }
        Ok(message)
    }

    fn next_message(&self, reader: &mut ReadCursor) -> PagingResult<Option<DepagedMessage>> {
        loop {
            let page = self
                .pages
                .lock()
                .range(reader.page_id..)
                .next()
                .map(|(_, page)| Arc::clone(page));
            let Some(page) = page else {
                return Ok(None);
            };
            if page.id != reader.page_id {
                reader.page_id = page.id;
                reader.index = 0;
                reader.offset = 0;
            }

            let (written, sealed) = {
                let state = page.state.lock();
                (state.written, state.sealed)
            };
            if reader.index < written {
                let (payload, frame_len) = page.read(reader.offset)?;
                let position = PagePosition {
                    page_id: page.id,
                    index: reader.index,
                    offset: reader.offset,
                };
                reader.index += 1;
                reader.offset += frame_len as u64;
                page.state.lock().outstanding.insert(position.index);
                self.paged_messages.fetch_sub(1, Ordering::AcqRel);
                self.paged_bytes
                    .fetch_sub(payload.len() as u64, Ordering::AcqRel);
                return Ok(Some(DepagedMessage {
                    position,
                    payload: Bytes::from(payload),
                }));
            }
            if !sealed {
                return Ok(None);
            }
            reader.page_id = page.id + 1;
            reader.index = 0;
            reader.offset = 0;
        }
    }

    /// Marks a depaged message as delivered.
    ///
    /// A sealed page is deleted once all of its messages are acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`PagingError::InvalidArgument`] if the message was not
    /// depaged or was already acknowledged.
    pub fn ack(&self, position: PagePosition) -> PagingResult<()> {
        let page = self
            .pages
            .lock()
            .get(&position.page_id)
            .cloned()
            .ok_or_else(|| {
                PagingError::invalid_argument(format!("unknown page {}", position.page_id))
            })?;
        let done = {
            let mut state = page.state.lock();
            if !state.outstanding.remove(&position.index) {
                return Err(PagingError::invalid_argument(format!(
                    "message {} of page {} is not awaiting acknowledgement",
                    position.index, position.page_id
                )));
            }
            state.acked += 1;
            state.is_done()
        };
        if done {
            self.delete_page(&page)?;
        }
        Ok(())
    }

    /// Reports a change of the in-memory usage of the address.
    ///
    /// Growth over the ceiling starts paging under the `Page` policy.
    /// Shrinking wakes blocked producers and may end paging.
    pub fn add_size(&self, delta: i64) {
        let mut flow = self.flow.lock();
        flow.usage = if delta < 0 {
            flow.usage.saturating_sub(delta.unsigned_abs())
        } else {
            flow.usage.saturating_add(delta.unsigned_abs())
        };

        if delta > 0 {
            let settings = self.settings.read();
            if settings.policy == AddressFullPolicy::Page
                && settings.is_over(flow.usage)
                && !self.is_paging()
            {
                self.enter_paging(flow.usage);
            }
            return;
        }
        self.changed.notify_all();
        drop(flow);
        self.maybe_exit_paging();
    }

    /// Waits until the address leaves paging mode.
    ///
    /// Returns `false` if it is still paging when `timeout` runs out.
    pub fn wait_until_not_paging(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flow = self.flow.lock();
        while self.is_paging() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.changed.wait_for(&mut flow, deadline - now);
        }
        true
    }

    fn enter_paging(&self, usage: u64) {
        self.paging.store(true, Ordering::Release);
        info!(address = %self.address, usage, "paging started");
    }

    /// Leaves paging mode if nothing paged remains and usage is low enough.
    fn maybe_exit_paging(&self) {
        let flow = self.flow.lock();
        if !self.is_paging()
            || self.paged_messages() > 0
            || !self.settings.read().is_below_exit(flow.usage)
        {
            return;
        }

        let sealed = {
            let mut writer = self.writer.lock();
            writer.current.take()
        };
        if let Some(page) = sealed {
            let done = {
                let mut state = page.state.lock();
                state.sealed = true;
                state.is_done()
            };
            if done {
                if let Err(err) = self.delete_page(&page) {
                    warn!(address = %self.address, page_id = page.id, error = %err, "could not delete page");
                }
            }
        }

        self.paging.store(false, Ordering::Release);
        info!(address = %self.address, usage = flow.usage, "paging stopped");
        self.changed.notify_all();
    }

    /// Appends a message to the current page, rotating when it is full.
    /// Callers hold the `flow` lock.
    fn write_page(&self, message: &[u8]) -> PagingResult<PagePosition> {
        self.check_failed()?;
        let frame = encode_frame(message)?;
        let page_size = self.settings.read().page_size_bytes;

        let mut writer = self.writer.lock();
        let fits = writer.current.as_ref().is_some_and(|page| {
            let size = page.state.lock().size;
            size == 0 || size + frame.len() as u64 <= page_size
        });
        let page = if fits {
            writer.current.clone()
        } else {
            None
        };
        let page = match page {
            Some(page) => page,
            None => self.rotate(&mut writer).map_err(|err| self.fail(&err))?,
        };

        match page.append(&frame, self.sync_on_write) {
            Ok((index, offset)) => {
                self.paged_messages.fetch_add(1, Ordering::AcqRel);
                self.paged_bytes
                    .fetch_add(message.len() as u64, Ordering::AcqRel);
                Ok(PagePosition {
                    page_id: page.id,
                    index,
                    offset,
                })
            }
            Err(err) => Err(self.fail(&err)),
        }
    }

    /// Seals the current page and starts the next one.
    fn rotate(&self, writer: &mut WriteCursor) -> PagingResult<Arc<PageFile>> {
        if let Some(previous) = writer.current.take() {
            previous.sync()?;
            let done = {
                let mut state = previous.state.lock();
                state.sealed = true;
                state.is_done()
            };
            if done {
                self.delete_page(&previous)?;
            }
        }

        let id = writer.next_page_id;
        let name = page_file_name(id);
        let page = Arc::new(PageFile::new(
            id,
            self.factory.open(&name)?,
            PageState::default(),
        ));
        writer.next_page_id = id + 1;
        self.pages.lock().insert(id, Arc::clone(&page));
        writer.current = Some(Arc::clone(&page));
        debug!(address = %self.address, page_id = id, "page created");
        Ok(page)
    }

    fn delete_page(&self, page: &PageFile) -> PagingResult<()> {
        self.pages.lock().remove(&page.id);
        self.factory.delete(&page.name)?;
        debug!(address = %self.address, page_id = page.id, "page deleted");
        Ok(())
    }

    fn check_failed(&self) -> PagingResult<()> {
        match &*self.failure.lock() {
            Some(message) => Err(PagingError::io_failure(message.clone())),
            None => Ok(()),
        }
    }

    fn fail(&self, err: &PagingError) -> PagingError {
        let message = err.to_string();
        error!(address = %self.address, error = %message, "page write failed, refusing further paging");
        *self.failure.lock() = Some(message.clone());
        PagingError::io_failure(message)
    }
}

impl std::fmt::Debug for PagingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagingStore")
            .field("address", &self.address)
            .field("paging", &self.is_paging())
            .field("paged_messages", &self.paged_messages())
            .finish_non_exhaustive()
    }
}
