//! # Command Tracker
//!
//! Every request carries a 16-bit host tag that the controller echoes in its
//! reply. The tracker owns one slot per tag and partitions the tag space:
//!
//! ```text
//!   1..=5                       single-purpose: init, ioctl, pel abort, pel wait, task mgmt
//!   6..6+R                      device-removal handshakes   (R = dev_removal_cmds)
//!   6+R..6+R+A                  event acknowledgements      (A = event_ack_cmds)
//!   6+R+A..6+R+A+max_host_ios   per-I/O commands
//!   0xFFFF                      invalid (unsolicited replies)
//! ```
//!
//! Internal ranges are allocated under a spin lock; the I/O range uses a
//! lock-free bitmap. A slot's state changes only under its own lock, and the
//! completion (waiter or callback) is taken out under that lock and delivered
//! after it is dropped, so each armed command is delivered exactly once.

use crate::config::DriverConfig;
use crate::error::{ControllerError, ControllerResult};
use crate::mpi::{ioc_status, HOST_TAG_INVALID};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::{Mutex, RwLock};

/// Tag of bring-up and other internal admin commands
pub const HOST_TAG_INIT: u16 = 1;
/// Tag of pass-through admin commands
pub const HOST_TAG_IOCTL: u16 = 2;
/// Tag of the event-log abort command
pub const HOST_TAG_PEL_ABORT: u16 = 3;
/// Tag of the event-log wait command
pub const HOST_TAG_PEL_WAIT: u16 = 4;
/// Tag of blocking task management
pub const HOST_TAG_TM: u16 = 5;
/// Number of single-purpose tags
pub const SINGLE_PURPOSE_TAGS: u16 = 5;
/// First device-removal tag
pub const HOST_TAG_DEVRM_BASE: u16 = SINGLE_PURPOSE_TAGS + 1;

/// A partition of the tag space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagRange {
    /// Bring-up and internal admin commands
    Init,
    /// Pass-through admin commands
    Ioctl,
    /// Event-log abort
    PelAbort,
    /// Event-log wait
    PelWait,
    /// Blocking task management
    TaskMgmt,
    /// Device-removal handshakes
    DevRemoval,
    /// Event acknowledgements
    EventAck,
    /// Per-I/O commands
    Io,
}

impl TagRange {
    fn single_tag(self) -> Option<u16> {
        match self {
            TagRange::Init => Some(HOST_TAG_INIT),
            TagRange::Ioctl => Some(HOST_TAG_IOCTL),
            TagRange::PelAbort => Some(HOST_TAG_PEL_ABORT),
            TagRange::PelWait => Some(HOST_TAG_PEL_WAIT),
            TagRange::TaskMgmt => Some(HOST_TAG_TM),
            _ => None,
        }
    }
}

/// Lifecycle of the command currently using a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No command outstanding
    Free,
    /// Submitted, waiting for the controller
    Pending,
    /// Completed by the controller
    Complete,
    /// The waiter gave up; a late reply is dropped
    TimedOut,
    /// Terminated by a controller reset
    Reset,
}

/// How a command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The controller replied
    Complete,
    /// The command was flushed by a controller reset
    Reset,
}

/// Delivered once per armed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    /// Host tag of the command
    pub host_tag: u16,
    /// How the command ended
    pub status: CompletionStatus,
    /// IOC status, log-info flag removed
    pub ioc_status: u16,
    /// IOC log info, zero when not reported
    pub loginfo: u32,
    /// Copy of the reply frame, for address replies
    pub reply: Option<Vec<u8>>,
    /// Copy of the sense data, when the controller returned some
    pub sense: Option<Vec<u8>>,
}

impl CompletionResult {
    fn reset(host_tag: u16) -> Self {
        Self {
            host_tag,
            status: CompletionStatus::Reset,
            ioc_status: ioc_status::DRIVER_RESET_TERMINATED,
            loginfo: 0,
            reply: None,
            sense: None,
        }
    }

    fn io_reset(host_tag: u16) -> Self {
        Self {
            ioc_status: ioc_status::DRIVER_BUS_RESET,
            ..Self::reset(host_tag)
        }
    }

    /// Check if the controller completed the command successfully
    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Complete && self.ioc_status == ioc_status::SUCCESS
    }

    /// Turn the result into an error when it is not a success
    pub fn check(&self) -> ControllerResult<()> {
        match self.status {
            CompletionStatus::Reset => Err(ControllerError::CommandReset),
            CompletionStatus::Complete if self.ioc_status != ioc_status::SUCCESS => {
                Err(ControllerError::CommandFailed {
                    ioc_status: self.ioc_status,
                    loginfo: self.loginfo,
                })
            }
            CompletionStatus::Complete => Ok(()),
        }
    }
}

/// One-shot result cell a blocking caller polls
#[derive(Debug, Default)]
pub struct Waiter {
    done: AtomicBool,
    result: Mutex<Option<CompletionResult>>,
}

impl Waiter {
    fn signal(&self, result: CompletionResult) {
        *self.result.lock() = Some(result);
        self.done.store(true, Ordering::Release);
    }

    fn clear(&self) {
        self.done.store(false, Ordering::Release);
        *self.result.lock() = None;
    }

    /// Check if the result has been delivered
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Take the delivered result
    pub fn take(&self) -> Option<CompletionResult> {
        if self.is_done() {
            self.result.lock().take()
        } else {
            None
        }
    }
}

/// Callback run when an asynchronous command completes
pub type Callback<Ctx> = Box<dyn FnOnce(&Ctx, CompletionResult) + Send>;

/// Delivery style chosen when a command is submitted
pub enum Completion<Ctx> {
    /// Wake a blocking caller
    Blocking(Arc<Waiter>),
    /// Run a callback in the completing context
    Async(Callback<Ctx>),
}

impl<Ctx> Completion<Ctx> {
    fn deliver(self, ctx: &Ctx, result: CompletionResult) {
        match self {
            Completion::Blocking(waiter) => waiter.signal(result),
            Completion::Async(callback) => callback(ctx, result),
        }
    }
}

impl<Ctx> fmt::Debug for Completion<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Blocking(_) => write!(f, "Blocking"),
            Completion::Async(_) => write!(f, "Async"),
        }
    }
}

/// Accounting attached to an I/O command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoBinding {
    /// Operational queue index (0-based)
    pub queue_index: u16,
    /// Target device handle
    pub dev_handle: u16,
    /// Transfer length in 512-byte blocks
    pub data_len_blks: u32,
    /// Counted against the throttle's pending large-transfer size
    pub large: bool,
}

/// Handle to an allocated tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSlot {
    tag: u16,
    range: TagRange,
}

impl CommandSlot {
    /// Host tag to place in the request frame
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Range the tag came from
    pub fn range(&self) -> TagRange {
        self.range
    }
}

struct Slot<Ctx> {
    owned: bool,
    /// Released by its owner while the controller still holds the command
    abandoned: bool,
    state: SlotState,
    completion: Option<Completion<Ctx>>,
    waiter: Arc<Waiter>,
    retry_count: u8,
    dev_handle: u16,
    io: Option<IoBinding>,
}

impl<Ctx> Slot<Ctx> {
    fn new() -> Self {
        Self {
            owned: false,
            abandoned: false,
            state: SlotState::Free,
            completion: None,
            waiter: Arc::new(Waiter::default()),
            retry_count: 0,
            dev_handle: 0,
            io: None,
        }
    }

    fn recycle(&mut self) {
        self.owned = false;
        self.abandoned = false;
        self.state = SlotState::Free;
        self.completion = None;
        self.retry_count = 0;
        self.dev_handle = 0;
        self.io = None;
    }

    /// Free an abandoned slot once the controller gave its command back
    fn reclaim_if_abandoned(&mut self) -> bool {
        if !self.abandoned {
            return false;
        }
        self.recycle();
        true
    }
}

/// What a reset flush did to one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flushed {
    Untouched,
    Delivered,
    Reclaimed,
}

// =============================================================================
// I/O tag bitmap
// =============================================================================

const BITS_PER_WORD: usize = 64;

/// Lock-free allocation bitmap: 1 = in use
struct TagBitmap {
    words: Vec<AtomicU64>,
}

impl TagBitmap {
    fn new(len: usize) -> Self {
        let nwords = len.div_ceil(BITS_PER_WORD);
        let words = (0..nwords)
            .map(|i| {
                let valid = (len - i * BITS_PER_WORD).min(BITS_PER_WORD);
                // Bits past the end are permanently in use
                AtomicU64::new(if valid == BITS_PER_WORD { 0 } else { !0u64 << valid })
            })
            .collect();
        Self { words }
    }

    fn acquire(&self) -> Option<usize> {
        for (i, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Relaxed);
            while current != u64::MAX {
                let bit = (!current).trailing_zeros() as usize;
                match word.compare_exchange_weak(
                    current,
                    current | (1 << bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(i * BITS_PER_WORD + bit),
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    fn release(&self, index: usize) -> bool {
        let mask = 1u64 << (index % BITS_PER_WORD);
        self.words[index / BITS_PER_WORD].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    fn set(&self, index: usize) {
        let mask = 1u64 << (index % BITS_PER_WORD);
        self.words[index / BITS_PER_WORD].fetch_or(mask, Ordering::AcqRel);
    }

    fn in_use(&self) -> usize {
        self.words.iter().map(|w| w.load(Ordering::Relaxed).count_ones() as usize).sum()
    }
}

struct IoSlots<Ctx> {
    slots: Vec<Mutex<Slot<Ctx>>>,
    bitmap: TagBitmap,
    /// Padding bits counted by `bitmap.in_use()`
    padding: usize,
}

impl<Ctx> IoSlots<Ctx> {
    fn new(count: usize) -> Self {
        let bitmap = TagBitmap::new(count);
        let padding = bitmap.words.len() * BITS_PER_WORD - count;
        Self {
            slots: (0..count).map(|_| Mutex::new(Slot::new())).collect(),
            bitmap,
            padding,
        }
    }
}

struct InternalFree {
    dev_removal: Vec<u16>,
    event_ack: Vec<u16>,
}

// =============================================================================
// Tracker
// =============================================================================

/// Slot table keyed by host tag
pub struct CommandTracker<Ctx> {
    evtack_base: u16,
    io_base: u16,
    internal: Vec<Mutex<Slot<Ctx>>>,
    free: Mutex<InternalFree>,
    io: RwLock<IoSlots<Ctx>>,
}

impl<Ctx> CommandTracker<Ctx> {
    /// Create a tracker with the internal ranges sized by `config`
    ///
    /// The I/O range is empty until [`configure_io`](Self::configure_io).
    pub fn new(config: &DriverConfig) -> Self {
        let evtack_base = HOST_TAG_DEVRM_BASE + config.dev_removal_cmds;
        let io_base = evtack_base + config.event_ack_cmds;
        Self {
            evtack_base,
            io_base,
            internal: (1..io_base).map(|_| Mutex::new(Slot::new())).collect(),
            free: Mutex::new(InternalFree {
                dev_removal: (HOST_TAG_DEVRM_BASE..evtack_base).rev().collect(),
                event_ack: (evtack_base..io_base).rev().collect(),
            }),
            io: RwLock::new(IoSlots::new(0)),
        }
    }

    /// First I/O tag
    pub fn io_base(&self) -> u16 {
        self.io_base
    }

    /// Size of the I/O range
    pub fn max_host_ios(&self) -> u16 {
        self.io.read().slots.len() as u16
    }

    /// Size the I/O range
    ///
    /// The range only grows; slots already in use keep their tags.
    pub fn configure_io(&self, max_host_ios: u16) -> ControllerResult<()> {
        if (self.io_base as u32) + (max_host_ios as u32) >= HOST_TAG_INVALID as u32 {
            return Err(ControllerError::InvalidFacts);
        }
        let mut io = self.io.write();
        let current = io.slots.len();
        let wanted = max_host_ios as usize;
        if wanted < current {
            log::error!("[mpi3mr] I/O tag range cannot shrink from {} to {}", current, wanted);
            return Err(ControllerError::InvalidFacts);
        }
        if wanted == current {
            return Ok(());
        }
        let mut grown = IoSlots::new(wanted);
        for (i, slot) in core::mem::take(&mut io.slots).into_iter().enumerate() {
            if slot.lock().owned {
                grown.bitmap.set(i);
            }
            grown.slots[i] = slot;
        }
        *io = grown;
        log::debug!("[mpi3mr] I/O tags {}..{}", self.io_base, self.io_base + max_host_ios);
        Ok(())
    }

    /// Range `tag` belongs to, if any
    pub fn range_of(&self, tag: u16) -> Option<TagRange> {
        match tag {
            HOST_TAG_INIT => Some(TagRange::Init),
            HOST_TAG_IOCTL => Some(TagRange::Ioctl),
            HOST_TAG_PEL_ABORT => Some(TagRange::PelAbort),
            HOST_TAG_PEL_WAIT => Some(TagRange::PelWait),
            HOST_TAG_TM => Some(TagRange::TaskMgmt),
            t if (HOST_TAG_DEVRM_BASE..self.evtack_base).contains(&t) => Some(TagRange::DevRemoval),
            t if (self.evtack_base..self.io_base).contains(&t) => Some(TagRange::EventAck),
            t if t >= self.io_base && ((t - self.io_base) as usize) < self.io.read().slots.len() => {
                Some(TagRange::Io)
            }
            _ => None,
        }
    }

    /// Check if `tag` is an I/O tag
    pub fn is_io_tag(&self, tag: u16) -> bool {
        tag != HOST_TAG_INVALID && self.range_of(tag) == Some(TagRange::Io)
    }

    fn with_slot<R>(&self, tag: u16, f: impl FnOnce(&mut Slot<Ctx>) -> R) -> Option<R> {
        if tag == 0 || tag == HOST_TAG_INVALID {
            return None;
        }
        if tag < self.io_base {
            return self.internal.get(tag as usize - 1).map(|s| f(&mut s.lock()));
        }
        let io = self.io.read();
        io.slots.get((tag - self.io_base) as usize).map(|s| f(&mut s.lock()))
    }

    /// Allocate a tag from `range`
    pub fn allocate(&self, range: TagRange) -> ControllerResult<CommandSlot> {
        let tag = match range {
            TagRange::DevRemoval => self.free.lock().dev_removal.pop(),
            TagRange::EventAck => self.free.lock().event_ack.pop(),
            TagRange::Io => {
                let io = self.io.read();
                io.bitmap.acquire().map(|i| self.io_base + i as u16)
            }
            single => single.single_tag().filter(|&t| {
                self.with_slot(t, |s| !core::mem::replace(&mut s.owned, true)).unwrap_or(false)
            }),
        };
        let tag = tag.ok_or(ControllerError::Busy)?;
        self.with_slot(tag, |s| {
            s.owned = true;
            s.state = SlotState::Free;
            s.retry_count = 0;
        });
        Ok(CommandSlot { tag, range })
    }

    /// Return a tag to its range
    ///
    /// A slot with a command still pending is refused. A timed out command
    /// may still be owned by the controller: its tag is held back until a
    /// late reply or a reset flush returns it.
    pub fn release(&self, tag: u16) -> ControllerResult<()> {
        let outcome = self.with_slot(tag, |s| {
            if !s.owned || s.abandoned || s.state == SlotState::Pending {
                return None;
            }
            if s.state == SlotState::TimedOut {
                s.abandoned = true;
                s.completion = None;
                return Some(false);
            }
            s.recycle();
            Some(true)
        });
        match outcome.flatten() {
            None => {
                log::warn!("[mpi3mr] refusing to release tag {:#06x}", tag);
                Err(ControllerError::InvalidTag(tag))
            }
            Some(false) => {
                log::debug!("[mpi3mr] tag {:#06x} held until the controller returns it", tag);
                Ok(())
            }
            Some(true) => {
                self.return_to_range(tag);
                Ok(())
            }
        }
    }

    fn return_to_range(&self, tag: u16) {
        match self.range_of(tag) {
            Some(TagRange::DevRemoval) => self.free.lock().dev_removal.push(tag),
            Some(TagRange::EventAck) => self.free.lock().event_ack.push(tag),
            Some(TagRange::Io) => {
                self.io.read().bitmap.release((tag - self.io_base) as usize);
            }
            _ => {}
        }
    }

    /// Register a callback for the next submission of `tag`
    pub fn set_callback(&self, tag: u16, callback: Callback<Ctx>) -> ControllerResult<()> {
        self.with_slot(tag, |s| {
            if !s.owned || s.state == SlotState::Pending {
                return Err(ControllerError::InvalidTag(tag));
            }
            s.completion = Some(Completion::Async(callback));
            Ok(())
        })
        .unwrap_or(Err(ControllerError::InvalidTag(tag)))
    }

    /// Mark `tag` pending before its request reaches the controller
    ///
    /// Uses the registered callback if there is one, otherwise arms the
    /// slot's waiter.
    pub fn arm(&self, tag: u16) -> ControllerResult<()> {
        self.with_slot(tag, |s| {
            if !s.owned || matches!(s.state, SlotState::Pending | SlotState::TimedOut) {
                return Err(ControllerError::InvalidTag(tag));
            }
            if s.completion.is_none() {
                s.waiter.clear();
                s.completion = Some(Completion::Blocking(s.waiter.clone()));
            }
            s.state = SlotState::Pending;
            Ok(())
        })
        .unwrap_or(Err(ControllerError::InvalidTag(tag)))
    }

    /// Undo [`arm`](Self::arm) after the request could not be queued
    ///
    /// A registered callback stays registered.
    pub fn disarm(&self, tag: u16) {
        self.with_slot(tag, |s| {
            if s.state == SlotState::Pending {
                s.state = SlotState::Free;
                if matches!(s.completion, Some(Completion::Blocking(_))) {
                    s.completion = None;
                }
            }
        });
    }

    /// Waiter a blocking caller polls for `tag`
    pub fn waiter(&self, tag: u16) -> Option<Arc<Waiter>> {
        self.with_slot(tag, |s| s.waiter.clone())
    }

    /// Current state of `tag`
    pub fn state(&self, tag: u16) -> Option<SlotState> {
        self.with_slot(tag, |s| s.state)
    }

    /// Complete a pending command
    ///
    /// Returns `false` if the tag was not pending; the reply is dropped. A
    /// late reply for a timed out command is not delivered, but it hands the
    /// tag back: the slot becomes `Complete`, or free if its owner already
    /// released it.
    pub fn complete(
        &self,
        ctx: &Ctx,
        tag: u16,
        ioc_status: u16,
        loginfo: u32,
        reply: Option<Vec<u8>>,
        sense: Option<Vec<u8>>,
    ) -> bool {
        let delivery = self.with_slot(tag, |s| match s.state {
            SlotState::Pending => {
                s.state = SlotState::Complete;
                (s.completion.take(), false)
            }
            SlotState::TimedOut => {
                log::warn!("[mpi3mr] late reply for timed out tag {:#06x} dropped", tag);
                s.state = SlotState::Complete;
                (None, s.reclaim_if_abandoned())
            }
            other => {
                log::warn!("[mpi3mr] reply for tag {:#06x} in state {:?} dropped", tag, other);
                (None, false)
            }
        });
        let completion = match delivery {
            Some((Some(c), _)) => c,
            Some((None, reclaimed)) => {
                if reclaimed {
                    self.return_to_range(tag);
                }
                return false;
            }
            None => {
                log::warn!("[mpi3mr] reply with unknown host tag {:#06x}", tag);
                return false;
            }
        };
        completion.deliver(
            ctx,
            CompletionResult {
                host_tag: tag,
                status: CompletionStatus::Complete,
                ioc_status,
                loginfo,
                reply,
                sense,
            },
        );
        true
    }

    /// Give up on a pending command
    ///
    /// Returns `false` if the command already completed; its result is (or is
    /// about to be) in the waiter.
    pub fn mark_timed_out(&self, tag: u16) -> bool {
        self.with_slot(tag, |s| {
            if s.state != SlotState::Pending {
                return false;
            }
            s.state = SlotState::TimedOut;
            s.completion = None;
            true
        })
        .unwrap_or(false)
    }

    fn flush_slot(ctx: &Ctx, slot: &Mutex<Slot<Ctx>>, result: impl FnOnce() -> CompletionResult) -> Flushed {
        let completion = {
            let mut s = slot.lock();
            match s.state {
                SlotState::Pending => {
                    s.state = SlotState::Reset;
                    s.completion.take()
                }
                // The controller forgot the command; nobody is waiting for it.
                SlotState::TimedOut => {
                    s.state = SlotState::Reset;
                    return if s.reclaim_if_abandoned() { Flushed::Reclaimed } else { Flushed::Untouched };
                }
                _ => return Flushed::Untouched,
            }
        };
        if let Some(c) = completion {
            c.deliver(ctx, result());
        }
        Flushed::Delivered
    }

    /// Terminate every pending internal command with a reset status
    pub fn flush_internal(&self, ctx: &Ctx) -> usize {
        let mut delivered = 0;
        for (i, slot) in self.internal.iter().enumerate() {
            let tag = i as u16 + 1;
            match Self::flush_slot(ctx, slot, || CompletionResult::reset(tag)) {
                Flushed::Delivered => delivered += 1,
                Flushed::Reclaimed => self.return_to_range(tag),
                Flushed::Untouched => {}
            }
        }
        delivered
    }

    /// Terminate every pending I/O with a bus-reset status
    pub fn flush_io(&self, ctx: &Ctx) -> usize {
        let io = self.io.read();
        let mut delivered = 0;
        for (i, slot) in io.slots.iter().enumerate() {
            let tag = self.io_base + i as u16;
            match Self::flush_slot(ctx, slot, || CompletionResult::io_reset(tag)) {
                Flushed::Delivered => delivered += 1,
                Flushed::Reclaimed => {
                    io.bitmap.release(i);
                }
                Flushed::Untouched => {}
            }
        }
        delivered
    }

    /// Terminate every pending command with a reset status
    ///
    /// Each pending command is delivered exactly once; a second call finds
    /// nothing pending.
    pub fn flush_for_reset(&self, ctx: &Ctx) -> usize {
        let flushed = self.flush_internal(ctx) + self.flush_io(ctx);
        if flushed > 0 {
            log::info!("[mpi3mr] {} outstanding commands terminated by reset", flushed);
        }
        flushed
    }

    /// Attach I/O accounting to `tag`
    pub fn bind_io(&self, tag: u16, binding: IoBinding) {
        self.with_slot(tag, |s| s.io = Some(binding));
    }

    /// Detach the I/O accounting from `tag`
    pub fn take_io_binding(&self, tag: u16) -> Option<IoBinding> {
        self.with_slot(tag, |s| s.io.take()).flatten()
    }

    /// Peek at the I/O accounting of `tag`
    pub fn io_binding(&self, tag: u16) -> Option<IoBinding> {
        self.with_slot(tag, |s| s.io).flatten()
    }

    /// Retry counter of `tag`
    pub fn retry_count(&self, tag: u16) -> u8 {
        self.with_slot(tag, |s| s.retry_count).unwrap_or(0)
    }

    /// Increment and return the retry counter of `tag`
    pub fn bump_retry(&self, tag: u16) -> u8 {
        self.with_slot(tag, |s| {
            s.retry_count = s.retry_count.saturating_add(1);
            s.retry_count
        })
        .unwrap_or(0)
    }

    /// Start a new handshake on `tag` with a clean retry counter
    pub fn clear_retry(&self, tag: u16) {
        self.with_slot(tag, |s| s.retry_count = 0);
    }

    /// Remember the device a handshake slot is working on
    pub fn set_dev_handle(&self, tag: u16, handle: u16) {
        self.with_slot(tag, |s| s.dev_handle = handle);
    }

    /// Device a handshake slot is working on
    pub fn dev_handle(&self, tag: u16) -> Option<u16> {
        self.with_slot(tag, |s| s.dev_handle)
    }

    /// I/O tags currently allocated
    pub fn io_in_use(&self) -> usize {
        let io = self.io.read();
        io.bitmap.in_use() - io.padding
    }

    /// Number of commands currently pending
    pub fn pending_count(&self) -> usize {
        let internal = self.internal.iter().filter(|s| s.lock().state == SlotState::Pending).count();
        let io = self.io.read();
        internal + io.slots.iter().filter(|s| s.lock().state == SlotState::Pending).count()
    }
}

impl<Ctx> fmt::Debug for CommandTracker<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTracker")
            .field("io_base", &self.io_base)
            .field("max_host_ios", &self.max_host_ios())
            .finish()
    }
}
