//! Pluggable final destruction.
//!
//! When a count reaches zero and no observer rescues the object, the core
//! wraps it in a `Deletion` and hands it to the context's `DeleteHandler`,
//! or drops it on the spot when none is installed. A `Deletion` is the only
//! thing a handler ever sees: it carries identity and the right to destroy,
//! nothing that could reach `acquire`/`release`.

use crate::observer::ObjectId;
use crate::referenced::RefHeader;
use core::fmt;
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

/// Exclusive right to destroy one unreferenced object. Dropping it destroys
/// the object.
pub struct Deletion {
    header: NonNull<RefHeader>,
}

// SAFETY: counted values are `Send`, and a `Deletion` is the unique handle
// left to the object, so destruction may run on any thread.
unsafe impl Send for Deletion {}

impl Deletion {
    /// # Safety
    /// `header` must be live, and the caller must give up every other use
    /// of the object.
    pub(crate) unsafe fn new(header: NonNull<RefHeader>) -> Self {
        Self { header }
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::of(self.header.as_ptr())
    }

    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for Deletion {
    fn drop(&mut self) {
        // SAFETY: the header is live until `drop_fn` frees the allocation,
        // and this is the only path that calls it for this object.
        unsafe {
            let drop_fn = self.header.as_ref().drop_fn();
            drop_fn(self.header);
        }
    }
}

impl fmt::Debug for Deletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Deletion").field(&self.id()).finish()
    }
}

/// Strategy for destroying unreferenced objects.
///
/// `request_delete` must eventually destroy every deletion it receives
/// exactly once, which dropping it does. It may run on any thread that
/// releases a last reference, possibly re-entrantly from inside another
/// object's destruction.
pub trait DeleteHandler: Send + Sync {
    fn request_delete(&self, deletion: Deletion);

    /// Destroy whatever is due.
    fn flush(&self) {}

    /// Destroy everything still held.
    fn flush_all(&self) {}
}

/// Keeps deletions for a number of frames before destroying them.
///
/// Each deletion is stamped with the frame number current when it
/// arrived. `flush` destroys those at least `frames_to_retain` frames old;
/// with a retention of zero nothing is queued at all.
pub struct RetainingDeleteHandler {
    frame_number: AtomicU32,
    frames_to_retain: AtomicU32,
    queue: Mutex<VecDeque<(u32, Deletion)>>,
}

impl RetainingDeleteHandler {
    pub fn new(frames_to_retain: u32) -> Self {
        Self {
            frame_number: AtomicU32::new(0),
            frames_to_retain: AtomicU32::new(frames_to_retain),
            queue: Mutex::new(VecDeque::with_capacity(8)),
        }
    }

    pub fn set_frame_number(&self, frame: u32) {
        self.frame_number.store(frame, Ordering::Relaxed);
    }

    pub fn frame_number(&self) -> u32 {
        self.frame_number.load(Ordering::Relaxed)
    }

    pub fn set_frames_to_retain(&self, frames: u32) {
        self.frames_to_retain.store(frames, Ordering::Relaxed);
    }

    pub fn frames_to_retain(&self) -> u32 {
        self.frames_to_retain.load(Ordering::Relaxed)
    }

    /// Number of deletions waiting in the queue.
    #[inline]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    // Destruction happens after the queue lock is released: dropping an
    // object may release others and come straight back here.
    fn destroy_batch(&self, batch: Vec<Deletion>) {
        if batch.is_empty() {
            return;
        }
        log::trace!("destroying {} retained objects", batch.len());
        drop(batch);
    }
}

impl Default for RetainingDeleteHandler {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeleteHandler for RetainingDeleteHandler {
    fn request_delete(&self, deletion: Deletion) {
        if self.frames_to_retain() == 0 {
            drop(deletion);
            return;
        }
        let frame = self.frame_number();
        self.queue.lock().push_back((frame, deletion));
    }

    fn flush(&self) {
        let Some(cutoff) = self.frame_number().checked_sub(self.frames_to_retain()) else {
            return;
        };
        let expired: Vec<Deletion> = {
            let mut queue = self.queue.lock();
            let (expired, kept): (Vec<_>, Vec<_>) =
                queue.drain(..).partition(|(frame, _)| *frame <= cutoff);
            *queue = kept.into();
            expired.into_iter().map(|(_, d)| d).collect()
        };
        self.destroy_batch(expired);
    }

    fn flush_all(&self) {
        let all: Vec<Deletion> = self.queue.lock().drain(..).map(|(_, d)| d).collect();
        self.destroy_batch(all);
    }
}

impl Drop for RetainingDeleteHandler {
    fn drop(&mut self) {
        self.flush_all();
    }
}

impl fmt::Debug for RetainingDeleteHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetainingDeleteHandler")
            .field("frame_number", &self.frame_number())
            .field("frames_to_retain", &self.frames_to_retain())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Destroys objects on a dedicated worker thread.
///
/// Dropping the handler closes the channel and joins the worker, so every
/// deletion handed over before that point has been destroyed when the drop
/// returns. A handler dropped on its own worker (its last owner went away
/// inside a destruction) detaches instead; the worker drains the channel and
/// exits.
pub struct ThreadedDeleteHandler {
    sender: Option<Sender<Deletion>>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedDeleteHandler {
    pub const WORKER_NAME: &'static str = "referenced-delete";

    pub fn new() -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded::<Deletion>();
        let worker = thread::Builder::new()
            .name(Self::WORKER_NAME.to_string())
            .spawn(move || {
                for deletion in receiver {
                    log::trace!("{:?}: destroying on worker", deletion.id());
                    drop(deletion);
                }
            })?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }
}

impl DeleteHandler for ThreadedDeleteHandler {
    fn request_delete(&self, deletion: Deletion) {
        let Some(sender) = &self.sender else {
            drop(deletion);
            return;
        };
        if let Err(err) = sender.send(deletion) {
            log::warn!("delete worker is gone; destroying on the calling thread");
            drop(err.into_inner());
        }
    }
}

impl Drop for ThreadedDeleteHandler {
    fn drop(&mut self) {
        drop(self.sender.take());
        let Some(worker) = self.worker.take() else {
            return;
        };
        // Destroying an object on the worker can drop the last owner of this
        // handler. The worker then finishes the closed channel on its own.
        if worker.thread().id() == thread::current().id() {
            log::debug!("delete handler dropped on its own worker; detaching");
            return;
        }
        if worker.join().is_err() {
            log::error!("delete worker panicked");
        }
    }
}

impl fmt::Debug for ThreadedDeleteHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedDeleteHandler")
            .field("running", &self.worker.is_some())
            .finish()
    }
}
