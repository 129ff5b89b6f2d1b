//! Shared-reference fan-out with refcounted release.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, SolverError};

/// A read-only artifact handle produced by a worker back-end.
///
/// The registry guarantees `release` runs exactly once per origin, when the
/// last outstanding share is gone.
pub trait ImmutableRef: Send + Sync + fmt::Debug {
    /// Stable identifier of the underlying artifact.
    fn id(&self) -> &str;
    /// Give the artifact back to its owner.
    fn release(&self);
}

/// A uniquely-owned artifact handle.
///
/// A mutable reference is not shareable; committing it seals the artifact and
/// produces its immutable form.
pub trait MutableRef: Send + Sync + fmt::Debug {
    /// Stable identifier of the underlying artifact.
    fn id(&self) -> &str;
    /// Seal the artifact, producing its immutable form.
    fn commit(self: Box<Self>) -> Result<Box<dyn ImmutableRef>>;
    /// Throw the artifact away without committing.
    fn discard(self: Box<Self>);
}

/// What an operation hands back, one per output.
#[derive(Debug)]
pub enum Reference {
    /// A shareable result.
    Immutable(Box<dyn ImmutableRef>),
    /// An uncommitted result; the scheduler commits it before sharing.
    Mutable(Box<dyn MutableRef>),
}

struct ShareState {
    origin: Box<dyn ImmutableRef>,
    counts: Mutex<Counts>,
}

struct Counts {
    live: usize,
    origin_released: bool,
}

impl ShareState {
    fn drop_share(&self) {
        let release_origin = {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            counts.live -= 1;
            if counts.live == 0 && !counts.origin_released {
                counts.origin_released = true;
                true
            } else {
                false
            }
        };
        if release_origin {
            self.origin.release();
        }
    }
}

impl fmt::Debug for ShareState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareState")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// One countable share of a [`SharedRef`].
///
/// Every handle releases its share exactly once: explicitly via
/// [`RefHandle::release`], or implicitly when dropped. The origin is released
/// when the last share goes away.
#[derive(Debug)]
pub struct RefHandle {
    state: Arc<ShareState>,
    released: AtomicBool,
}

impl RefHandle {
    /// Take another share of the same origin.
    ///
    /// Fails once this handle, or the origin itself, has been released.
    pub fn share(&self) -> Result<RefHandle> {
        let mut counts = self.state.counts.lock().unwrap_or_else(|e| e.into_inner());
        if counts.origin_released || self.released.load(Ordering::Acquire) {
            return Err(SolverError::InvalidHandle(format!(
                "share of already released reference {}",
                self.state.origin.id()
            )));
        }
        counts.live += 1;
        drop(counts);
        Ok(RefHandle {
            state: self.state.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// The origin artifact this handle shares.
    pub fn immutable(&self) -> &dyn ImmutableRef {
        self.state.origin.as_ref()
    }

    /// Identifier of the origin artifact.
    pub fn id(&self) -> &str {
        self.state.origin.id()
    }

    /// Number of live shares of the origin, this one included.
    pub fn shares(&self) -> usize {
        self.state.counts.lock().unwrap_or_else(|e| e.into_inner()).live
    }

    /// Drop this share.
    ///
    /// Releasing the same handle twice is a misuse and reports
    /// [`SolverError::InvalidHandle`].
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(SolverError::InvalidHandle(format!(
                "double release of {}",
                self.state.origin.id()
            )));
        }
        self.state.drop_share();
        Ok(())
    }

    /// Repackage this share as an origin reference of its own.
    ///
    /// Releasing the returned reference releases this share. Used to hand a
    /// nested result back through the [`Reference`] channel.
    pub fn into_origin(self) -> Box<dyn ImmutableRef> {
        Box::new(HandleOrigin { handle: self })
    }
}

impl Drop for RefHandle {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.state.drop_share();
        }
    }
}

#[derive(Debug)]
struct HandleOrigin {
    handle: RefHandle,
}

impl ImmutableRef for HandleOrigin {
    fn id(&self) -> &str {
        self.handle.id()
    }

    fn release(&self) {
        let _ = self.handle.release();
    }
}

/// Owner side of a shared reference.
///
/// Created by the scheduler around a worker-produced origin; the wrapper
/// holds the origin by value and hands out countable shares. The origin's
/// `release` runs exactly once, when the wrapper and every share are gone.
#[derive(Debug)]
pub struct SharedRef {
    main: RefHandle,
}

impl SharedRef {
    /// Wrap an origin reference for fan-out.
    pub fn new(origin: Box<dyn ImmutableRef>) -> Self {
        let state = Arc::new(ShareState {
            origin,
            counts: Mutex::new(Counts {
                live: 1,
                origin_released: false,
            }),
        });
        Self {
            main: RefHandle {
                state,
                released: AtomicBool::new(false),
            },
        }
    }

    /// Hand out a new share.
    pub fn share(&self) -> Result<RefHandle> {
        self.main.share()
    }

    /// Identifier of the origin artifact.
    pub fn id(&self) -> &str {
        self.main.id()
    }

    /// Number of live shares, the wrapper's own included.
    pub fn shares(&self) -> usize {
        self.main.shares()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Debug)]
    struct CountedRef {
        name: String,
        releases: Arc<AtomicUsize>,
    }

    impl ImmutableRef for CountedRef {
        fn id(&self) -> &str {
            &self.name
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted(name: &str) -> (Box<dyn ImmutableRef>, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        (
            Box::new(CountedRef {
                name: name.to_string(),
                releases: releases.clone(),
            }),
            releases,
        )
    }

    #[test]
    fn origin_released_once_after_last_share() {
        let (origin, releases) = counted("r1");
        let shared = SharedRef::new(origin);
        let a = shared.share().unwrap();
        let b = shared.share().unwrap();
        assert_eq!(shared.shares(), 3);

        a.release().unwrap();
        b.release().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        drop(shared);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn double_release_is_invalid_handle() {
        let (origin, _) = counted("r2");
        let shared = SharedRef::new(origin);
        let a = shared.share().unwrap();
        a.release().unwrap();
        assert!(matches!(
            a.release(),
            Err(SolverError::InvalidHandle(_))
        ));
    }

    #[test]
    fn share_after_origin_release_fails() {
        let (origin, releases) = counted("r3");
        let shared = SharedRef::new(origin);
        let a = shared.share().unwrap();
        drop(shared);
        a.release().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(matches!(a.share(), Err(SolverError::InvalidHandle(_))));
    }

    #[test]
    fn dropping_unreleased_handle_counts_as_release() {
        let (origin, releases) = counted("r4");
        let shared = SharedRef::new(origin);
        {
            let _a = shared.share().unwrap();
            let _b = shared.share().unwrap();
        }
        assert_eq!(shared.shares(), 1);
        drop(shared);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_origin_forwards_release() {
        let (origin, releases) = counted("r5");
        let shared = SharedRef::new(origin);
        let nested = SharedRef::new(shared.share().unwrap().into_origin());
        drop(nested);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        drop(shared);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
