//! Whole-stack iteration.

use tracing::{trace, warn};

use crate::error::WalkError;
use crate::frame::{Frame, FrameKind};
use crate::register_map::RegisterMap;
use crate::runtime::{FrameRuntime, ManagedThread};

/// Iterator over a stack, from the starting frame outward.
///
/// The stream owns the walk's [`RegisterMap`], so the map seen through
/// [`FrameStream::register_map`] always matches [`FrameStream::current`].
///
/// # Example
///
/// ```ignore
/// let mut stream = unsafe { FrameStream::for_thread(&rt, &thread)? };
/// for frame in &mut stream {
///     let frame = frame?;
///     println!("{frame}");
/// }
/// ```
#[derive(Debug)]
pub struct FrameStream<'a> {
    current: Option<Frame>,
    map: RegisterMap<'a>,
    depth: usize,
    started: bool,
}

impl<'a> FrameStream<'a> {
    /// Walk `thread` from its last managed frame.
    ///
    /// # Safety
    ///
    /// Same contract as [`ManagedThread::last_frame`].
    pub unsafe fn for_thread(rt: &'a FrameRuntime, thread: &'a ManagedThread) -> Result<Self, WalkError> {
        // SAFETY: upheld by the caller.
        let frame = unsafe { thread.last_frame(rt)? };
        Ok(Self::new(frame, RegisterMap::new(rt).with_thread(thread)))
    }

    /// Walk from `frame`, updating `map`.
    pub fn new(frame: Frame, map: RegisterMap<'a>) -> Self {
        Self {
            current: Some(frame),
            map,
            depth: 1,
            started: false,
        }
    }

    /// Frame the stream is positioned at; `None` once the walk is done.
    #[inline]
    pub fn current(&self) -> Option<&Frame> {
        self.current.as_ref()
    }

    /// Register map matching the current frame.
    #[inline]
    pub fn register_map(&self) -> &RegisterMap<'a> {
        &self.map
    }

    /// Number of frames visited so far.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.current.is_none()
    }

    /// Move to the sender of the current frame.
    ///
    /// Reaching the bottom of the stack is not an error: the stream becomes
    /// done. Errors also end the stream.
    pub fn advance(&mut self) -> Result<(), WalkError> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        if Self::is_bottom(&current) {
            trace!(frame = %current, depth = self.depth, "reached bottom of stack");
            return Ok(());
        }

        let config = self.map.runtime().config();
        if self.depth >= config.max_depth {
            warn!(limit = config.max_depth, frame = %current, "stack walk depth limit reached");
            return Err(WalkError::DepthLimitExceeded {
                limit: config.max_depth,
            });
        }

        let callee_in_continuation = self.map.in_continuation();
        let sender = current.sender(&mut self.map);

        // Stack chunks live on the heap, so ordering only holds on the
        // native stack.
        if !callee_in_continuation && !self.map.in_continuation() {
            if !sender.is_older(current.id()) {
                warn!(callee = %current, sender = %sender, "sender is not older than its callee");
                return Err(WalkError::NonMonotonicStack {
                    callee: current.id(),
                    sender: sender.id(),
                });
            }
            if config.verify_frames
                && current.kind() == FrameKind::Compiled
                && !Self::returns_to_barrier(&current, self.map.runtime())
            {
                let declares_size = current.cb().is_some_and(|cb| cb.frame_size() > 0);
                assert!(
                    !declares_size || sender.sp() == current.real_fp(),
                    "sender sp {} does not match real fp of {current}",
                    sender.sp()
                );
            }
        }

        self.depth += 1;
        self.current = Some(sender);
        Ok(())
    }

    /// The compiled `frame` physically returns into the continuation return
    /// barrier, so its sender's sp may have been patched by the overlay.
    fn returns_to_barrier(frame: &Frame, rt: &FrameRuntime) -> bool {
        let real_fp = frame.real_fp();
        if real_fp.is_null() {
            return false;
        }
        // SAFETY: the return address is the word below the real fp of a
        // walkable compiled frame.
        let raw = unsafe { real_fp.offset(-1).read_word() };
        rt.continuations()
            .is_return_barrier_entry(rt.layout().pointer_auth.strip(raw))
    }

    /// Nothing older can be found from `frame`.
    fn is_bottom(frame: &Frame) -> bool {
        match frame.kind() {
            FrameKind::Entry | FrameKind::OptimizedEntry => frame.is_first_frame(),
            FrameKind::Native => frame.fp().is_null() || frame.sender_pc().is_null(),
            FrameKind::Interpreted | FrameKind::Compiled => false,
        }
    }
}

impl Iterator for FrameStream<'_> {
    type Item = Result<Frame, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
        } else if let Err(err) = self.advance() {
            return Some(Err(err));
        }
        self.current.clone().map(Ok)
    }
}
