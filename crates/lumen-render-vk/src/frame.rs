// SPDX-License-Identifier: CEPL-1.0
//! Per-frame sequencing: wait -> acquire -> record -> submit -> present.
//!
//! `FrameLoop` owns the ordering rules; the GPU calls themselves sit behind
//! `FrameOps` so the rules hold no matter who performs them.

use tracing::{debug, error, warn};

use crate::error::{RenderError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// `begin_render_pass`: recording has started. `present`: the image was queued.
    Ready,
    /// The surface was stale and the swapchain has been rebuilt. After
    /// `begin_render_pass` this means "skip drawing, try again next iteration".
    SwapchainRecreated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented { suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FramePhase {
    #[default]
    Idle,
    Recording { image_index: u32 },
    Submitted { image_index: u32 },
}

impl FramePhase {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            FramePhase::Idle => "idle",
            FramePhase::Recording { .. } => "recording",
            FramePhase::Submitted { .. } => "submitted",
        }
    }
}

pub trait FrameOps {
    /// Block on the in-flight fence of the previous submission.
    fn wait_for_previous_frame(&mut self) -> Result<()>;
    fn acquire_image(&mut self) -> Result<AcquireOutcome>;
    /// Reset the persistent command buffer and open the render pass on `image_index`.
    fn begin_recording(&mut self, image_index: u32) -> Result<()>;
    fn reset_frame_fence(&mut self) -> Result<()>;
    /// Close the render pass and command buffer and submit them, signaling the in-flight fence.
    fn submit(&mut self) -> Result<()>;
    fn present(&mut self, image_index: u32) -> Result<PresentOutcome>;
    fn recreate_swapchain(&mut self) -> Result<()>;
    /// Give back an acquired image whose frame will not be submitted: consume the
    /// acquire semaphore, leave the in-flight fence signaled and release the image.
    fn abandon_frame(&mut self, image_index: u32) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct FrameLoop {
    phase: FramePhase,
}

impl FrameLoop {
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn recording_image(&self) -> Option<u32> {
        match self.phase {
            FramePhase::Recording { image_index } => Some(image_index),
            _ => None,
        }
    }

    fn out_of_order(&self, expected: &'static str) -> RenderError {
        RenderError::FrameOrder {
            expected,
            found: self.phase.name(),
        }
    }

    /// Recover from a failure between acquire and submit, returning `cause`.
    fn abandon<O: FrameOps + ?Sized>(ops: &mut O, image_index: u32, cause: RenderError) -> RenderError {
        warn!("dropping frame on image {image_index}: {cause}");
        if let Err(e) = ops.abandon_frame(image_index) {
            error!("recovering dropped frame: {e}");
        }
        cause
    }

    pub fn begin<O: FrameOps + ?Sized>(&mut self, ops: &mut O) -> Result<FrameStatus> {
        if self.phase != FramePhase::Idle {
            return Err(self.out_of_order("idle"));
        }

        ops.wait_for_previous_frame()?;

        match ops.acquire_image()? {
            AcquireOutcome::OutOfDate => {
                // Nothing was acquired and the fence is still signaled, so
                // dropping the frame here leaves no dangling GPU state.
                warn!("swapchain out of date on acquire; recreating and skipping frame");
                ops.recreate_swapchain()?;
                Ok(FrameStatus::SwapchainRecreated)
            }
            AcquireOutcome::Image { index, suboptimal } => {
                if suboptimal {
                    debug!("acquired image {index} from a suboptimal swapchain");
                }
                if let Err(e) = ops.begin_recording(index) {
                    return Err(Self::abandon(ops, index, e));
                }
                self.phase = FramePhase::Recording { image_index: index };
                Ok(FrameStatus::Ready)
            }
        }
    }

    pub fn end<O: FrameOps + ?Sized>(&mut self, ops: &mut O) -> Result<()> {
        let FramePhase::Recording { image_index } = self.phase else {
            return Err(self.out_of_order("recording"));
        };
        // Reset only when a submission that signals the fence is about to follow.
        self.phase = FramePhase::Idle;
        if let Err(e) = ops.reset_frame_fence().and_then(|()| ops.submit()) {
            return Err(Self::abandon(ops, image_index, e));
        }
        self.phase = FramePhase::Submitted { image_index };
        Ok(())
    }

    pub fn present<O: FrameOps + ?Sized>(&mut self, ops: &mut O) -> Result<FrameStatus> {
        let FramePhase::Submitted { image_index } = self.phase else {
            return Err(self.out_of_order("submitted"));
        };
        self.phase = FramePhase::Idle;

        match ops.present(image_index)? {
            PresentOutcome::Presented { suboptimal: false } => Ok(FrameStatus::Ready),
            PresentOutcome::Presented { suboptimal: true } | PresentOutcome::OutOfDate => {
                warn!("swapchain stale on present; recreating");
                ops.recreate_swapchain()?;
                Ok(FrameStatus::SwapchainRecreated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use std::collections::VecDeque;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Fence {
        Signaled,
        Unsignaled,
        Pending,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Call {
        Wait,
        Acquire,
        Begin(u32),
        Reset,
        Submit,
        Present(u32),
        Recreate,
        Abandon(u32),
    }

    /// Simulated GPU timeline: a submission completes when the host waits on it.
    struct MockGpu {
        fence: Fence,
        clock: u64,
        calls: Vec<Call>,
        wait_done_at: Vec<u64>,
        begin_at: Vec<u64>,
        acquires: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        next_image: u32,
        image_count: u32,
        swapchains_created: usize,
        acquire_signaled: bool,
        images_held: u32,
        fail_begin: bool,
        fail_submit: bool,
    }

    impl MockGpu {
        fn new() -> Self {
            MockGpu {
                fence: Fence::Signaled,
                clock: 0,
                calls: Vec::new(),
                wait_done_at: Vec::new(),
                begin_at: Vec::new(),
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                next_image: 0,
                image_count: 3,
                swapchains_created: 1,
                acquire_signaled: false,
                images_held: 0,
                fail_begin: false,
                fail_submit: false,
            }
        }

        fn tick(&mut self) -> u64 {
            self.clock += 1;
            self.clock
        }

        fn hand_out(&mut self, outcome: AcquireOutcome) -> AcquireOutcome {
            if let AcquireOutcome::Image { .. } = outcome {
                assert!(!self.acquire_signaled, "acquire into a semaphore that is already signaled");
                self.acquire_signaled = true;
                self.images_held += 1;
            }
            outcome
        }
    }

    impl FrameOps for MockGpu {
        fn wait_for_previous_frame(&mut self) -> Result<()> {
            self.calls.push(Call::Wait);
            match self.fence {
                Fence::Unsignaled => panic!("waiting on a fence nothing will signal: deadlock"),
                Fence::Pending | Fence::Signaled => self.fence = Fence::Signaled,
            }
            let t = self.tick();
            self.wait_done_at.push(t);
            Ok(())
        }

        fn acquire_image(&mut self) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire);
            if let Some(outcome) = self.acquires.pop_front() {
                return Ok(self.hand_out(outcome));
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(self.hand_out(AcquireOutcome::Image { index, suboptimal: false }))
        }

        fn begin_recording(&mut self, image_index: u32) -> Result<()> {
            assert_ne!(self.fence, Fence::Pending, "command buffer reset while GPU still reads it");
            self.calls.push(Call::Begin(image_index));
            if std::mem::take(&mut self.fail_begin) {
                return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY.into());
            }
            let t = self.tick();
            self.begin_at.push(t);
            Ok(())
        }

        fn reset_frame_fence(&mut self) -> Result<()> {
            assert_eq!(self.fence, Fence::Signaled, "reset of an in-use fence");
            self.calls.push(Call::Reset);
            self.fence = Fence::Unsignaled;
            Ok(())
        }

        fn submit(&mut self) -> Result<()> {
            assert_eq!(self.fence, Fence::Unsignaled, "submit must signal an unsignaled fence");
            self.calls.push(Call::Submit);
            if std::mem::take(&mut self.fail_submit) {
                return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY.into());
            }
            self.acquire_signaled = false;
            self.fence = Fence::Pending;
            Ok(())
        }

        fn present(&mut self, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(image_index));
            self.images_held -= 1;
            Ok(self
                .presents
                .pop_front()
                .unwrap_or(PresentOutcome::Presented { suboptimal: false }))
        }

        fn recreate_swapchain(&mut self) -> Result<()> {
            self.calls.push(Call::Recreate);
            self.swapchains_created += 1;
            self.next_image = 0;
            self.images_held = 0;
            Ok(())
        }

        fn abandon_frame(&mut self, image_index: u32) -> Result<()> {
            self.calls.push(Call::Abandon(image_index));
            // An empty batch waits on the acquire and signals the fence.
            self.acquire_signaled = false;
            self.fence = Fence::Pending;
            self.swapchains_created += 1;
            self.next_image = 0;
            self.images_held = 0;
            Ok(())
        }
    }

    fn run_frame(frames: &mut FrameLoop, gpu: &mut MockGpu) -> FrameStatus {
        match frames.begin(gpu).unwrap() {
            FrameStatus::Ready => {
                frames.end(gpu).unwrap();
                frames.present(gpu).unwrap()
            }
            skipped => skipped,
        }
    }

    #[test]
    fn steady_state_frame_order() {
        let mut frames = FrameLoop::default();
        let mut gpu = MockGpu::new();
        for _ in 0..2 {
            assert_eq!(run_frame(&mut frames, &mut gpu), FrameStatus::Ready);
        }
        assert_eq!(
            gpu.calls,
            vec![
                Call::Wait,
                Call::Acquire,
                Call::Begin(0),
                Call::Reset,
                Call::Submit,
                Call::Present(0),
                Call::Wait,
                Call::Acquire,
                Call::Begin(1),
                Call::Reset,
                Call::Submit,
                Call::Present(1),
            ]
        );
        assert_eq!(frames.phase(), FramePhase::Idle);
    }

    #[test]
    fn fence_wait_completes_before_every_begin() {
        let mut frames = FrameLoop::default();
        let mut gpu = MockGpu::new();
        for _ in 0..10 {
            run_frame(&mut frames, &mut gpu);
        }
        assert_eq!(gpu.wait_done_at.len(), gpu.begin_at.len());
        for (waited, began) in gpu.wait_done_at.iter().zip(&gpu.begin_at) {
            assert!(waited < began, "wait at {waited} did not precede begin at {began}");
        }
    }

    #[test]
    fn stale_acquire_abandons_frame_and_keeps_fence_signaled() {
        let mut frames = FrameLoop::default();
        let mut gpu = MockGpu::new();
        run_frame(&mut frames, &mut gpu);

        gpu.acquires.push_back(AcquireOutcome::OutOfDate);
        assert_eq!(frames.begin(&mut gpu).unwrap(), FrameStatus::SwapchainRecreated);
        assert_eq!(frames.phase(), FramePhase::Idle);
        assert_eq!(frames.recording_image(), None);
        assert_eq!(gpu.fence, Fence::Signaled);
        assert_eq!(gpu.calls.last(), Some(&Call::Recreate));

        // Next iteration renders against the rebuilt swapchain without deadlocking.
        assert_eq!(run_frame(&mut frames, &mut gpu), FrameStatus::Ready);
        assert!(gpu.calls.ends_with(&[Call::Begin(0), Call::Reset, Call::Submit, Call::Present(0)]));
    }

    #[test]
    fn repeated_staleness_recreates_once_per_frame() {
        let mut frames = FrameLoop::default();
        let mut gpu = MockGpu::new();
        for _ in 0..5 {
            gpu.acquires.push_back(AcquireOutcome::OutOfDate);
        }
        for _ in 0..5 {
            assert_eq!(run_frame(&mut frames, &mut gpu), FrameStatus::SwapchainRecreated);
        }
        assert_eq!(gpu.swapchains_created, 6);
        assert!(!gpu.calls.iter().any(|c| matches!(c, Call::Begin(_) | Call::Submit)));
        assert_eq!(run_frame(&mut frames, &mut gpu), FrameStatus::Ready);
    }

    #[test]
    fn suboptimal_acquire_still_renders() {
        let mut frames = FrameLoop::default();
        let mut gpu = MockGpu::new();
        gpu.acquires
            .push_back(AcquireOutcome::Image { index: 2, suboptimal: true });
        assert_eq!(frames.begin(&mut gpu).unwrap(), FrameStatus::Ready);
        assert_eq!(frames.recording_image(), Some(2));
    }

    #[test]
    fn stale_present_recreates_after_submission() {
        let mut frames = FrameLoop::default();
        let mut gpu = MockGpu::new();
        gpu.presents.push_back(PresentOutcome::OutOfDate);
        gpu.presents.push_back(PresentOutcome::Presented { suboptimal: true });
        assert_eq!(run_frame(&mut frames, &mut gpu), FrameStatus::SwapchainRecreated);
        assert_eq!(run_frame(&mut frames, &mut gpu), FrameStatus::SwapchainRecreated);
        assert_eq!(gpu.swapchains_created, 3);
        assert_eq!(frames.phase(), FramePhase::Idle);
        assert_eq!(run_frame(&mut frames, &mut gpu), FrameStatus::Ready);
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let mut frames = FrameLoop::default();
        let mut gpu = MockGpu::new();

        assert!(matches!(
            frames.end(&mut gpu),
            Err(RenderError::FrameOrder { expected: "recording", found: "idle" })
        ));
        assert!(matches!(
            frames.present(&mut gpu),
            Err(RenderError::FrameOrder { expected: "submitted", found: "idle" })
        ));

        frames.begin(&mut gpu).unwrap();
        assert!(matches!(
            frames.begin(&mut gpu),
            Err(RenderError::FrameOrder { expected: "idle", found: "recording" })
        ));
        assert_eq!(gpu.calls, vec![Call::Wait, Call::Acquire, Call::Begin(0)]);
    }

    #[test]
    fn failed_submit_leaves_fence_for_next_frame() {
        let mut frames = FrameLoop::default();
        let mut gpu = MockGpu::new();
        run_frame(&mut frames, &mut gpu);

        gpu.fail_submit = true;
        assert_eq!(frames.begin(&mut gpu).unwrap(), FrameStatus::Ready);
        assert!(matches!(
            frames.end(&mut gpu),
            Err(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
        ));
        assert_eq!(frames.phase(), FramePhase::Idle);
        assert!(gpu.calls.ends_with(&[Call::Reset, Call::Submit, Call::Abandon(1)]));
        assert_ne!(gpu.fence, Fence::Unsignaled);
        assert!(!gpu.acquire_signaled);

        // The mock panics if this wait could never finish.
        assert_eq!(run_frame(&mut frames, &mut gpu), FrameStatus::Ready);
    }

    #[test]
    fn failed_recording_releases_the_acquired_image() {
        let mut frames = FrameLoop::default();
        let mut gpu = MockGpu::new();

        gpu.fail_begin = true;
        assert!(matches!(
            frames.begin(&mut gpu),
            Err(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
        ));
        assert_eq!(frames.phase(), FramePhase::Idle);
        assert_eq!(gpu.calls.last(), Some(&Call::Abandon(0)));
        assert_eq!(gpu.images_held, 0);
        assert!(!gpu.acquire_signaled);

        assert_eq!(frames.begin(&mut gpu).unwrap(), FrameStatus::Ready);
        assert_eq!(gpu.images_held, 1);
        frames.end(&mut gpu).unwrap();
        assert_eq!(frames.present(&mut gpu).unwrap(), FrameStatus::Ready);
        assert_eq!(gpu.images_held, 0);
    }
}
