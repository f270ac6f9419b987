use std::cell::Cell;
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use external_texture::{
    BridgingContext, ExternalImageSource, ExternalTextureVk, FrameState, InteropConfig,
    InteropError, TextureSize,
};
use glvk_procs::ffi::GLuint;
use glvk_procs::mock::MockGl;
use gpu_interop::mock::{DeviceEvent, FakeDevice, FenceBehavior};
use gpu_interop::BridgeState;

type Resolver = Box<dyn Fn(&str) -> *const c_void>;

struct ContextState {
    resolver: Resolver,
    refuse: Cell<bool>,
    current: Cell<bool>,
}

/// Context handle the test keeps a second reference to.
#[derive(Clone)]
struct FakeContext(Rc<ContextState>);

impl FakeContext {
    fn new(resolver: impl Fn(&str) -> *const c_void + 'static) -> Self {
        Self(Rc::new(ContextState {
            resolver: Box::new(resolver),
            refuse: Cell::new(false),
            current: Cell::new(false),
        }))
    }

    fn refuse(&self, refuse: bool) {
        self.0.refuse.set(refuse);
    }

    fn is_current(&self) -> bool {
        self.0.current.get()
    }
}

impl BridgingContext for FakeContext {
    fn make_current(&self) -> bool {
        if self.0.refuse.get() {
            return false;
        }
        self.0.current.set(true);
        true
    }

    fn clear_current(&self) {
        self.0.current.set(false);
    }

    fn get_proc_address(&self, name: &str) -> *const c_void {
        (self.0.resolver)(name)
    }
}

#[derive(Default)]
struct FakeSource {
    attached: Option<GLuint>,
    attaches: usize,
    updates: usize,
    detaches: usize,
    size: Option<TextureSize>,
}

impl ExternalImageSource for FakeSource {
    fn attach(&mut self, texture: GLuint) {
        self.attached = Some(texture);
        self.attaches += 1;
    }

    fn update(&mut self) {
        assert!(self.attached.is_some(), "update before attach");
        self.updates += 1;
    }

    fn detach(&mut self) {
        self.attached = None;
        self.detaches += 1;
    }

    fn dimensions(&self) -> Option<TextureSize> {
        self.size
    }
}

struct Harness {
    mock: MockGl,
    context: FakeContext,
    device: Arc<FakeDevice>,
    bridge: ExternalTextureVk<FakeContext, FakeDevice>,
}

fn harness_with(context: FakeContext, mock: MockGl, config: InteropConfig) -> Harness {
    let device = Arc::new(FakeDevice::new());
    let bridge = ExternalTextureVk::new(context.clone(), Arc::clone(&device), config);
    Harness {
        mock,
        context,
        device,
        bridge,
    }
}

fn harness() -> Harness {
    let mock = MockGl::install();
    let context = FakeContext::new(mock.resolver());
    harness_with(context, mock, InteropConfig::default())
}

#[test]
fn valid_bridge_publishes_readable_texture() {
    let mut h = harness();
    let mut source = FakeSource::default();
    assert!(h.bridge.is_valid());
    assert_eq!(h.bridge.state(), BridgeState::Valid);
    assert!(!h.context.is_current());

    let texture = h.bridge.convert(&mut source, 256, 256).unwrap();

    assert_eq!(texture.size, TextureSize::new(256, 256));
    assert_eq!(texture.format, vk::Format::R8G8B8A8_UNORM);
    assert_eq!(texture.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(h.bridge.last_frame_state(), FrameState::Published);
    assert!(!h.context.is_current());

    let events: Vec<DeviceEvent> = h
        .device
        .events()
        .into_iter()
        .filter(|event| !matches!(event, DeviceEvent::Submit(_)))
        .collect();
    assert_eq!(
        events,
        vec![
            DeviceEvent::Allocate(texture.image, TextureSize::new(256, 256)),
            DeviceEvent::Transition {
                image: texture.image,
                old: vk::ImageLayout::UNDEFINED,
                new: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            },
            DeviceEvent::Transition {
                image: texture.image,
                old: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        ]
    );
    assert_eq!(h.device.submissions(), 2);

    assert_eq!((source.attaches, source.updates, source.detaches), (1, 1, 1));
    // Only the shared texture survives; the per-frame source name is gone.
    assert_eq!(h.mock.live_textures(), 1);
    assert_eq!(h.mock.live_framebuffers(), 0);
    assert_eq!(h.mock.call_count("glDrawArrays"), 1);
}

#[test]
fn blit_runs_between_the_transitions() {
    let mut h = harness();
    h.mock.clear_calls();
    h.bridge
        .convert(&mut FakeSource::default(), 64, 64)
        .unwrap();

    let calls = h.mock.calls();
    let position = |name| calls.iter().position(|call| *call == name).unwrap();
    assert!(position("glTexStorageMem2DEXT") < position("glPushDebugGroupKHR"));
    assert!(position("glPushDebugGroupKHR") < position("glDrawArrays"));
    assert!(position("glFinish") < position("glPopDebugGroupKHR"));
}

#[test]
fn missing_entry_point_fails_without_submission() {
    let mock = MockGl::install();
    let context = FakeContext::new(mock.resolver_without(&["glFramebufferTexture2D"]));
    let mut h = harness_with(context, mock, InteropConfig::default());

    assert!(!h.bridge.is_valid());
    assert_eq!(h.bridge.state(), BridgeState::Invalid);
    assert_eq!(
        h.bridge.construction_error(),
        Some(InteropError::ResolutionFailure {
            missing: vec!["glFramebufferTexture2D"]
        })
    );

    let result = h.bridge.convert(&mut FakeSource::default(), 256, 256);
    assert_eq!(result, Err(InteropError::InvalidBridge));
    assert_eq!(h.bridge.last_frame_state(), FrameState::Failed);
    assert_eq!(h.device.allocations(), 0);
    assert_eq!(h.device.submissions(), 0);
}

#[test]
fn shader_failure_is_permanent() {
    let mock = MockGl::install();
    mock.set_compile_status(false);
    mock.set_info_log("syntax error");
    let context = FakeContext::new(mock.resolver());
    let mut h = harness_with(context, mock, InteropConfig::default());

    assert!(!h.bridge.is_valid());
    assert!(matches!(
        h.bridge.construction_error(),
        Some(InteropError::CompileLinkFailure { .. })
    ));

    h.mock.set_compile_status(true);
    assert_eq!(
        h.bridge.convert(&mut FakeSource::default(), 16, 16),
        Err(InteropError::InvalidBridge)
    );
    assert_eq!(h.device.submissions(), 0);
}

#[test]
fn unavailable_context_at_construction_invalidates() {
    let mock = MockGl::install();
    let context = FakeContext::new(mock.resolver());
    context.refuse(true);
    let h = harness_with(context, mock, InteropConfig::default());

    assert!(!h.bridge.is_valid());
    assert_eq!(
        h.bridge.construction_error(),
        Some(InteropError::ContextAcquisitionFailure)
    );
}

#[test]
fn same_size_allocates_once() {
    let mut h = harness();
    let mut source = FakeSource::default();

    let first = h.bridge.convert(&mut source, 256, 256).unwrap();
    let second = h.bridge.convert(&mut source, 256, 256).unwrap();

    assert_eq!(first.image, second.image);
    assert_eq!(h.device.allocations(), 1);
    assert_eq!(h.device.deallocations(), 0);
    // The second frame starts from the readable layout.
    assert!(h.device.events().contains(&DeviceEvent::Transition {
        image: first.image,
        old: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        new: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }));
}

#[test]
fn resize_reallocates_once() {
    let mut h = harness();
    let mut source = FakeSource::default();

    let small = h.bridge.convert(&mut source, 256, 256).unwrap();
    let large = h.bridge.convert(&mut source, 512, 512).unwrap();

    assert_ne!(small.image, large.image);
    assert_eq!(h.device.allocations(), 2);
    assert_eq!(h.device.deallocations(), 1);

    let lifecycle: Vec<DeviceEvent> = h
        .device
        .events()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                DeviceEvent::Allocate(..) | DeviceEvent::Deallocate(_)
            )
        })
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            DeviceEvent::Allocate(small.image, TextureSize::new(256, 256)),
            DeviceEvent::Deallocate(small.image),
            DeviceEvent::Allocate(large.image, TextureSize::new(512, 512)),
        ]
    );
}

#[test]
fn release_twice_deallocates_once() {
    let mut h = harness();
    h.bridge
        .convert(&mut FakeSource::default(), 128, 128)
        .unwrap();

    h.bridge.release();
    h.bridge.release();

    assert_eq!(h.device.deallocations(), 1);
    assert_eq!(h.device.live_images(), 0);
    assert_eq!(h.mock.live_textures(), 0);
    assert_eq!(h.mock.live_memory_objects(), 0);
    assert_eq!(h.mock.live_programs(), 0);
    assert!(!h.context.is_current());

    assert!(!h.bridge.is_valid());
    assert_eq!(
        h.bridge.convert(&mut FakeSource::default(), 128, 128),
        Err(InteropError::InvalidBridge)
    );

    // Dropping after an explicit release is also a no-op.
    let Harness { device, bridge, .. } = h;
    drop(bridge);
    assert_eq!(device.deallocations(), 1);
}

#[test]
fn drop_releases() {
    let h = harness();
    let Harness {
        mock,
        device,
        mut bridge,
        ..
    } = h;
    bridge.convert(&mut FakeSource::default(), 32, 32).unwrap();

    drop(bridge);

    assert_eq!(device.deallocations(), 1);
    assert_eq!(mock.live_programs(), 0);
    assert_eq!(mock.live_textures(), 0);
}

#[test]
fn detach_keeps_the_bridge_usable() {
    let mut h = harness();
    let mut source = FakeSource::default();
    h.bridge.convert(&mut source, 32, 32).unwrap();

    h.bridge.detach();
    assert_eq!(h.device.deallocations(), 1);
    assert!(h.bridge.is_valid());

    h.bridge.convert(&mut source, 32, 32).unwrap();
    assert_eq!(h.device.allocations(), 2);
}

#[test]
fn lost_context_drops_the_frame_and_the_texture() {
    let mut h = harness();
    let mut source = FakeSource::default();
    h.bridge.convert(&mut source, 64, 64).unwrap();

    h.context.refuse(true);
    assert_eq!(
        h.bridge.convert(&mut source, 64, 64),
        Err(InteropError::ContextAcquisitionFailure)
    );
    assert_eq!(h.bridge.last_frame_state(), FrameState::Failed);
    assert_eq!(h.device.deallocations(), 1);
    assert_eq!(source.attaches, 1);

    h.context.refuse(false);
    h.bridge.convert(&mut source, 64, 64).unwrap();
    assert_eq!(h.device.allocations(), 2);
}

#[test]
fn slow_queue_times_out_and_recovers() {
    let mock = MockGl::install();
    let context = FakeContext::new(mock.resolver());
    let config = InteropConfig {
        fence_timeout: Duration::from_millis(20),
        ..InteropConfig::default()
    };
    let mut h = harness_with(context, mock, config);
    let mut source = FakeSource::default();
    h.device.set_fence_behavior(FenceBehavior::Hang);

    let started = Instant::now();
    let result = h.bridge.convert(&mut source, 256, 256);
    assert_eq!(
        result,
        Err(InteropError::FenceTimeout(Duration::from_millis(20)))
    );
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.bridge.last_frame_state(), FrameState::Failed);
    assert!(h.bridge.is_valid());
    assert!(!h.context.is_current());
    // The source texture is still cleaned up.
    assert_eq!(source.detaches, 1);
    assert_eq!(h.mock.live_textures(), 1);
    assert_eq!(h.mock.call_count("glDrawArrays"), 0);

    h.device.set_fence_behavior(FenceBehavior::Signal);
    h.device.signal_hung_fences();
    let texture = h.bridge.convert(&mut source, 256, 256).unwrap();
    assert_eq!(texture.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(h.device.allocations(), 1);
    assert_eq!(h.device.live_fences(), 0);
}

fn timed_out_harness() -> (Harness, FakeSource, vk::Image) {
    let mock = MockGl::install();
    let context = FakeContext::new(mock.resolver());
    let config = InteropConfig {
        fence_timeout: Duration::from_millis(20),
        ..InteropConfig::default()
    };
    let mut h = harness_with(context, mock, config);
    let mut source = FakeSource::default();
    h.device.set_fence_behavior(FenceBehavior::Hang);
    assert!(matches!(
        h.bridge.convert(&mut source, 256, 256),
        Err(InteropError::FenceTimeout(_))
    ));
    assert_eq!(h.device.live_fences(), 1);
    let image = match h.device.events().first() {
        Some(DeviceEvent::Allocate(image, _)) => *image,
        other => panic!("expected an allocation first, got {other:?}"),
    };
    // The queue stays stuck on the parked transition.
    h.device.set_fence_behavior(FenceBehavior::Signal);
    (h, source, image)
}

fn waited_before_freeing(events: &[DeviceEvent], image: vk::Image) -> bool {
    let wait = events.iter().position(|event| *event == DeviceEvent::WaitIdle);
    let free = events
        .iter()
        .position(|event| *event == DeviceEvent::Deallocate(image));
    matches!((wait, free), (Some(wait), Some(free)) if wait < free)
}

#[test]
fn resize_after_timeout_waits_before_freeing() {
    let (mut h, mut source, old_image) = timed_out_harness();

    let texture = h.bridge.convert(&mut source, 512, 512).unwrap();

    assert_eq!(texture.size, TextureSize::new(512, 512));
    assert_eq!(h.device.wait_idle_calls(), 1);
    assert!(waited_before_freeing(&h.device.events(), old_image));
    assert_eq!(h.device.live_fences(), 0);
    assert_eq!(h.device.live_command_buffers(), 0);
}

#[test]
fn lost_context_after_timeout_waits_before_freeing() {
    let (mut h, mut source, old_image) = timed_out_harness();

    h.context.refuse(true);
    assert_eq!(
        h.bridge.convert(&mut source, 256, 256),
        Err(InteropError::ContextAcquisitionFailure)
    );

    assert_eq!(h.device.wait_idle_calls(), 1);
    assert!(waited_before_freeing(&h.device.events(), old_image));
    assert_eq!(h.device.live_images(), 0);
    assert_eq!(h.device.live_fences(), 0);

    h.context.refuse(false);
    assert!(h.bridge.convert(&mut source, 256, 256).is_ok());
}

#[test]
fn resize_after_recovered_timeout_needs_no_queue_wait() {
    let (mut h, mut source, _) = timed_out_harness();
    h.device.signal_hung_fences();

    h.bridge.convert(&mut source, 128, 128).unwrap();

    assert_eq!(h.device.wait_idle_calls(), 0);
    assert_eq!(h.device.live_fences(), 0);
}

#[test]
fn submission_failure_drops_the_frame() {
    let mut h = harness();
    h.device.set_fence_behavior(FenceBehavior::SubmitError);

    let result = h.bridge.convert(&mut FakeSource::default(), 16, 16);
    assert!(matches!(result, Err(InteropError::SubmissionFailure(_))));
    assert!(h.bridge.is_valid());

    h.device.set_fence_behavior(FenceBehavior::Signal);
    assert!(h.bridge.convert(&mut FakeSource::default(), 16, 16).is_ok());
}

#[test]
fn allocation_failure_drops_the_frame() {
    let mut h = harness();
    h.device.fail_allocations(true);

    let result = h.bridge.convert(&mut FakeSource::default(), 16, 16);
    assert!(matches!(result, Err(InteropError::AllocationFailure(_))));
    assert_eq!(h.bridge.last_frame_state(), FrameState::Failed);
    assert_eq!(h.device.submissions(), 0);

    h.device.fail_allocations(false);
    assert!(h.bridge.convert(&mut FakeSource::default(), 16, 16).is_ok());
}

#[test]
fn incomplete_framebuffer_publishes_nothing() {
    let mut h = harness();
    let mut source = FakeSource::default();
    h.mock
        .set_framebuffer_status(gl::FRAMEBUFFER_INCOMPLETE_ATTACHMENT);

    let result = h.bridge.convert(&mut source, 16, 16);
    assert_eq!(
        result,
        Err(InteropError::IncompleteFramebuffer(
            gl::FRAMEBUFFER_INCOMPLETE_ATTACHMENT
        ))
    );
    assert_eq!(source.detaches, 1);
    assert_eq!(h.mock.live_textures(), 1);
    // Only the pre-blit transition ran.
    assert_eq!(h.device.submissions(), 1);
}

#[test]
fn empty_frames_are_rejected() {
    let mut h = harness();
    let mut source = FakeSource::default();

    assert_eq!(
        h.bridge.convert(&mut source, 0, 720),
        Err(InteropError::EmptyFrame {
            width: 0,
            height: 720
        })
    );
    assert_eq!(
        h.bridge.convert_latest(&mut source),
        Err(InteropError::EmptyFrame {
            width: 0,
            height: 0
        })
    );
    assert_eq!(h.device.allocations(), 0);

    source.size = Some(TextureSize::new(320, 240));
    let texture = h.bridge.convert_latest(&mut source).unwrap();
    assert_eq!(texture.size, TextureSize::new(320, 240));
}
