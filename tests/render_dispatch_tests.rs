// Render dispatch integration tests for wlsink
//
// Drives a VideoSink against the headless compositor and checks frame
// pacing, buffer-source selection and fatal window events.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wlsink::buffer::memory::MemoryKind;
use wlsink::display::Display;
use wlsink::protocol::headless::HeadlessBackend;
use wlsink::protocol::ProtocolEvent;
use wlsink::{
    BufferSource, DropReason, MemfdAllocator, Memory, MemoryAllocator, MemoryDomain, RenderOutcome, SinkConfig,
    SinkError, SinkHost, VideoFormat, VideoFrame, VideoInfo, VideoSink,
};

struct TestHost {
    display: Arc<Display>,
    fatal: AtomicUsize,
}

impl SinkHost for TestHost {
    fn need_display(&self) -> Option<Arc<Display>> {
        Some(self.display.clone())
    }

    fn on_fatal_error(&self, _error: &SinkError) {
        self.fatal.fetch_add(1, Ordering::SeqCst);
    }
}

fn setup_with(backend: HeadlessBackend, config: &SinkConfig) -> (Arc<HeadlessBackend>, Arc<TestHost>, VideoSink) {
    let backend = Arc::new(backend);
    let display = Arc::new(Display::with_backend(backend.clone(), false).unwrap());
    let host = Arc::new(TestHost {
        display,
        fatal: AtomicUsize::new(0),
    });
    let sink = VideoSink::new(config, host.clone());
    (backend, host, sink)
}

fn setup() -> (Arc<HeadlessBackend>, Arc<TestHost>, VideoSink) {
    setup_with(HeadlessBackend::new(), &SinkConfig::default())
}

fn heap_frame(info: &VideoInfo) -> VideoFrame {
    VideoFrame::new(Memory::from_vec(vec![0x40; info.size]))
}

fn dmabuf_frame(info: &VideoInfo) -> VideoFrame {
    let file = tempfile::tempfile().unwrap();
    file.set_len(info.size as u64).unwrap();
    let fd: OwnedFd = file.into();
    VideoFrame::new(Memory::from_fd(fd, info.size, MemoryKind::Dmabuf))
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn present(backend: &HeadlessBackend, sink: &VideoSink) {
    backend.complete_frames();
    assert!(wait_until(|| !sink.is_frame_pending()), "frame callback never arrived");
}

#[test]
fn test_pending_frames_issue_no_requests() {
    let (backend, _host, sink) = setup();
    let info = VideoInfo::new(VideoFormat::BGRx, 64, 48);
    sink.set_caps(info.clone()).unwrap();

    assert!(matches!(sink.render(&heap_frame(&info)).unwrap(), RenderOutcome::Rendered(_)));
    let video = sink.with_window(|w| w.video_surface()).unwrap();
    let before = backend.surface(video).unwrap();
    let frame_requests = backend.frame_requests();

    for _ in 0..5 {
        let outcome = sink.render(&heap_frame(&info)).unwrap();
        assert_eq!(outcome, RenderOutcome::Dropped(DropReason::CallbackPending));
    }

    let after = backend.surface(video).unwrap();
    assert_eq!(after.attaches, before.attaches);
    assert_eq!(after.commits, before.commits);
    assert_eq!(backend.frame_requests(), frame_requests);
    assert_eq!(sink.stats().dropped(DropReason::CallbackPending), 5);
}

#[test]
fn test_duplicate_callback_transitions_once() {
    let (backend, _host, sink) = setup();
    let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
    sink.set_caps(info.clone()).unwrap();
    sink.render(&heap_frame(&info)).unwrap();

    let callback = sink.pending_callback().unwrap();
    backend.push_event(ProtocolEvent::FrameDone { callback, time: 0 });
    backend.push_event(ProtocolEvent::FrameDone { callback, time: 0 });
    assert!(wait_until(|| sink.stats().stale_callbacks == 1));

    let stats = sink.stats();
    assert_eq!(stats.completed, 1);
    assert!(!sink.is_frame_pending());
}

#[test]
fn test_buffer_source_order() {
    let (backend, _host, sink) = setup();
    let info = VideoInfo::new(VideoFormat::BGRx, 64, 48);
    sink.set_caps(info.clone()).unwrap();

    let outcome = sink.render(&dmabuf_frame(&info)).unwrap();
    assert_eq!(outcome, RenderOutcome::Rendered(BufferSource::Dmabuf));
    present(&backend, &sink);

    let shm = MemfdAllocator::new().allocate(info.format, info.width, info.height).unwrap();
    let outcome = sink.render(&VideoFrame::new(shm)).unwrap();
    assert_eq!(outcome, RenderOutcome::Rendered(BufferSource::Shm));
    present(&backend, &sink);

    let outcome = sink.render(&heap_frame(&info)).unwrap();
    assert_eq!(outcome, RenderOutcome::Rendered(BufferSource::Copy));
}

#[test]
fn test_planar_shm_frame_is_wrapped_directly() {
    let (_backend, _host, sink) = setup();
    // I420 is offered over wl_shm only
    let info = VideoInfo::new(VideoFormat::I420, 64, 48);
    sink.set_caps(info.clone()).unwrap();

    let memory = MemfdAllocator::new().allocate(info.format, info.width, info.height).unwrap();
    let outcome = sink.render(&VideoFrame::new(memory)).unwrap();
    assert_eq!(outcome, RenderOutcome::Rendered(BufferSource::Shm));
}

#[test]
fn test_unimportable_dmabuf_cannot_be_copied() {
    let (_backend, _host, sink) = setup();
    let info = VideoInfo::new(VideoFormat::I420, 64, 48);
    sink.set_caps(info.clone()).unwrap();

    // Not importable by the compositor, and GPU memory cannot be mapped for a copy
    let err = sink.render(&dmabuf_frame(&info)).unwrap_err();
    assert!(matches!(err, SinkError::Allocation(_)));
    assert!(!sink.is_frame_pending());
}

#[test]
fn test_same_buffer_is_not_shown_twice() {
    let (backend, _host, sink) = setup();
    let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
    sink.set_caps(info.clone()).unwrap();

    let memory = MemfdAllocator::new().allocate(info.format, info.width, info.height).unwrap();
    let frame = VideoFrame::new(memory);
    assert_eq!(sink.render(&frame).unwrap(), RenderOutcome::Rendered(BufferSource::Shm));
    present(&backend, &sink);

    let buffers = backend.live_buffers();
    assert_eq!(sink.render(&frame).unwrap(), RenderOutcome::Dropped(DropReason::AlreadyShown));
    assert_eq!(backend.live_buffers(), buffers);
}

#[test]
fn test_afbc_frames_have_no_cpu_fallback() {
    let (_backend, _host, sink) = setup();
    let info = VideoInfo::new(VideoFormat::NV12, 64, 48)
        .with_domain(MemoryDomain::Dmabuf)
        .with_afbc(true);
    sink.set_caps(info.clone()).unwrap();

    let err = sink.render(&heap_frame(&info)).unwrap_err();
    assert!(matches!(err, SinkError::Allocation(_)));
    assert!(!sink.is_frame_pending());
}

#[test]
fn test_failed_buffer_creation_leaves_pacer_idle() {
    let (backend, _host, sink) = setup();
    let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
    sink.set_caps(info.clone()).unwrap();
    // Creates the window and the copy pool
    sink.render(&heap_frame(&info)).unwrap();
    present(&backend, &sink);

    backend.fail_next_buffer("out of memory");
    let err = sink.render(&heap_frame(&info)).unwrap_err();
    assert!(matches!(err, SinkError::Allocation(_)));
    assert!(!sink.is_frame_pending());
}

#[test]
fn test_sync_frame_waits_for_presentation() {
    let mut config = SinkConfig::default();
    config.display.sync_frame = true;
    let (_backend, _host, sink) = setup_with(HeadlessBackend::new().auto_frame_done(true), &config);
    let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
    sink.set_caps(info.clone()).unwrap();

    for _ in 0..3 {
        assert!(matches!(sink.render(&heap_frame(&info)).unwrap(), RenderOutcome::Rendered(_)));
        assert!(!sink.is_frame_pending());
    }
    assert_eq!(sink.stats().completed, 3);
}

#[test]
fn test_expose_redraws_when_idle() {
    let (backend, _host, sink) = setup();
    let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
    sink.set_caps(info.clone()).unwrap();
    sink.render(&heap_frame(&info)).unwrap();

    let requests = backend.frame_requests();
    sink.expose().unwrap();
    assert_eq!(backend.frame_requests(), requests, "no redraw while a callback is pending");

    present(&backend, &sink);
    sink.expose().unwrap();
    assert_eq!(backend.frame_requests(), requests + 1);
    assert!(sink.is_frame_pending());
}

#[test]
fn test_window_close_is_reported_once_and_sticks() {
    let (backend, host, sink) = setup();
    let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
    sink.set_caps(info.clone()).unwrap();
    sink.render(&heap_frame(&info)).unwrap();

    let (toplevel, _) = backend.toplevels()[0].clone();
    backend.close_toplevel(toplevel);
    assert!(wait_until(|| sink.is_window_closed()));
    assert!(wait_until(|| host.fatal.load(Ordering::SeqCst) == 1));

    for _ in 0..2 {
        assert!(matches!(sink.render(&heap_frame(&info)), Err(SinkError::WindowClosed)));
    }
}

#[test]
fn test_connection_loss_surfaces_on_next_render() {
    let (backend, host, sink) = setup();
    let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
    sink.set_caps(info.clone()).unwrap();
    sink.render(&heap_frame(&info)).unwrap();

    backend.fail_dispatch("broken pipe");
    assert!(wait_until(|| host.fatal.load(Ordering::SeqCst) == 1));

    let err = sink.render(&heap_frame(&info)).unwrap_err();
    assert!(matches!(err, SinkError::ProtocolIo(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_smallest_copy_pool_keeps_rendering() {
    let mut config = SinkConfig::default();
    config.pool.min_buffers = 1;
    config.pool.max_buffers = 1;
    let (backend, host, sink) = setup_with(HeadlessBackend::new(), &config);
    let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
    sink.set_caps(info.clone()).unwrap();

    let mut shown = Vec::new();
    for n in 0..4 {
        let outcome = sink.render(&heap_frame(&info)).unwrap();
        assert_eq!(outcome, RenderOutcome::Rendered(BufferSource::Copy), "frame {}", n);
        let video = sink.with_window(|w| w.video_surface()).unwrap();
        let buffer = backend.surface(video).unwrap().buffer.unwrap();
        present(&backend, &sink);

        // A compositor may release the buffer it still shows; the copy must not reuse it
        backend.release_buffer(buffer);
        assert!(wait_until(|| host
            .display
            .registry()
            .lookup_by_server(buffer)
            .is_some_and(|b| !b.is_busy())));
        shown.push(buffer);
    }

    assert!(shown.windows(2).all(|pair| pair[0] != pair[1]));
    assert_eq!(sink.stats().dropped(DropReason::AlreadyShown), 0);
}
