//! Latest-frame sink with strict resource hygiene: installing a frame
//! releases the previous one, and teardown releases the last.  At most one
//! display frame is alive per session, however many frames arrive.
//!
//! Text messages are server signals, not frames; they are routed by the
//! supervisor and never reach the sink.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

/// One decoded unit of video, ready to display.
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

pub struct FrameSink {
    tx: watch::Sender<Option<Arc<DisplayFrame>>>,
    current: Option<Arc<DisplayFrame>>,
    released: u64,
}

impl FrameSink {
    /// The receiver observes the latest frame; it holds `None` before the
    /// first frame and again after teardown.
    pub fn new() -> (Self, watch::Receiver<Option<Arc<DisplayFrame>>>) {
        let (tx, rx) = watch::channel(None);
        (
            Self {
                tx,
                current: None,
                released: 0,
            },
            rx,
        )
    }

    /// Install `payload` as the current display frame, releasing the
    /// previously displayed one.  Frames are installed in arrival order, so
    /// observers never see a frame older than the current one.
    pub fn install(&mut self, payload: Vec<u8>) {
        let frame = Arc::new(DisplayFrame {
            payload,
            received_at: Instant::now(),
        });
        if self.current.replace(Arc::clone(&frame)).is_some() {
            self.released += 1;
        }
        let _ = self.tx.send(Some(frame));
    }

    /// Release the current frame.  Called on session end and teardown so no
    /// frame resource outlives its session.
    pub fn clear(&mut self) {
        if self.current.take().is_some() {
            self.released += 1;
            let _ = self.tx.send(None);
        }
    }

    pub fn current(&self) -> Option<Arc<DisplayFrame>> {
        self.current.clone()
    }

    /// Number of prior frame resources released so far.
    pub fn released(&self) -> u64 {
        self.released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_frames_leave_one_live_and_n_minus_one_released() {
        let (mut sink, rx) = FrameSink::new();
        for i in 1..=5u8 {
            sink.install(vec![i]);
        }
        assert_eq!(sink.released(), 4);
        assert_eq!(sink.current().unwrap().payload, vec![5]);
        assert_eq!(rx.borrow().as_ref().unwrap().payload, vec![5]);
    }

    #[test]
    fn teardown_releases_the_last_frame() {
        let (mut sink, rx) = FrameSink::new();
        sink.install(vec![1]);
        sink.clear();
        assert_eq!(sink.released(), 1);
        assert!(sink.current().is_none());
        assert!(rx.borrow().is_none());
    }

    #[test]
    fn clearing_an_empty_sink_is_a_no_op() {
        let (mut sink, _rx) = FrameSink::new();
        sink.clear();
        assert_eq!(sink.released(), 0);
    }

    #[test]
    fn observers_follow_arrival_order() {
        let (mut sink, mut rx) = FrameSink::new();
        sink.install(vec![1]);
        sink.install(vec![2]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().payload, vec![2]);
    }
}
