//! Text frame codec for the framed transport.

use keelson_core::codec::{Decoder, Encoder, PipelineContext};
use keelson_core::error::{Error, Result};
use keelson_net::frame::Frame;

/// Maps strings to and from text frames. Control frames (ping/pong) are
/// dropped on decode; heartbeat policy belongs to the application.
pub struct TextFrame;

impl Encoder<Frame, String> for TextFrame {
    fn encode(&self, cx: &mut dyn PipelineContext<Frame>, output: String) -> Result<()> {
        cx.next(Frame::text(output))
    }
}

impl Decoder<Frame, String> for TextFrame {
    fn decode(&self, cx: &mut dyn PipelineContext<String>, input: &mut Frame) -> Result<()> {
        if input.is_control() {
            return Ok(());
        }
        let text = String::from_utf8(input.payload.to_vec())
            .map_err(|_| Error::protocol("text frame payload is not UTF-8"))?;
        cx.next(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelson_core::blackboard::Blackboard;
    use keelson_core::buffer::{Buffer, BufferPool};
    use keelson_core::codec::Context;
    use keelson_net::frame::FrameKind;
    use std::any::Any;
    use std::sync::Arc;

    struct TestCtx<T> {
        board: Blackboard,
        pool: BufferPool,
        out: Vec<T>,
    }

    impl<T> TestCtx<T> {
        fn new() -> Self {
            Self {
                board: Blackboard::new(),
                pool: BufferPool::new(64),
                out: Vec::new(),
            }
        }
    }

    impl<T> Context for TestCtx<T> {
        fn load(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
            self.board.load_any(key)
        }

        fn store(&self, key: &str, value: Arc<dyn Any + Send + Sync>) {
            self.board.store_any(key, value);
        }

        fn delete(&self, key: &str) {
            self.board.delete(key);
        }

        fn alloc(&self) -> Buffer {
            self.pool.buffer()
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    impl<T> PipelineContext<T> for TestCtx<T> {
        fn next(&mut self, value: T) -> Result<()> {
            self.out.push(value);
            Ok(())
        }
    }

    #[test]
    fn string_to_text_frame_and_back() {
        let mut cx = TestCtx::<Frame>::new();
        TextFrame.encode(&mut cx, "ping".to_string()).unwrap();
        assert_eq!(cx.out.len(), 1);
        assert_eq!(cx.out[0].kind, FrameKind::Text);

        let mut frame = cx.out.remove(0);
        let mut cx = TestCtx::<String>::new();
        TextFrame.decode(&mut cx, &mut frame).unwrap();
        assert_eq!(cx.out, vec!["ping"]);
    }

    #[test]
    fn control_frames_are_dropped() {
        let mut cx = TestCtx::<String>::new();
        let mut ping = Frame::new(FrameKind::Ping, "beat");
        TextFrame.decode(&mut cx, &mut ping).unwrap();
        assert!(cx.out.is_empty());
    }

    #[test]
    fn empty_frame_decodes_to_empty_string() {
        let mut cx = TestCtx::<String>::new();
        let mut frame = Frame::text("");
        TextFrame.decode(&mut cx, &mut frame).unwrap();
        assert_eq!(cx.out, vec![String::new()]);
    }
}
