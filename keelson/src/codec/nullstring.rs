//! Null-terminated string codec for the stream transport.
//!
//! Outbound strings are written as their bytes plus a trailing `0x00`.
//! Inbound bytes accumulate in a scratch buffer kept on the session
//! blackboard until a `0x00` arrives, at which point the accumulated bytes
//! are emitted as one string; a value may therefore span many socket reads,
//! and one read may complete many values.

use std::sync::Arc;

use parking_lot::Mutex;

use keelson_core::buffer::Buffer;
use keelson_core::codec::{Decoder, Encoder, PipelineContext};
use keelson_core::error::{Error, Result};

const SCRATCH_KEY: &str = "keelson.nullstring.scratch";

/// The null-terminated string pipeline stage.
pub struct NullString;

impl NullString {
    fn scratch(cx: &dyn PipelineContext<String>) -> Arc<Mutex<Buffer>> {
        if let Some(scratch) = cx
            .load(SCRATCH_KEY)
            .and_then(|value| value.downcast::<Mutex<Buffer>>().ok())
        {
            return scratch;
        }
        let scratch = Arc::new(Mutex::new(cx.alloc()));
        cx.store(SCRATCH_KEY, scratch.clone());
        scratch
    }
}

impl Encoder<Buffer, String> for NullString {
    fn encode(&self, cx: &mut dyn PipelineContext<Buffer>, output: String) -> Result<()> {
        let mut buffer = cx.alloc();
        buffer.write(output.as_bytes())?;
        buffer.write_byte(0)?;
        cx.next(buffer)
    }
}

impl Decoder<Buffer, String> for NullString {
    fn decode(&self, cx: &mut dyn PipelineContext<String>, input: &mut Buffer) -> Result<()> {
        let scratch = Self::scratch(cx);
        while let Some(byte) = input.read_byte()? {
            if byte == 0 {
                let collected = {
                    let mut scratch = scratch.lock();
                    let mut collected = vec![0u8; scratch.len()];
                    let n = scratch.read(&mut collected)?;
                    collected.truncate(n);
                    collected
                };
                let text = String::from_utf8(collected)
                    .map_err(|_| Error::protocol("null-string payload is not UTF-8"))?;
                cx.next(text)?;
            } else {
                scratch.lock().write_byte(byte)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelson_core::blackboard::Blackboard;
    use keelson_core::buffer::BufferPool;
    use keelson_core::codec::Context;
    use std::any::Any;

    struct TestCtx<T> {
        board: Blackboard,
        pool: BufferPool,
        out: Vec<T>,
    }

    impl<T> TestCtx<T> {
        fn new() -> Self {
            Self {
                board: Blackboard::new(),
                pool: BufferPool::new(16),
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

    fn encode_to_bytes(values: &[&str]) -> Vec<u8> {
        let mut cx = TestCtx::<Buffer>::new();
        for value in values {
            NullString.encode(&mut cx, (*value).to_string()).unwrap();
        }
        let mut wire = Vec::new();
        for buffer in &mut cx.out {
            let mut bytes = vec![0u8; buffer.len()];
            let n = buffer.read(&mut bytes).unwrap();
            bytes.truncate(n);
            wire.extend(bytes);
        }
        wire
    }

    #[test]
    fn encode_appends_terminator() {
        assert_eq!(encode_to_bytes(&["hi"]), b"hi\0");
        assert_eq!(encode_to_bytes(&[""]), b"\0");
    }

    #[test]
    fn round_trip_across_fragmented_reads() {
        let wire = encode_to_bytes(&["hello", "world", ""]);
        let pool = BufferPool::new(16);
        let mut cx = TestCtx::<String>::new();
        let mut input = pool.buffer();

        // feed the stream three bytes at a time, decoding after each append
        for piece in wire.chunks(3) {
            input.write(piece).unwrap();
            NullString.decode(&mut cx, &mut input).unwrap();
        }
        assert_eq!(cx.out, vec!["hello", "world", ""]);
        assert!(input.is_empty());
    }

    #[test]
    fn one_read_may_complete_many_values() {
        let wire = encode_to_bytes(&["a", "b", "c"]);
        let pool = BufferPool::new(64);
        let mut cx = TestCtx::<String>::new();
        let mut input = pool.buffer();
        input.write(&wire).unwrap();
        NullString.decode(&mut cx, &mut input).unwrap();
        assert_eq!(cx.out, vec!["a", "b", "c"]);
    }

    #[test]
    fn invalid_utf8_is_a_protocol_error() {
        let pool = BufferPool::new(16);
        let mut cx = TestCtx::<String>::new();
        let mut input = pool.buffer();
        input.write(&[0xFF, 0xFE, 0x00]).unwrap();
        let err = NullString.decode(&mut cx, &mut input).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
