//! Stage traits and composition.

use std::marker::PhantomData;

use crate::error::Result;

use super::{Context, PipelineContext};

/// Transforms an outbound application value of type `A` into zero or more
/// wire-side values of type `W`, emitted through `cx.next`.
pub trait Encoder<W, A>: Send + Sync {
    fn encode(&self, cx: &mut dyn PipelineContext<W>, output: A) -> Result<()>;
}

/// Transforms an inbound wire-side value of type `W` into zero or more
/// application values of type `A`, emitted through `cx.next`.
///
/// The input is borrowed mutably: a streaming decoder consumes as much of
/// it as it can and leaves the remainder for the next call.
pub trait Decoder<W, A>: Send + Sync {
    fn decode(&self, cx: &mut dyn PipelineContext<A>, input: &mut W) -> Result<()>;
}

/// A stage that can run in both directions over the same type pair.
pub trait Pipeline<W, A>: Encoder<W, A> + Decoder<W, A> {}

impl<W, A, T: Encoder<W, A> + Decoder<W, A>> Pipeline<W, A> for T {}

/// Identity stage: forwards every value unchanged in both directions.
pub struct Pass<T>(PhantomData<fn(T) -> T>);

impl<T> Pass<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Pass<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Encoder<T, T> for Pass<T> {
    fn encode(&self, cx: &mut dyn PipelineContext<T>, output: T) -> Result<()> {
        cx.next(output)
    }
}

impl<T: Default> Decoder<T, T> for Pass<T> {
    fn decode(&self, cx: &mut dyn PipelineContext<T>, input: &mut T) -> Result<()> {
        cx.next(std::mem::take(input))
    }
}

/// Compose two stages over a shared between-type `B`.
///
/// Encoding runs the outer (application-side) stage first and feeds each
/// emitted value into the inner stage; decoding is symmetric. Linking is
/// associative: `link(link(a, b), c)` and `link(a, link(b, c))` behave
/// identically.
///
/// The between-type usually cannot be inferred from the arguments alone;
/// spell it out as `link::<_, _, B>(inner, outer)` where needed.
pub fn link<P, Q, B>(input: P, output: Q) -> Linked<P, Q, B> {
    Linked {
        input,
        output,
        between: PhantomData,
    }
}

/// Two stages joined over a between-type. Built by [`link`].
pub struct Linked<P, Q, B> {
    input: P,
    output: Q,
    between: PhantomData<fn(B) -> B>,
}

impl<W, B, A, P, Q> Encoder<W, A> for Linked<P, Q, B>
where
    P: Encoder<W, B>,
    Q: Encoder<B, A>,
{
    fn encode(&self, cx: &mut dyn PipelineContext<W>, output: A) -> Result<()> {
        let mut between = EncodeLink {
            parent: cx,
            inner: &self.input,
        };
        self.output.encode(&mut between, output)
    }
}

impl<W, B, A, P, Q> Decoder<W, A> for Linked<P, Q, B>
where
    P: Decoder<W, B>,
    Q: Decoder<B, A>,
{
    fn decode(&self, cx: &mut dyn PipelineContext<A>, input: &mut W) -> Result<()> {
        let mut between = DecodeLink {
            parent: cx,
            inner: &self.output,
        };
        self.input.decode(&mut between, input)
    }
}

struct EncodeLink<'a, W, B> {
    parent: &'a mut dyn PipelineContext<W>,
    inner: &'a dyn Encoder<W, B>,
}

impl<W, B> Context for EncodeLink<'_, W, B> {
    fn load(&self, key: &str) -> Option<std::sync::Arc<dyn std::any::Any + Send + Sync>> {
        self.parent.load(key)
    }

    fn store(&self, key: &str, value: std::sync::Arc<dyn std::any::Any + Send + Sync>) {
        self.parent.store(key, value);
    }

    fn delete(&self, key: &str) {
        self.parent.delete(key);
    }

    fn alloc(&self) -> crate::buffer::Buffer {
        self.parent.alloc()
    }

    fn close(&self) -> Result<()> {
        self.parent.close()
    }
}

impl<W, B> PipelineContext<B> for EncodeLink<'_, W, B> {
    fn next(&mut self, value: B) -> Result<()> {
        self.inner.encode(&mut *self.parent, value)
    }
}

struct DecodeLink<'a, A, B> {
    parent: &'a mut dyn PipelineContext<A>,
    inner: &'a dyn Decoder<B, A>,
}

impl<A, B> Context for DecodeLink<'_, A, B> {
    fn load(&self, key: &str) -> Option<std::sync::Arc<dyn std::any::Any + Send + Sync>> {
        self.parent.load(key)
    }

    fn store(&self, key: &str, value: std::sync::Arc<dyn std::any::Any + Send + Sync>) {
        self.parent.store(key, value);
    }

    fn delete(&self, key: &str) {
        self.parent.delete(key);
    }

    fn alloc(&self) -> crate::buffer::Buffer {
        self.parent.alloc()
    }

    fn close(&self) -> Result<()> {
        self.parent.close()
    }
}

impl<A, B> PipelineContext<B> for DecodeLink<'_, A, B> {
    fn next(&mut self, value: B) -> Result<()> {
        let mut value = value;
        self.inner.decode(&mut *self.parent, &mut value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::Blackboard;
    use crate::buffer::{Buffer, BufferPool};
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

    /// Adds its offset on decode, subtracts it on encode.
    struct Shift(i64);

    impl Encoder<i64, i64> for Shift {
        fn encode(&self, cx: &mut dyn PipelineContext<i64>, output: i64) -> Result<()> {
            cx.next(output - self.0)
        }
    }

    impl Decoder<i64, i64> for Shift {
        fn decode(&self, cx: &mut dyn PipelineContext<i64>, input: &mut i64) -> Result<()> {
            cx.next(*input + self.0)
        }
    }

    /// Emits each input twice on decode; passes through on encode.
    struct Fanout;

    impl Encoder<i64, i64> for Fanout {
        fn encode(&self, cx: &mut dyn PipelineContext<i64>, output: i64) -> Result<()> {
            cx.next(output)
        }
    }

    impl Decoder<i64, i64> for Fanout {
        fn decode(&self, cx: &mut dyn PipelineContext<i64>, input: &mut i64) -> Result<()> {
            cx.next(*input)?;
            cx.next(*input)
        }
    }

    #[test]
    fn pass_forwards_both_ways() {
        let stage = Pass::<i64>::new();
        let mut cx = TestCtx::new();
        stage.encode(&mut cx, 7).unwrap();
        stage.decode(&mut cx, &mut 8).unwrap();
        assert_eq!(cx.out, vec![7, 8]);
    }

    #[test]
    fn link_threads_values_through_both_stages() {
        let pipeline = link::<_, _, i64>(Shift(1), Shift(10));

        let mut cx = TestCtx::new();
        pipeline.decode(&mut cx, &mut 5).unwrap();
        assert_eq!(cx.out, vec![16]);

        let mut cx = TestCtx::new();
        pipeline.encode(&mut cx, 16).unwrap();
        assert_eq!(cx.out, vec![5]);
    }

    #[test]
    fn link_is_associative() {
        let left = link::<_, _, i64>(link::<_, _, i64>(Shift(1), Shift(10)), Shift(100));
        let right = link::<_, _, i64>(Shift(1), link::<_, _, i64>(Shift(10), Shift(100)));

        for input in [-3i64, 0, 42] {
            let mut a = TestCtx::new();
            let mut b = TestCtx::new();
            left.decode(&mut a, &mut { input }).unwrap();
            right.decode(&mut b, &mut { input }).unwrap();
            assert_eq!(a.out, b.out);

            let mut a = TestCtx::new();
            let mut b = TestCtx::new();
            left.encode(&mut a, input).unwrap();
            right.encode(&mut b, input).unwrap();
            assert_eq!(a.out, b.out);
        }
    }

    #[test]
    fn inner_stage_runs_per_emitted_value() {
        // decode: Fanout duplicates, then Shift(1) bumps each copy
        let pipeline = link::<_, _, i64>(Fanout, Shift(1));
        let mut cx = TestCtx::new();
        pipeline.decode(&mut cx, &mut 4).unwrap();
        assert_eq!(cx.out, vec![5, 5]);
    }

    #[test]
    fn blackboard_reaches_through_links() {
        struct Remember;

        impl Encoder<i64, i64> for Remember {
            fn encode(&self, cx: &mut dyn PipelineContext<i64>, output: i64) -> Result<()> {
                cx.next(output)
            }
        }

        impl Decoder<i64, i64> for Remember {
            fn decode(&self, cx: &mut dyn PipelineContext<i64>, input: &mut i64) -> Result<()> {
                let seen = cx
                    .load("remember.count")
                    .and_then(|v| v.downcast::<i64>().ok())
                    .map_or(0, |v| *v);
                cx.store("remember.count", Arc::new(seen + 1));
                cx.next(*input)
            }
        }

        let pipeline = link::<_, _, i64>(Remember, Shift(0));
        let mut cx = TestCtx::new();
        pipeline.decode(&mut cx, &mut 1).unwrap();
        pipeline.decode(&mut cx, &mut 2).unwrap();
        assert_eq!(
            cx.board.load::<i64>("remember.count").map(|v| *v),
            Some(2)
        );
    }
}
