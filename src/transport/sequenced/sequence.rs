//! Sequence number strategies.
//! 序列号生成策略。

use rand::distr::{Distribution, StandardUniform};

/// Derives the next sequence number from the previous one (`None` before the
/// first request).
///
/// 根据上一个序列号（首个请求之前为 `None`）推导下一个序列号。
pub trait SequenceStrategy<S>: Send + Sync + 'static {
    fn next(&self, previous: Option<S>) -> S;
}

/// `1, 2, 3, ...`, wrapping at the integer width.
/// `1, 2, 3, ...`，按整数宽度回绕。
#[derive(Debug, Clone, Copy, Default)]
pub struct Incrementing;

macro_rules! impl_incrementing {
    ($($ty:ty),*) => {
        $(
            impl SequenceStrategy<$ty> for Incrementing {
                fn next(&self, previous: Option<$ty>) -> $ty {
                    previous.map_or(1, |previous| previous.wrapping_add(1))
                }
            }
        )*
    };
}

impl_incrementing!(u8, u16, u32, u64);

/// Uniformly random numbers, never repeating the previous one.
/// 均匀随机数，且不会与上一个重复。
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSequence;

impl<S> SequenceStrategy<S> for RandomSequence
where
    S: PartialEq,
    StandardUniform: Distribution<S>,
{
    fn next(&self, previous: Option<S>) -> S {
        loop {
            let candidate: S = rand::random();
            if previous.as_ref() != Some(&candidate) {
                return candidate;
            }
        }
    }
}
