//! Additive score bias: broadcast layouts and addressing.

use crate::error::{Error, Result};
use crate::tensor::{HeadCoord, ProblemShape};

/// Element strides of a bias over `(group, member, head, query, key)`.
///
/// Batch index `b` splits into `group = b / group_size` and
/// `member = b % group_size`. A zero stride broadcasts the bias along that
/// axis, and the gradient is summed over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiasLayout {
    pub group_size: usize,
    pub group: usize,
    pub member: usize,
    pub head: usize,
    pub query: usize,
    pub key: usize,
}

impl BiasLayout {
    /// `[batch, seq_q]`: one value per (batch element, query), shared by all
    /// keys and heads.
    pub fn per_query(seq_q: usize) -> Self {
        Self {
            group_size: 1,
            group: seq_q,
            member: 0,
            head: 0,
            query: 1,
            key: 0,
        }
    }

    /// `[batch, seq_k]`: one value per (batch element, key), the key-padding
    /// mask form.
    pub fn per_key(seq_k: usize) -> Self {
        Self {
            group_size: 1,
            group: seq_k,
            member: 0,
            head: 0,
            query: 0,
            key: 1,
        }
    }

    /// `[batch / group_size, heads, seq_q, seq_k]`, shared by the
    /// `group_size` consecutive batch elements of a group.
    pub fn pairwise(group_size: usize, heads: usize, seq_q: usize, seq_k: usize) -> Self {
        Self {
            group_size,
            group: heads * seq_q * seq_k,
            member: 0,
            head: seq_q * seq_k,
            query: seq_k,
            key: 1,
        }
    }

    /// Share the bias across `group_size` consecutive batch elements.
    pub fn grouped(mut self, group_size: usize) -> Self {
        self.group_size = group_size;
        self
    }

    /// Offset of the `(batch, head)` plane.
    #[inline]
    pub fn base(&self, coord: HeadCoord) -> usize {
        (coord.batch / self.group_size) * self.group
            + (coord.batch % self.group_size) * self.member
            + coord.head * self.head
    }

    /// Offset of `(q, k)` within a plane.
    #[inline]
    pub fn offset(&self, q: usize, k: usize) -> usize {
        q * self.query + k * self.key
    }

    /// Extent of one instance's gradient plane once broadcast axes are
    /// reduced to length 1.
    pub fn grad_extent(&self, seq_q: usize, seq_k: usize) -> (usize, usize) {
        (
            if self.query == 0 { 1 } else { seq_q },
            if self.key == 0 { 1 } else { seq_k },
        )
    }

    /// Number of elements the layout addresses for `shape`.
    pub fn required_len(&self, shape: &ProblemShape) -> usize {
        let last_group = (shape.batch - 1) / self.group_size;
        let last_member = (shape.batch - 1).min(self.group_size - 1);
        last_group * self.group
            + last_member * self.member
            + (shape.heads - 1) * self.head
            + (shape.seq_q - 1) * self.query
            + (shape.seq_k - 1) * self.key
            + 1
    }

    pub(crate) fn validate(&self, arg: &'static str, shape: &ProblemShape) -> Result<()> {
        if self.group_size == 0 || shape.batch % self.group_size != 0 {
            return Err(Error::InvalidArgument {
                arg,
                reason: format!(
                    "group_size {} must be positive and divide batch {}",
                    self.group_size, shape.batch
                ),
            });
        }
        Ok(())
    }
}

/// Bias input: flat buffer plus layout.
#[derive(Debug, Clone, Copy)]
pub struct BiasRef<'a, T> {
    pub data: &'a [T],
    pub layout: BiasLayout,
}

impl<'a, T> BiasRef<'a, T> {
    pub fn new(data: &'a [T], layout: BiasLayout) -> Self {
        Self { data, layout }
    }
}
